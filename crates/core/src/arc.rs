use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

/// Shared pointer that can be atomically replaced.
pub type Atomic<T> = Arc<ArcSwap<T>>;
/// Shared optional pointer that can be atomically replaced.
pub type AtomicOption<T> = Arc<ArcSwapOption<T>>;

pub fn new_atomic<T>(initial: T) -> Atomic<T> {
	Arc::new(ArcSwap::from_pointee(initial))
}

pub fn empty_atomic_option<T>() -> AtomicOption<T> {
	Arc::new(ArcSwapOption::empty())
}
