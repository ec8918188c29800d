//! Graceful drain signaling.
//!
//! A [`DrainTrigger`] broadcasts "start draining" to any number of
//! [`DrainWatcher`] clones, then waits until every watcher has been dropped.
//! Each in-flight connection holds a watcher clone, so completion of the
//! trigger means no work remains.

use std::time::Duration;

use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
	/// Finish in-flight work, discourage new work.
	#[default]
	Graceful,
	/// Terminate as fast as possible.
	Immediate,
}

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(None::<DrainMode>);
	let (guard_tx, guard_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger {
			signal: signal_tx,
			all_dropped: guard_rx,
		},
		DrainWatcher {
			signal: signal_rx,
			_guard: guard_tx,
		},
	)
}

pub struct DrainTrigger {
	signal: watch::Sender<Option<DrainMode>>,
	all_dropped: mpsc::Receiver<()>,
}

impl DrainTrigger {
	/// Signal all watchers and block until every watcher has been dropped.
	pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
		let _ = self.signal.send(Some(mode));
		// recv returns None once every guard sender (watcher) is gone.
		while self.all_dropped.recv().await.is_some() {}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal: watch::Receiver<Option<DrainMode>>,
	_guard: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Resolves when a drain has been requested. Holding the watcher (or the
	/// returned mode) keeps the trigger waiting; drop it to release.
	pub async fn wait_for_drain(mut self) -> DrainMode {
		loop {
			if let Some(mode) = *self.signal.borrow() {
				return mode;
			}
			if self.signal.changed().await.is_err() {
				// Trigger gone without draining; treat as graceful.
				return DrainMode::Graceful;
			}
		}
	}
}

/// Run `f` with a sub-drain, force-terminating it `deadline` after a parent
/// drain starts.
pub async fn run_with_deadline<F, Fut>(
	component: String,
	parent: DrainWatcher,
	deadline: Duration,
	f: F,
) where
	F: FnOnce(DrainWatcher) -> Fut,
	Fut: Future<Output = ()>,
{
	let (sub_trigger, sub_watcher) = new();
	let work = f(sub_watcher);
	tokio::pin!(work);
	tokio::select! {
		_ = &mut work => {
			tracing::debug!(%component, "finished before drain");
		}
		mode = parent.wait_for_drain() => {
			tracing::info!(%component, "drain started");
			let wait = sub_trigger.start_drain_and_wait(mode);
			tokio::select! {
				_ = &mut work => {}
				_ = wait => {}
				_ = tokio::time::sleep(deadline) => {
					tracing::warn!(%component, "drain deadline reached, terminating");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn trigger_waits_for_watchers() {
		let (trigger, watcher) = new();
		let extra = watcher.clone();
		let handle = tokio::spawn(async move {
			let mode = watcher.wait_for_drain().await;
			assert_eq!(mode, DrainMode::Graceful);
			drop(extra);
		});
		trigger.start_drain_and_wait(DrainMode::Graceful).await;
		handle.await.unwrap();
	}
}
