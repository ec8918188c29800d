pub mod rewind;
pub mod stream;

/// Maximum bytes a policy may buffer from a request or response body.
/// Stored in request extensions so every buffering site agrees.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimit(pub usize);

impl BufferLimit {
	pub fn new(limit: usize) -> Self {
		BufferLimit(limit)
	}
}
