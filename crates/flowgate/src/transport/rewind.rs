use std::cmp;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// An IO wrapper that records everything read until [`Rewind::rewind`] is
/// called, then replays the recorded bytes before resuming the underlying
/// stream. Used to peek a TLS ClientHello and hand the intact byte stream to
/// a passthrough backend.
pub struct Rewind<T> {
	buffered: Buffered,
	io: T,
}

enum Buffered {
	Recording(BytesMut),
	Replaying(Option<Bytes>),
}

impl<T> Rewind<T> {
	pub fn new(io: T) -> Self {
		Rewind {
			buffered: Buffered::Recording(BytesMut::new()),
			io,
		}
	}

	/// Switch from recording to replay. May only be called once.
	pub fn rewind(&mut self) {
		match std::mem::replace(&mut self.buffered, Buffered::Replaying(None)) {
			Buffered::Recording(b) => {
				self.buffered = Buffered::Replaying(Some(b.freeze()));
			},
			Buffered::Replaying(_) => unreachable!("rewind called twice"),
		}
	}

	/// Drop the recording and return the raw IO.
	pub fn discard(self) -> T {
		self.io
	}
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let this = &mut *self;
		match &mut this.buffered {
			Buffered::Recording(b) => {
				let before = buf.filled().len();
				ready!(Pin::new(&mut this.io).poll_read(cx, buf))?;
				b.extend_from_slice(&buf.filled()[before..]);
				Poll::Ready(Ok(()))
			},
			Buffered::Replaying(replay) => {
				if let Some(mut bytes) = replay.take()
					&& !bytes.is_empty()
				{
					let n = cmp::min(bytes.len(), buf.remaining());
					buf.put_slice(&bytes[..n]);
					bytes.advance(n);
					if !bytes.is_empty() {
						this.buffered = Buffered::Replaying(Some(bytes));
					}
					return Poll::Ready(Ok(()));
				}
				Pin::new(&mut this.io).poll_read(cx, buf)
			},
		}
	}
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.io).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.io).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.io.is_write_vectored()
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncReadExt;

	use super::*;

	#[tokio::test]
	async fn replays_recorded_bytes() {
		let (client, server) = tokio::io::duplex(64);
		tokio::spawn(async move {
			use tokio::io::AsyncWriteExt;
			let mut client = client;
			client.write_all(b"hello world").await.unwrap();
		});
		let mut r = Rewind::new(server);
		let mut peek = [0u8; 5];
		r.read_exact(&mut peek).await.unwrap();
		assert_eq!(&peek, b"hello");
		r.rewind();
		let mut full = [0u8; 11];
		r.read_exact(&mut full).await.unwrap();
		assert_eq!(&full, b"hello world");
	}
}
