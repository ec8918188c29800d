use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A type-keyed bag of connection attributes (addresses, TLS info) shared
/// between the accept path and every request on the connection.
#[derive(Default, Debug)]
pub struct Extension {
	inner: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Extension {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) {
		self
			.inner
			.write()
			.expect("extension lock")
			.insert(TypeId::of::<T>(), Box::new(value));
	}

	pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
		self
			.inner
			.read()
			.expect("extension lock")
			.get(&TypeId::of::<T>())
			.and_then(|b| b.downcast_ref::<T>())
			.cloned()
	}

	/// Copy an attribute into per-request http extensions.
	pub fn copy<T: Clone + Send + Sync + 'static>(&self, dest: &mut ::http::Extensions) {
		if let Some(v) = self.get::<T>() {
			dest.insert(v);
		}
	}
}

#[derive(Debug, Clone)]
pub struct TCPConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct TLSConnectionInfo {
	pub server_name: Option<String>,
	pub alpn: Option<Vec<u8>>,
}

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// A downstream or upstream byte stream plus its connection attributes.
pub struct Socket {
	ext: Arc<Extension>,
	inner: Box<dyn AsyncReadWrite>,
}

impl std::fmt::Debug for Socket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Socket").finish_non_exhaustive()
	}
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Socket> {
		stream.set_nodelay(true)?;
		let ext = Extension::new();
		ext.insert(TCPConnectionInfo {
			peer_addr: stream.peer_addr()?,
			local_addr: stream.local_addr()?,
			start: Instant::now(),
		});
		Ok(Socket {
			ext: Arc::new(ext),
			inner: Box::new(stream),
		})
	}

	/// Wrap an arbitrary stream, inheriting connection attributes. Used for
	/// terminated TLS, TLS passthrough (rewound bytes), and tunneled
	/// streams.
	pub fn from_stream(
		ext: Arc<Extension>,
		stream: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
	) -> Socket {
		Socket {
			ext,
			inner: Box::new(stream),
		}
	}

	pub fn get_ext(&self) -> Arc<Extension> {
		self.ext.clone()
	}

	pub fn ext<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
		self.ext.get::<T>()
	}

	pub fn tcp(&self) -> TCPConnectionInfo {
		self
			.ext
			.get::<TCPConnectionInfo>()
			.expect("tcp info is set at accept")
	}

	/// The address the client connected to; listeners use it for `dynamic`
	/// backend port selection.
	pub fn target_address(&self) -> SocketAddr {
		self.tcp().local_addr
	}

	pub fn into_io(self) -> Box<dyn AsyncReadWrite> {
		self.inner
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut *self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut *self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut *self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut *self.inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut *self.inner).poll_write_vectored(cx, bufs)
	}
}
