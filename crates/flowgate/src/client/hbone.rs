//! HBONE upstream transport: an mTLS connection to a waypoint carrying an
//! HTTP/2 CONNECT tunnel, with the tunneled stream exposed as ordinary IO.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub const HBONE_PORT: u16 = 15008;

/// The local identity used for the outer mTLS handshake, loaded from PEM
/// files at startup.
#[derive(Clone)]
pub struct Identity {
	pub client_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for Identity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Identity").finish_non_exhaustive()
	}
}

impl Identity {
	pub fn from_pem(cert: &[u8], key: &[u8], roots_pem: &[u8]) -> anyhow::Result<Identity> {
		let certs = crate::types::agent::parse_cert(cert)?;
		let key = crate::types::agent::parse_key(key)?;
		let mut roots = rustls::RootCertStore::empty();
		for c in crate::types::agent::parse_cert(roots_pem)? {
			roots.add(c)?;
		}
		let mut config = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_client_auth_cert(certs, key)?;
		config.alpn_protocols = vec![b"h2".to_vec()];
		Ok(Identity {
			client_config: Arc::new(config),
		})
	}
}

/// Open a CONNECT tunnel to `target` through the waypoint at `waypoint`.
pub async fn connect(
	identity: &Identity,
	waypoint: SocketAddr,
	target: SocketAddr,
) -> anyhow::Result<H2Stream> {
	let tcp = TcpStream::connect(waypoint).await?;
	tcp.set_nodelay(true)?;
	let connector = TlsConnector::from(identity.client_config.clone());
	let sni = ServerName::IpAddress(waypoint.ip().into());
	let tls = connector.connect(sni, tcp).await?;

	let (mut send_req, conn) = h2::client::handshake(tls).await?;
	tokio::task::spawn(async move {
		if let Err(e) = conn.await {
			tracing::debug!("hbone connection terminated: {e}");
		}
	});

	let req = ::http::Request::builder()
		.method(::http::Method::CONNECT)
		.uri(target.to_string())
		.version(::http::Version::HTTP_2)
		.body(())?;
	let (resp, send) = send_req.send_request(req, false)?;
	let resp = resp.await?;
	if resp.status() != ::http::StatusCode::OK {
		anyhow::bail!("waypoint rejected tunnel: {}", resp.status());
	}
	let recv = resp.into_body();
	Ok(H2Stream {
		send,
		recv,
		read_buf: Bytes::new(),
	})
}

/// Adapt an accepted server-side tunnel stream to ordinary IO. Used by the
/// HBONE listener after answering CONNECT.
pub fn tunnel_stream(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> H2Stream {
	H2Stream {
		send,
		recv,
		read_buf: Bytes::new(),
	}
}

/// An HTTP/2 stream adapted to `AsyncRead`/`AsyncWrite`, honoring h2 flow
/// control on the write side.
pub struct H2Stream {
	send: h2::SendStream<Bytes>,
	recv: h2::RecvStream,
	read_buf: Bytes,
}

impl AsyncRead for H2Stream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let this = &mut *self;
		if this.read_buf.is_empty() {
			match ready!(this.recv.poll_data(cx)) {
				Some(Ok(data)) => {
					let _ = this.recv.flow_control().release_capacity(data.len());
					this.read_buf = data;
				},
				Some(Err(e)) => {
					return Poll::Ready(Err(std::io::Error::other(e)));
				},
				None => return Poll::Ready(Ok(())),
			}
		}
		let n = this.read_buf.len().min(buf.remaining());
		buf.put_slice(&this.read_buf.split_to(n));
		Poll::Ready(Ok(()))
	}
}

impl AsyncWrite for H2Stream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let this = &mut *self;
		this.send.reserve_capacity(buf.len());
		loop {
			match ready!(this.send.poll_capacity(cx)) {
				Some(Ok(0)) => continue,
				Some(Ok(n)) => {
					let n = n.min(buf.len());
					this
						.send
						.send_data(Bytes::copy_from_slice(&buf[..n]), false)
						.map_err(std::io::Error::other)?;
					return Poll::Ready(Ok(n));
				},
				Some(Err(e)) => return Poll::Ready(Err(std::io::Error::other(e))),
				None => {
					return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
				},
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self
			.send
			.send_data(Bytes::new(), true)
			.map_err(std::io::Error::other)?;
		Poll::Ready(Ok(()))
	}
}
