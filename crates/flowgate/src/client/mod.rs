pub mod dns;
pub mod hbone;
pub mod pool;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::{DnsName, ServerName};
use socket2::TcpKeepalive;
use tokio::net::TcpStream;
use tracing::{debug, event, trace};

use crate::http::backendtls::BackendTLS;
use crate::proxy::ProxyError;
use crate::transport::stream::Socket;
use crate::types::agent::Target;

/// How to reach a backend on the wire.
#[derive(Default, Debug, Clone, Hash, PartialEq, Eq)]
pub enum Transport {
	#[default]
	Plaintext,
	Tls(BackendTLS),
	Hbone(SocketAddr),
}

impl Transport {
	pub fn name(&self) -> &'static str {
		match self {
			Transport::Plaintext => "plaintext",
			Transport::Tls(_) => "tls",
			Transport::Hbone(_) => "hbone",
		}
	}

	pub fn scheme(&self) -> crate::http::Scheme {
		match self {
			Transport::Plaintext => crate::http::Scheme::HTTP,
			Transport::Tls(_) => crate::http::Scheme::HTTPS,
			// The tunnel is transparent; the inner request is plaintext.
			Transport::Hbone(_) => crate::http::Scheme::HTTP,
		}
	}
}

impl From<Option<BackendTLS>> for Transport {
	fn from(tls: Option<BackendTLS>) -> Self {
		match tls {
			Some(tls) => Transport::Tls(tls),
			None => Transport::Plaintext,
		}
	}
}

pub struct Call {
	pub req: crate::http::Request,
	pub target: Target,
	pub transport: Transport,
}

pub struct TCPCall {
	pub source: Socket,
	pub target: Target,
	pub transport: Transport,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
	#[serde(with = "crate::serdes::serde_dur")]
	pub connect_timeout: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub pool_idle_timeout: Duration,
	pub pool_max_idle_per_host: usize,
	pub pool_max_streams_per_conn: usize,
	pub keepalive_enabled: bool,
	#[serde(with = "crate::serdes::serde_dur")]
	pub keepalive_time: Duration,
	#[serde(with = "crate::serdes::serde_dur")]
	pub keepalive_interval: Duration,
	pub keepalive_retries: u32,
}

impl Default for BackendConfig {
	fn default() -> Self {
		BackendConfig {
			connect_timeout: Duration::from_secs(10),
			pool_idle_timeout: Duration::from_secs(90),
			pool_max_idle_per_host: 8,
			pool_max_streams_per_conn: 100,
			keepalive_enabled: true,
			keepalive_time: Duration::from_secs(180),
			keepalive_interval: Duration::from_secs(180),
			keepalive_retries: 9,
		}
	}
}

#[derive(Clone)]
pub struct Client {
	resolver: Arc<dns::CachedResolver>,
	pool: Arc<pool::Pool>,
	cfg: Arc<BackendConfig>,
	hbone_identity: Option<hbone::Identity>,
	metrics: Option<Arc<crate::telemetry::metrics::Metrics>>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish_non_exhaustive()
	}
}

impl Client {
	pub fn new(
		cfg: BackendConfig,
		hbone_identity: Option<hbone::Identity>,
		metrics: Option<Arc<crate::telemetry::metrics::Metrics>>,
	) -> Client {
		let pool = pool::Pool::new(pool::PoolConfig {
			idle_timeout: cfg.pool_idle_timeout,
			max_idle_per_host: cfg.pool_max_idle_per_host,
			max_streams_per_conn: cfg.pool_max_streams_per_conn,
		});
		Client {
			resolver: Arc::new(dns::CachedResolver::new(None)),
			pool,
			cfg: Arc::new(cfg),
			hbone_identity,
			metrics,
		}
	}

	/// Dispatch an HTTP request to a resolved target over the given
	/// transport, reusing pooled connections where possible.
	pub async fn call(&self, call: Call) -> Result<crate::http::Response, ProxyError> {
		let start = std::time::Instant::now();
		let Call {
			mut req,
			target,
			transport,
		} = call;
		let addr = self.resolve(&target).await?;
		let h2 = req.version() == ::http::Version::HTTP_2
			|| matches!(&transport, Transport::Tls(t) if t.config.alpn_protocols == vec![b"h2".to_vec()]);

		// Normalize the scheme to the transport; hyper rejects mismatches.
		let scheme = transport.scheme();
		crate::http::modify_req_uri(&mut req, |uri| {
			uri.scheme = Some(scheme);
			if uri.path_and_query.is_none() {
				uri.path_and_query = Some(crate::http::uri::PathAndQuery::from_static("/"));
			}
			Ok(())
		})
		.map_err(ProxyError::Processing)?;

		let key = pool::Key {
			target: target.clone(),
			addr,
			transport: transport.clone(),
			h2,
		};
		trace!(?key, "sending request");
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let resp = self
			.pool
			.request(key, req, self.connect(&target, addr, transport.clone()))
			.await
			.map_err(|e| match e {
				pool::Error::Handshake(e) => ProxyError::UpstreamCallFailed(e.to_string()),
				pool::Error::Dial(e) => ProxyError::DialFailed(e.to_string()),
			});

		event!(
			target: "upstream request",
			parent: None,
			tracing::Level::DEBUG,

			target = %target,
			endpoint = %addr,
			transport = %transport.name(),

			http.method = %method,
			http.path = %path,
			http.status = resp.as_ref().ok().map(|r| r.status().as_u16()).unwrap_or_default(),

			duration_ms = start.elapsed().as_millis() as u64,
		);
		resp
	}

	/// Plain call with target and transport inferred from the URI. Used for
	/// auxiliary traffic (webhooks, token endpoints, JWKS).
	pub async fn simple_call(
		&self,
		req: crate::http::Request,
	) -> Result<crate::http::Response, ProxyError> {
		let scheme = req.uri().scheme().cloned().unwrap_or(crate::http::Scheme::HTTP);
		let host = req.uri().host().ok_or(ProxyError::InvalidRequest)?;
		let port = req
			.uri()
			.port_u16()
			.unwrap_or(if scheme == crate::http::Scheme::HTTPS { 443 } else { 80 });
		let target = Target::try_from((host, port)).map_err(ProxyError::Processing)?;
		let transport = if scheme == crate::http::Scheme::HTTPS {
			Transport::Tls(crate::http::backendtls::SYSTEM_TRUST.clone())
		} else {
			Transport::Plaintext
		};
		self
			.call(Call {
				req,
				target,
				transport,
			})
			.await
	}

	/// Proxy a raw TCP stream to the target.
	pub async fn call_tcp(&self, call: TCPCall) -> Result<(), ProxyError> {
		let TCPCall {
			source,
			target,
			transport,
		} = call;
		let addr = self.resolve(&target).await?;
		let upstream = self
			.connect(&target, addr, transport)
			.await
			.map_err(|e| ProxyError::DialFailed(e.to_string()))?;
		let mut source = source;
		let mut upstream = upstream;
		tokio::io::copy_bidirectional(&mut source, &mut upstream)
			.await
			.map_err(|e| ProxyError::UpstreamCallFailed(e.to_string()))?;
		Ok(())
	}

	async fn resolve(&self, target: &Target) -> Result<SocketAddr, ProxyError> {
		match target {
			Target::Address(addr) => Ok(*addr),
			Target::Hostname(host, port) => {
				let ip = self
					.resolver
					.resolve(host.clone())
					.await
					.map_err(|_| ProxyError::DnsResolution)?;
				Ok(SocketAddr::from((ip, *port)))
			},
		}
	}

	fn connect(
		&self,
		target: &Target,
		addr: SocketAddr,
		transport: Transport,
	) -> impl Future<Output = anyhow::Result<Socket>> + Send + 'static {
		let cfg = self.cfg.clone();
		let target = target.clone();
		let identity = self.hbone_identity.clone();
		let metrics = self.metrics.clone();
		async move {
			let start = std::time::Instant::now();
			let transport_name = transport.name();
			let socket = match transport {
				Transport::Plaintext => {
					let tcp = dial(addr, &cfg).await?;
					Socket::from_tcp(tcp)?
				},
				Transport::Tls(tls) => {
					let tcp = dial(addr, &cfg).await?;
					let sni = match &target {
						Target::Address(a) => ServerName::IpAddress(a.ip().into()),
						Target::Hostname(h, _) => {
							ServerName::DnsName(DnsName::try_from(h.to_string())?)
						},
					};
					let ext = Arc::new(crate::transport::stream::Extension::new());
					let stream = tls::handshake(&tls, sni, tcp)
						.await
						.map_err(|e| anyhow::anyhow!("tls handshake: {e}"))?;
					Socket::from_stream(ext, stream)
				},
				Transport::Hbone(waypoint) => {
					let identity = identity
						.ok_or_else(|| anyhow::anyhow!("hbone requires a local identity"))?;
					let stream = hbone::connect(&identity, waypoint, addr).await?;
					let ext = Arc::new(crate::transport::stream::Extension::new());
					Socket::from_stream(ext, stream)
				},
			};
			if let Some(m) = &metrics {
				m.record_upstream_connect(transport_name, start.elapsed());
			}
			event!(
				target: "upstream tcp",
				parent: None,
				tracing::Level::DEBUG,

				endpoint = %addr,
				transport = %transport_name,
				connect_ms = start.elapsed().as_millis() as u64,

				"connected"
			);
			Ok(socket)
		}
	}
}

async fn dial(addr: SocketAddr, cfg: &BackendConfig) -> anyhow::Result<TcpStream> {
	let stream = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr))
		.await
		.map_err(|_| anyhow::anyhow!("connect timeout to {addr}"))??;
	stream.set_nodelay(true)?;
	if cfg.keepalive_enabled {
		let sock = socket2::SockRef::from(&stream);
		let ka = TcpKeepalive::new()
			.with_time(cfg.keepalive_time)
			.with_interval(cfg.keepalive_interval)
			.with_retries(cfg.keepalive_retries);
		if let Err(e) = sock.set_tcp_keepalive(&ka) {
			debug!("failed to set keepalive on upstream connection: {e}");
		}
	}
	Ok(stream)
}
