//! The listener/bind runtime: accept loops, TLS termination with SNI-based
//! listener selection, and graceful drain.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use flowgate_core::drain::{DrainMode, DrainWatcher};
use flowgate_core::metrics::DefaultedUnknown;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::ProxyInputs;
use crate::store::FrontendPolicies;
use crate::telemetry::metrics::TCPLabels;
use crate::transport::BufferLimit;
use crate::transport::rewind::Rewind;
use crate::transport::stream::{Socket, TLSConnectionInfo};
use crate::types::agent::{Bind, BindName, BindProtocol, Listener, ListenerProtocol};
use crate::types::frontend;

pub struct Gateway {
	pi: Arc<ProxyInputs>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(pi: Arc<ProxyInputs>, drain: DrainWatcher) -> Gateway {
		Gateway { pi, drain }
	}

	/// Run accept loops for every bind in the snapshot, following snapshot
	/// swaps: new binds start, removed binds stop. In-flight connections on
	/// a removed bind finish naturally.
	pub async fn run(self) {
		let mut js = JoinSet::new();
		let mut active: HashMap<SocketAddr, AbortHandle> = HashMap::new();
		let mut updates = self.pi.store.subscribe();

		loop {
			let snapshot = updates.borrow_and_update().clone();
			let desired: HashMap<SocketAddr, Arc<Bind>> = snapshot
				.binds
				.iter()
				.map(|b| (b.address, b.clone()))
				.collect();
			active.retain(|addr, handle| {
				if desired.contains_key(addr) {
					true
				} else {
					info!(%addr, "removing bind");
					handle.abort();
					false
				}
			});
			for (addr, bind) in desired {
				if active.contains_key(&addr) {
					continue;
				}
				let handle = js.spawn(Self::run_bind(
					self.pi.clone(),
					self.drain.clone(),
					bind,
				));
				active.insert(addr, handle);
			}

			tokio::select! {
				changed = updates.changed() => {
					if changed.is_err() {
						return;
					}
				}
				_ = self.drain.clone().wait_for_drain() => {
					info!("drain started; waiting for binds");
					while js.join_next().await.is_some() {}
					return;
				}
				Some(res) = js.join_next() => {
					warn!("bind terminated: {res:?}");
				}
			}
		}
	}

	async fn run_bind(
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
		bind: Arc<Bind>,
	) -> anyhow::Result<()> {
		let listener = TcpListener::bind(bind.address).await?;
		let name = bind.key.clone();
		info!(bind = %name, address = %bind.address, "started bind");

		let min_deadline = pi.cfg.termination_min_deadline;
		let max_deadline = pi.cfg.termination_max_deadline;
		let (conn_trigger, conn_watcher) = flowgate_core::drain::new();
		let accept_watcher = conn_watcher.clone();

		let accept = async {
			loop {
				match listener.accept().await {
					Ok((stream, _)) => {
						Self::spawn_connection(&pi, &name, stream, accept_watcher.clone())
					},
					Err(e) => {
						debug!(bind = %name, "accept failed: {e}");
					},
				}
			}
		};
		tokio::pin!(accept);

		let mode = tokio::select! {
			_ = &mut accept => unreachable!("accept loop never returns"),
			mode = drain.wait_for_drain() => mode,
		};
		// Keep accepting briefly so clients that raced the drain signal are
		// served rather than reset, then wait for in-flight work.
		info!(bind = %name, "draining bind");
		tokio::select! {
			_ = &mut accept => unreachable!("accept loop never returns"),
			_ = tokio::time::sleep(min_deadline) => {}
		}
		drop(accept);
		drop(conn_watcher);
		let wait = conn_trigger.start_drain_and_wait(mode);
		tokio::select! {
			_ = wait => {
				info!(bind = %name, "bind drained");
			}
			_ = tokio::time::sleep(max_deadline) => {
				warn!(bind = %name, "drain deadline reached, dropping remaining connections");
			}
		}
		Ok(())
	}

	fn spawn_connection(
		pi: &Arc<ProxyInputs>,
		bind_name: &BindName,
		stream: TcpStream,
		drain: DrainWatcher,
	) {
		let Ok(socket) = Socket::from_tcp(stream) else {
			// The peer disconnected before we could look at the socket.
			return;
		};
		let pi = pi.clone();
		let bind_name = bind_name.clone();
		tokio::task::spawn(async move {
			let start = std::time::Instant::now();
			debug!(bind = %bind_name, "connection started");
			Self::proxy_bind(bind_name.clone(), socket, pi, drain).await;
			debug!(bind = %bind_name, dur = ?start.elapsed(), "connection completed");
		});
	}

	pub async fn proxy_bind(
		bind_name: BindName,
		stream: Socket,
		pi: Arc<ProxyInputs>,
		drain: DrainWatcher,
	) {
		let snapshot = pi.store.current();
		let Some(bind) = snapshot.bind(&bind_name) else {
			return;
		};
		let policies = Arc::new(snapshot.frontend_policies(pi.cfg.gateway.clone()));
		let protocol = bind_protocol(&bind);
		pi
			.metrics
			.downstream_connection
			.get_or_create(&TCPLabels {
				bind: Some(&bind_name).into(),
				gateway: DefaultedUnknown::default(),
				listener: DefaultedUnknown::default(),
				protocol,
			})
			.inc();

		match protocol {
			BindProtocol::http => {
				if let Err(e) =
					Self::serve_http(bind_name, pi, None, stream, policies, drain).await
				{
					debug!("connection closed with error: {e}");
				}
			},
			BindProtocol::https => {
				match Self::terminate_tls(&pi, &bind, stream, &policies, &bind_name).await {
					Ok((listener, socket)) => {
						let _ = Self::serve_http(
							bind_name,
							pi,
							Some(listener),
							socket,
							policies,
							drain,
						)
						.await;
					},
					Err(e) => warn!("TLS termination failed: {e}"),
				}
			},
			BindProtocol::tls => {
				match Self::terminate_tls(&pi, &bind, stream, &policies, &bind_name).await {
					Ok((listener, socket)) => {
						super::tcpproxy::proxy(pi, listener, socket).await;
					},
					Err(e) => warn!("TLS termination failed: {e}"),
				}
			},
			BindProtocol::tcp => {
				let Ok(listener) = bind.listeners.get_exactly_one() else {
					warn!("TCP bind requires exactly one listener");
					return;
				};
				super::tcpproxy::proxy(pi, listener, stream).await;
			},
			BindProtocol::hbone => {
				if let Err(e) =
					Self::terminate_hbone(bind_name, pi, stream, policies, drain).await
				{
					warn!("hbone termination failed: {e}");
				}
			},
		}
	}

	async fn serve_http(
		bind_name: BindName,
		pi: Arc<ProxyInputs>,
		selected_listener: Option<Arc<Listener>>,
		stream: Socket,
		policies: Arc<FrontendPolicies>,
		drain: DrainWatcher,
	) -> anyhow::Result<()> {
		let target_address = stream.target_address();
		let server = auto_server(policies.http.as_ref());
		let buffer_limit = policies
			.http
			.as_ref()
			.map(|h| h.max_buffer_size)
			.unwrap_or_else(|| frontend::HTTP::default().max_buffer_size);

		let proxy = super::httpproxy::HTTPProxy {
			bind_name,
			inputs: pi,
			selected_listener,
			target_address,
		};
		let connection = stream.get_ext();
		let serve = server.serve_connection_with_upgrades(
			TokioIo::new(stream),
			hyper::service::service_fn(move |mut req| {
				let proxy = proxy.clone();
				let connection = connection.clone();
				let policies = policies.clone();
				req.extensions_mut().insert(BufferLimit::new(buffer_limit));
				async move {
					Ok::<_, Infallible>(proxy.proxy(connection, &policies, req).await)
				}
			}),
		);
		tokio::pin!(serve);
		// On drain, nudge clients off (GOAWAY / connection: close) and give
		// in-flight requests a chance to finish.
		tokio::select! {
			res = &mut serve => {
				res.map_err(|e| anyhow::anyhow!("{e}"))?;
			}
			mode = drain.wait_for_drain() => {
				serve.as_mut().graceful_shutdown();
				if mode == DrainMode::Graceful {
					let _ = serve.await;
				}
			}
		}
		Ok(())
	}

	/// Peek the ClientHello to select a listener by SNI, then terminate or
	/// pass through based on that listener's protocol. The hello is recorded
	/// so passthrough (and the real handshake) replay it intact.
	async fn terminate_tls(
		pi: &Arc<ProxyInputs>,
		bind: &Arc<Bind>,
		stream: Socket,
		policies: &Arc<FrontendPolicies>,
		bind_name: &BindName,
	) -> anyhow::Result<(Arc<Listener>, Socket)> {
		let tls_defaults = frontend::TLS::default();
		let tls_policy = policies.tls.as_ref().unwrap_or(&tls_defaults);
		let timeout = tls_policy.tls_handshake_timeout;
		let alpn = tls_policy.alpn_bytes();

		let handshake = async {
			use tokio::io::AsyncReadExt;
			let ext = stream.get_ext();
			let mut rewind = Rewind::new(stream.into_io());
			let tls_start = std::time::Instant::now();

			// Drive the sans-io acceptor just far enough to read the hello.
			let mut acceptor = rustls::server::Acceptor::default();
			let accepted = loop {
				let mut buf = [0u8; 16 * 1024];
				let n = rewind.read(&mut buf).await?;
				if n == 0 {
					anyhow::bail!("connection closed during ClientHello");
				}
				let mut cursor = &buf[..n];
				while !cursor.is_empty() {
					if acceptor.read_tls(&mut cursor)? == 0 {
						anyhow::bail!("ClientHello exceeded acceptor buffer");
					}
				}
				match acceptor.accept() {
					Ok(Some(accepted)) => break accepted,
					Ok(None) => continue,
					Err((e, _)) => anyhow::bail!("invalid ClientHello: {e}"),
				}
			};
			let sni = accepted
				.client_hello()
				.server_name()
				.unwrap_or_default()
				.to_string();
			let listener = bind
				.listeners
				.best_match(&sni)
				.ok_or_else(|| anyhow::anyhow!("no TLS listener matches {sni:?}"))?;

			// Replay the recorded bytes for whichever path comes next.
			rewind.rewind();
			match listener.protocol.tls(alpn.as_deref()) {
				Some(config) => {
					let tls = tokio_rustls::TlsAcceptor::from(config)
						.accept(rewind)
						.await?;
					let server_name = {
						let (_, conn) = tls.get_ref();
						conn.server_name().map(|s| s.to_string())
					};
					let alpn = {
						let (_, conn) = tls.get_ref();
						conn.alpn_protocol().map(|a| a.to_vec())
					};
					ext.insert(TLSConnectionInfo { server_name, alpn });
					let protocol = if matches!(listener.protocol, ListenerProtocol::HTTPS(_)) {
						BindProtocol::https
					} else {
						BindProtocol::tls
					};
					pi
						.metrics
						.tls_handshake_duration
						.get_or_create(&TCPLabels {
							bind: Some(bind_name).into(),
							gateway: Some(&listener.gateway_name).into(),
							listener: Some(&listener.name).into(),
							protocol,
						})
						.observe(tls_start.elapsed().as_secs_f64());
					Ok((listener, Socket::from_stream(ext, tls)))
				},
				None => {
					// Passthrough: the backend sees the original byte
					// stream, ClientHello included.
					ext.insert(TLSConnectionInfo {
						server_name: Some(sni),
						alpn: None,
					});
					Ok((listener, Socket::from_stream(ext, rewind)))
				},
			}
		};
		tokio::time::timeout(timeout, handshake).await?
	}

	async fn terminate_hbone(
		bind_name: BindName,
		pi: Arc<ProxyInputs>,
		stream: Socket,
		policies: Arc<FrontendPolicies>,
		drain: DrainWatcher,
	) -> anyhow::Result<()> {
		let Some(identity_cfg) = &pi.cfg.hbone_identity else {
			anyhow::bail!("hbone listener requires a local identity");
		};
		let cert = std::fs::read(&identity_cfg.cert)?;
		let key = std::fs::read(&identity_cfg.key)?;
		let roots = std::fs::read(&identity_cfg.roots)?;
		let server_config = hbone_server_config(&cert, &key, &roots)?;

		let ext = stream.get_ext();
		let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
		let tls = acceptor.accept(stream.into_io()).await?;

		let mut h2 = h2::server::Builder::new()
			.handshake::<_, bytes::Bytes>(tls)
			.await?;
		while let Some(request) = h2.accept().await {
			let (req, mut respond) = request?;
			if req.method() != ::http::Method::CONNECT {
				let _ = respond.send_response(
					::http::Response::builder()
						.status(::http::StatusCode::NOT_IMPLEMENTED)
						.body(())
						.expect("static response must build"),
					true,
				);
				continue;
			}
			let Some(_target) = req.uri().authority() else {
				continue;
			};
			let resp = ::http::Response::builder()
				.status(::http::StatusCode::OK)
				.body(())
				.expect("static response must build");
			let send = match respond.send_response(resp, false) {
				Ok(send) => send,
				Err(e) => {
					warn!("failed to accept tunnel: {e}");
					continue;
				},
			};
			let recv = req.into_body();
			let inner = crate::client::hbone::tunnel_stream(send, recv);
			let socket = Socket::from_stream(ext.clone(), inner);
			let pi = pi.clone();
			let bind_name = bind_name.clone();
			let policies = policies.clone();
			let drain = drain.clone();
			tokio::task::spawn(async move {
				let _ = Self::serve_http(bind_name, pi, None, socket, policies, drain).await;
			});
		}
		Ok(())
	}
}

fn bind_protocol(bind: &Bind) -> BindProtocol {
	let any = |f: fn(&ListenerProtocol) -> bool| bind.listeners.iter().any(|l| f(&l.protocol));
	if any(|p| matches!(p, ListenerProtocol::HBONE)) {
		BindProtocol::hbone
	} else if any(|p| matches!(p, ListenerProtocol::HTTPS(_))) {
		BindProtocol::https
	} else if any(|p| matches!(p, ListenerProtocol::TLS(_))) {
		BindProtocol::tls
	} else if any(|p| matches!(p, ListenerProtocol::TCP)) {
		BindProtocol::tcp
	} else {
		BindProtocol::http
	}
}

pub fn auto_server(
	c: Option<&frontend::HTTP>,
) -> auto::Builder<hyper_util::rt::TokioExecutor> {
	let mut b = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
	b.http1().timer(hyper_util::rt::tokio::TokioTimer::new());
	b.http2().timer(hyper_util::rt::tokio::TokioTimer::new());
	let defaults = frontend::HTTP::default();
	let c = c.unwrap_or(&defaults);

	if let Some(m) = c.http1_max_headers {
		b.http1().max_headers(m);
	}
	b.http1().header_read_timeout(Some(c.http1_idle_timeout));
	if c.http2_window_size.is_some() || c.http2_connection_window_size.is_some() {
		if let Some(w) = c.http2_connection_window_size {
			b.http2().initial_connection_window_size(Some(w));
		}
		if let Some(w) = c.http2_window_size {
			b.http2().initial_stream_window_size(Some(w));
		}
	} else {
		b.http2().adaptive_window(true);
	}
	if let Some(i) = c.http2_keepalive_interval {
		b.http2().keep_alive_interval(i);
	}
	if let Some(t) = c.http2_keepalive_timeout {
		b.http2().keep_alive_timeout(t);
	}
	if let Some(f) = c.http2_frame_size {
		b.http2().max_frame_size(f);
	}
	b
}

fn hbone_server_config(
	cert: &[u8],
	key: &[u8],
	roots_pem: &[u8],
) -> anyhow::Result<rustls::ServerConfig> {
	let certs = crate::types::agent::parse_cert(cert)?;
	let key = crate::types::agent::parse_key(key)?;
	let mut roots = rustls::RootCertStore::empty();
	for c in crate::types::agent::parse_cert(roots_pem)? {
		roots.add(c)?;
	}
	let verifier =
		rustls::server::WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
	let mut config = rustls::ServerConfig::builder()
		.with_client_cert_verifier(verifier)
		.with_single_cert(certs, key)?;
	config.alpn_protocols = vec![b"h2".to_vec()];
	Ok(config)
}
