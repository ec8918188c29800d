//! Per-destination connection pooling.
//!
//! Each destination key owns a sub-pool holding idle HTTP/1.1 connections
//! and multiplexable HTTP/2 connections. Acquisition prefers an existing h2
//! connection with stream budget, then an idle h1 connection, then dials
//! fresh. The pool never refuses: connections beyond the per-host cap are
//! simply not retained after use.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, trace};

use crate::client::Transport;
use crate::http::Body;
use crate::transport::stream::Socket;
use crate::types::agent::Target;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Key {
	pub target: Target,
	pub addr: std::net::SocketAddr,
	pub transport: Transport,
	pub h2: bool,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub idle_timeout: Duration,
	pub max_idle_per_host: usize,
	pub max_streams_per_conn: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			idle_timeout: Duration::from_secs(90),
			max_idle_per_host: 8,
			max_streams_per_conn: 100,
		}
	}
}

pub struct Pool {
	cfg: PoolConfig,
	// One lock per sub-pool keeps the hot path contention local to a
	// destination.
	subs: Mutex<HashMap<Key, Arc<Mutex<SubPool>>>>,
}

#[derive(Default)]
struct SubPool {
	h2: Vec<H2Handle>,
	h1: VecDeque<H1Idle>,
}

struct H2Handle {
	send: http2::SendRequest<Body>,
	streams: Arc<AtomicUsize>,
}

struct H1Idle {
	send: http1::SendRequest<Body>,
	since: Instant,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("handshake failed: {0}")]
	Handshake(#[from] hyper::Error),
	#[error("dial failed: {0}")]
	Dial(#[from] anyhow::Error),
}

impl Pool {
	pub fn new(cfg: PoolConfig) -> Arc<Pool> {
		let pool = Arc::new(Pool {
			cfg,
			subs: Mutex::new(HashMap::new()),
		});
		let sweeper = Arc::downgrade(&pool);
		tokio::task::spawn(async move {
			let mut tick = tokio::time::interval(Duration::from_secs(5));
			loop {
				tick.tick().await;
				let Some(pool) = sweeper.upgrade() else { return };
				pool.evict_idle();
			}
		});
		pool
	}

	fn sub(&self, key: &Key) -> Arc<Mutex<SubPool>> {
		let mut subs = self.subs.lock().expect("pool lock");
		subs.entry(key.clone()).or_default().clone()
	}

	fn evict_idle(&self) {
		let subs: Vec<Arc<Mutex<SubPool>>> = {
			let subs = self.subs.lock().expect("pool lock");
			subs.values().cloned().collect()
		};
		for sub in subs {
			let mut sub = sub.lock().expect("subpool lock");
			let timeout = self.cfg.idle_timeout;
			sub.h1.retain(|idle| {
				let keep = idle.since.elapsed() < timeout && !idle.send.is_closed();
				if !keep {
					trace!("evicting idle h1 connection");
				}
				keep
			});
			sub.h2.retain(|h| !h.send.is_closed());
		}
	}

	/// Acquire a stream and send the request on it.
	pub async fn request(
		self: &Arc<Self>,
		key: Key,
		mut req: ::http::Request<Body>,
		connect: impl Future<Output = anyhow::Result<Socket>>,
	) -> Result<::http::Response<Body>, Error> {
		// The client connection owns the target; relative form on the wire
		// for h1, absolute for h2 (hyper handles :authority from the uri).
		if !key.h2 {
			let path = req
				.uri()
				.path_and_query()
				.map(|pq| pq.as_str().to_string())
				.unwrap_or_else(|| "/".to_string());
			let authority = req.uri().authority().cloned();
			if let Some(a) = authority
				&& !req.headers().contains_key(::http::header::HOST)
			{
				req.headers_mut().insert(
					::http::header::HOST,
					::http::HeaderValue::try_from(a.as_str())
						.map_err(|e| Error::Dial(e.into()))?,
				);
			}
			*req.uri_mut() = path.parse().map_err(|e: ::http::uri::InvalidUri| Error::Dial(e.into()))?;
		}

		if key.h2 {
			self.request_h2(key, req, connect).await
		} else {
			self.request_h1(key, req, connect).await
		}
	}

	async fn request_h2(
		self: &Arc<Self>,
		key: Key,
		req: ::http::Request<Body>,
		connect: impl Future<Output = anyhow::Result<Socket>>,
	) -> Result<::http::Response<Body>, Error> {
		let sub = self.sub(&key);
		let reuse = {
			let mut sub = sub.lock().expect("subpool lock");
			sub.h2.retain(|h| !h.send.is_closed());
			sub
				.h2
				.iter()
				.find(|h| h.streams.load(Ordering::Relaxed) < self.cfg.max_streams_per_conn)
				.map(|h| (h.send.clone(), h.streams.clone()))
		};
		let (mut send, streams) = match reuse {
			Some(r) => {
				trace!("reusing h2 connection");
				r
			},
			None => {
				debug!(?key.target, "dialing new h2 connection");
				let io = connect.await?;
				let (send, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
				tokio::task::spawn(async move {
					if let Err(e) = conn.await {
						debug!("h2 connection terminated: {e}");
					}
				});
				let streams = Arc::new(AtomicUsize::new(0));
				let mut sub = sub.lock().expect("subpool lock");
				sub.h2.push(H2Handle {
					send: send.clone(),
					streams: streams.clone(),
				});
				(send, streams)
			},
		};
		streams.fetch_add(1, Ordering::Relaxed);
		let result = send.send_request(req).await;
		match result {
			Ok(resp) => Ok(resp.map(|incoming| {
				// Budget is released when the response stream completes.
				Body::new(GuardedBody {
					inner: incoming,
					_guard: StreamGuard(streams.clone()),
				})
			})),
			Err(e) => {
				streams.fetch_sub(1, Ordering::Relaxed);
				Err(e.into())
			},
		}
	}

	async fn request_h1(
		self: &Arc<Self>,
		key: Key,
		req: ::http::Request<Body>,
		connect: impl Future<Output = anyhow::Result<Socket>>,
	) -> Result<::http::Response<Body>, Error> {
		let sub = self.sub(&key);
		let reused = {
			let mut sub = sub.lock().expect("subpool lock");
			loop {
				match sub.h1.pop_back() {
					Some(idle) if idle.send.is_ready() && !idle.send.is_closed() => {
						break Some(idle.send);
					},
					// Still busy or dead: don't hand it out again.
					Some(_) => continue,
					None => break None,
				}
			}
		};
		let mut send = match reused {
			Some(send) => {
				trace!("reusing idle h1 connection");
				send
			},
			None => {
				debug!(?key.target, "dialing new h1 connection");
				let io = connect.await?;
				let (send, conn) = http1::handshake(TokioIo::new(io)).await?;
				tokio::task::spawn(async move {
					if let Err(e) = conn.with_upgrades().await {
						debug!("h1 connection terminated: {e}");
					}
				});
				send
			},
		};
		let resp = send.send_request(req).await?;
		// Return the connection for reuse; the next checkout verifies
		// readiness (the response body must drain first).
		{
			let mut sub = sub.lock().expect("subpool lock");
			if sub.h1.len() >= self.cfg.max_idle_per_host {
				// LRU within the destination: drop the oldest idle entry.
				sub.h1.pop_front();
			}
			sub.h1.push_back(H1Idle {
				send,
				since: Instant::now(),
			});
		}
		Ok(resp.map(Body::new))
	}

	#[cfg(test)]
	pub fn idle_h1_count(&self, key: &Key) -> usize {
		self.sub(key).lock().expect("subpool lock").h1.len()
	}
}

// Pairs the h2 response stream with its slot in the per-connection stream
// budget; the slot frees when the stream is fully consumed or dropped.
struct GuardedBody {
	inner: Incoming,
	_guard: StreamGuard,
}

struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::Relaxed);
	}
}

impl http_body::Body for GuardedBody {
	type Data = Bytes;
	type Error = hyper::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		Pin::new(&mut self.inner).poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}
