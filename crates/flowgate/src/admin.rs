//! The admin surface: loopback-bound endpoints for config dumps, metrics,
//! readiness, and runtime log level changes.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::ProxyInputs;
use crate::http::{Body, Response, StatusCode, header};

/// Reload handle for the global log filter, installed at startup.
pub static LOG_FILTER_HANDLE: OnceCell<
	tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>,
> = OnceCell::new();

static CURRENT_LEVEL: std::sync::RwLock<String> = std::sync::RwLock::new(String::new());

pub struct Admin {
	inputs: Arc<ProxyInputs>,
	registry: Arc<std::sync::Mutex<Registry>>,
}

impl Admin {
	pub fn new(inputs: Arc<ProxyInputs>, registry: Arc<std::sync::Mutex<Registry>>) -> Admin {
		Admin { inputs, registry }
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let admin = Arc::new(self);
		let mut handles = vec![];
		for addr in admin.inputs.cfg.admin_addr.addresses() {
			let listener = match TcpListener::bind(addr).await {
				Ok(l) => l,
				Err(e) => {
					// Dual-stack localhost: one family may be unavailable.
					warn!("admin bind {addr} failed: {e}");
					continue;
				},
			};
			info!(%addr, "admin server started");
			let admin = admin.clone();
			handles.push(tokio::task::spawn(async move {
				loop {
					let Ok((stream, _)) = listener.accept().await else {
						continue;
					};
					let admin = admin.clone();
					tokio::task::spawn(async move {
						let service = service_fn(move |req| {
							let admin = admin.clone();
							async move { Ok::<_, std::convert::Infallible>(admin.handle(req).await) }
						});
						let _ = hyper::server::conn::http1::Builder::new()
							.serve_connection(TokioIo::new(stream), service)
							.await;
					});
				}
			}));
		}
		if handles.is_empty() {
			anyhow::bail!("admin server could not bind any address");
		}
		for h in handles {
			let _ = h.await;
		}
		Ok(())
	}

	async fn handle(&self, req: ::http::Request<hyper::body::Incoming>) -> Response {
		let path = req.uri().path().to_string();
		let get = req.method() == ::http::Method::GET;
		let post = req.method() == ::http::Method::POST;
		match path.as_str() {
			"/config_dump" if get => self.config_dump(),
			"/metrics" if get => self.metrics(),
			"/ready" if get => self.ready(),
			"/logging" if get => logging_get(),
			"/logging" if post => {
				let body = match crate::http::read_body_with_limit(
					Body::new(req.into_body()),
					8192,
				)
				.await
				{
					Ok(b) => b,
					Err(_) => return plain(StatusCode::BAD_REQUEST, "body too large"),
				};
				logging_post(&body)
			},
			#[cfg(feature = "pprof")]
			"/debug/pprof/profile" if get => pprof_profile().await,
			_ => plain(StatusCode::NOT_FOUND, "unknown endpoint"),
		}
	}

	fn config_dump(&self) -> Response {
		let snapshot = self.inputs.store.current();
		let dump = serde_json::json!({
			"config": &*self.inputs.cfg,
			"snapshot": &*snapshot,
		});
		match serde_json::to_string_pretty(&dump) {
			Ok(body) => json(StatusCode::OK, body),
			Err(e) => plain(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("serialization failed: {e}"),
			),
		}
	}

	fn metrics(&self) -> Response {
		let registry = self.registry.lock().expect("metrics registry");
		let mut body = String::new();
		match prometheus_client::encoding::text::encode(&mut body, &registry) {
			Ok(()) => ::http::Response::builder()
				.status(StatusCode::OK)
				.header(
					header::CONTENT_TYPE,
					"application/openmetrics-text; version=1.0.0; charset=utf-8",
				)
				.body(Body::from(body))
				.expect("static response must build"),
			Err(e) => plain(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("encoding failed: {e}"),
			),
		}
	}

	fn ready(&self) -> Response {
		if self.inputs.store.ready() {
			plain(StatusCode::OK, "ready")
		} else {
			plain(StatusCode::SERVICE_UNAVAILABLE, "no config installed")
		}
	}
}

fn logging_get() -> Response {
	let level = CURRENT_LEVEL.read().expect("level lock").clone();
	let level = if level.is_empty() { "info".to_string() } else { level };
	json(
		StatusCode::OK,
		serde_json::json!({ "level": level }).to_string(),
	)
}

/// POST body: either a bare filter string ("debug",
/// "info,flowgate::proxy=trace") or `{"level": "..."}`.
fn logging_post(body: &[u8]) -> Response {
	let raw = String::from_utf8_lossy(body).trim().to_string();
	let level = serde_json::from_str::<serde_json::Value>(&raw)
		.ok()
		.and_then(|v| v.get("level").and_then(|l| l.as_str()).map(|s| s.to_string()))
		.unwrap_or(raw);
	if level.is_empty() {
		return plain(StatusCode::BAD_REQUEST, "no level provided");
	}
	let Ok(filter) = level.parse::<EnvFilter>() else {
		return plain(StatusCode::BAD_REQUEST, format!("invalid filter: {level}"));
	};
	let Some(handle) = LOG_FILTER_HANDLE.get() else {
		return plain(StatusCode::SERVICE_UNAVAILABLE, "logging not reloadable");
	};
	match handle.reload(filter) {
		Ok(()) => {
			*CURRENT_LEVEL.write().expect("level lock") = level.clone();
			json(
				StatusCode::OK,
				serde_json::json!({ "level": level }).to_string(),
			)
		},
		Err(e) => plain(
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("reload failed: {e}"),
		),
	}
}

#[cfg(feature = "pprof")]
async fn pprof_profile() -> Response {
	use pprof::protos::Message;
	let guard = match pprof::ProfilerGuard::new(100) {
		Ok(g) => g,
		Err(e) => {
			return plain(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("profiler start failed: {e}"),
			);
		},
	};
	tokio::time::sleep(std::time::Duration::from_secs(10)).await;
	let report = match guard.report().build() {
		Ok(r) => r,
		Err(e) => {
			return plain(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("profile failed: {e}"),
			);
		},
	};
	let profile = match report.pprof() {
		Ok(p) => p,
		Err(e) => {
			return plain(
				StatusCode::INTERNAL_SERVER_ERROR,
				format!("encoding failed: {e}"),
			);
		},
	};
	let mut body = Vec::new();
	if let Err(e) = profile.encode(&mut body) {
		return plain(
			StatusCode::INTERNAL_SERVER_ERROR,
			format!("encoding failed: {e}"),
		);
	}
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/octet-stream")
		.body(Body::from(body))
		.expect("static response must build")
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Body::from(body.into()))
		.expect("static response must build")
}

fn json(status: StatusCode, body: String) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.expect("static response must build")
}
