//! Legacy SSE transport: a long-lived GET stream for server messages plus a
//! per-session POST endpoint announced in the first `endpoint` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::UpstreamError;
use crate::http::{StatusCode, header};
use crate::mcp::jsonrpc;
use crate::parse::sse;
use crate::proxy::PolicyClient;
use crate::types::agent::SimpleBackendReference;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

pub struct SseClient {
	client: PolicyClient,
	backend: SimpleBackendReference,
	post_path: String,
	pending: Pending,
	next_id: AtomicI64,
}

impl SseClient {
	pub async fn connect(
		client: PolicyClient,
		backend: SimpleBackendReference,
		path: String,
	) -> Result<SseClient, UpstreamError> {
		let req = ::http::Request::builder()
			.uri(path.as_str())
			.header(header::ACCEPT, "text/event-stream")
			.body(crate::http::Body::empty())
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		let resp = client
			.call_reference(req, &backend)
			.await
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		if resp.status() != StatusCode::OK {
			return Err(UpstreamError::Transport(format!(
				"sse stream returned {}",
				resp.status()
			)));
		}

		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
		let reader_pending = pending.clone();
		tokio::task::spawn(async move {
			let mut endpoint_tx = Some(endpoint_tx);
			let mut parser = sse::Parser::new(4_194_304);
			let mut body = resp.into_body();
			while let Some(Ok(frame)) = body.frame().await {
				let Some(data) = frame.data_ref() else { continue };
				for event in parser.push(data) {
					match event.event.as_deref() {
						Some("endpoint") => {
							if let Some(tx) = endpoint_tx.take() {
								let _ = tx.send(event.data);
							}
						},
						_ => {
							let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
								continue;
							};
							let Some(id) = message.get("id").and_then(|i| i.as_i64()) else {
								continue;
							};
							if let Some(tx) = reader_pending.lock().await.remove(&id) {
								let _ = tx.send(message);
							}
						},
					}
				}
			}
			debug!("sse stream ended");
			reader_pending.lock().await.clear();
		});

		let post_path = tokio::time::timeout(std::time::Duration::from_secs(10), endpoint_rx)
			.await
			.map_err(|_| UpstreamError::Transport("no endpoint event".to_string()))?
			.map_err(|_| UpstreamError::Transport("stream closed before endpoint".to_string()))?;

		Ok(SseClient {
			client,
			backend,
			post_path,
			pending,
			next_id: AtomicI64::new(1),
		})
	}

	pub async fn initialize(&self) -> Result<(), UpstreamError> {
		self
			.request("initialize", super::initialize_params())
			.await?;
		self
			.notify(jsonrpc::notification("notifications/initialized", json!({})))
			.await;
		Ok(())
	}

	pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(id, tx);
		self.post(jsonrpc::request(json!(id), method, params)).await?;
		tokio::time::timeout(std::time::Duration::from_secs(60), rx)
			.await
			.map_err(|_| UpstreamError::Transport("request timed out".to_string()))?
			.map_err(|_| UpstreamError::Transport("stream closed".to_string()))
	}

	pub async fn notify(&self, message: Value) {
		if let Err(e) = self.post(message).await {
			warn!("sse notification failed: {e}");
		}
	}

	async fn post(&self, message: Value) -> Result<(), UpstreamError> {
		let req = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri(self.post_path.as_str())
			.header(header::CONTENT_TYPE, "application/json")
			.body(crate::http::Body::from(message.to_string()))
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		let resp = self
			.client
			.call_reference(req, &self.backend)
			.await
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		if resp.status().is_success() {
			Ok(())
		} else {
			Err(UpstreamError::Transport(format!(
				"post returned {}",
				resp.status()
			)))
		}
	}
}
