//! Streamable HTTP transport: JSON-RPC over POST, with responses arriving
//! as a single JSON document or as the first event of an SSE stream.

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use super::UpstreamError;
use crate::http::{StatusCode, header};
use crate::mcp::{SESSION_HEADER, jsonrpc};
use crate::parse::sse;
use crate::proxy::PolicyClient;
use crate::types::agent::SimpleBackendReference;

pub struct StreamableClient {
	client: PolicyClient,
	backend: SimpleBackendReference,
	path: String,
	session: Mutex<SessionState>,
	next_id: std::sync::atomic::AtomicI64,
}

#[derive(Default)]
struct SessionState {
	id: Option<String>,
	initialized: bool,
}

impl StreamableClient {
	pub fn new(
		client: PolicyClient,
		backend: SimpleBackendReference,
		path: String,
	) -> StreamableClient {
		StreamableClient {
			client,
			backend,
			path,
			session: Mutex::new(SessionState::default()),
			next_id: std::sync::atomic::AtomicI64::new(1),
		}
	}

	pub async fn request(
		&self,
		method: &str,
		params: Value,
		stateful: bool,
	) -> Result<Value, UpstreamError> {
		if stateful {
			let initialized = { self.session.lock().await.initialized };
			if !initialized && method != "initialize" {
				self.handshake().await?;
			}
		} else if method != "initialize" {
			// Shared upstream sessions have no per-client state; wrap every
			// request in a fresh handshake so strict servers stay happy.
			self.handshake().await?;
		}
		let id = self
			.next_id
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		self
			.post(jsonrpc::request(json!(id), method, params))
			.await
	}

	async fn handshake(&self) -> Result<(), UpstreamError> {
		let id = self
			.next_id
			.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		let reply = self
			.post(jsonrpc::request(
				json!(id),
				"initialize",
				super::initialize_params(),
			))
			.await?;
		if jsonrpc::is_error(&reply) {
			return Err(UpstreamError::Protocol(format!(
				"initialize failed: {reply}"
			)));
		}
		self
			.post_accepting(jsonrpc::notification("notifications/initialized", json!({})))
			.await?;
		self.session.lock().await.initialized = true;
		Ok(())
	}

	pub async fn notify(&self, message: Value) {
		if let Err(e) = self.post_accepting(message).await {
			debug!("notification delivery failed: {e}");
		}
	}

	/// POST expecting a JSON-RPC reply.
	async fn post(&self, message: Value) -> Result<Value, UpstreamError> {
		let resp = self.send(message).await?;
		let status = resp.status();
		if !status.is_success() {
			return Err(UpstreamError::Transport(format!(
				"upstream returned {status}"
			)));
		}
		let is_sse = matches!(
			crate::http::classify_content_type(resp.headers()),
			crate::http::WellKnownContentTypes::Sse
		);
		{
			let mut session = self.session.lock().await;
			if let Some(sid) = resp
				.headers()
				.get(SESSION_HEADER)
				.and_then(|v| v.to_str().ok())
			{
				session.id = Some(sid.to_string());
			}
		}
		let bytes = crate::http::read_body_with_limit(resp.into_body(), 4_194_304)
			.await
			.map_err(|e| UpstreamError::Transport(format!("read response: {e}")))?;
		if is_sse {
			// The reply is the last data event carrying a response.
			let mut parser = sse::Parser::new(4_194_304);
			let mut reply = None;
			for event in parser.push(&bytes) {
				if let Ok(v) = serde_json::from_str::<Value>(&event.data)
					&& jsonrpc::classify(&v) == jsonrpc::MessageKind::Response
				{
					reply = Some(v);
				}
			}
			reply.ok_or_else(|| UpstreamError::Protocol("no response on stream".to_string()))
		} else {
			serde_json::from_slice(&bytes)
				.map_err(|e| UpstreamError::Protocol(format!("invalid response: {e}")))
		}
	}

	/// POST where 202 Accepted with no body is a success (notifications).
	async fn post_accepting(&self, message: Value) -> Result<(), UpstreamError> {
		let resp = self.send(message).await?;
		let status = resp.status();
		if status.is_success() || status == StatusCode::ACCEPTED {
			Ok(())
		} else {
			Err(UpstreamError::Transport(format!(
				"upstream returned {status}"
			)))
		}
	}

	async fn send(&self, message: Value) -> Result<crate::http::Response, UpstreamError> {
		let mut builder = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri(self.path.as_str())
			.header(header::CONTENT_TYPE, "application/json")
			.header(header::ACCEPT, "application/json, text/event-stream");
		if let Some(sid) = &self.session.lock().await.id {
			builder = builder.header(SESSION_HEADER, sid.as_str());
		}
		let req = builder
			.body(crate::http::Body::from(message.to_string()))
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		self
			.client
			.call_reference(req, &self.backend)
			.await
			.map_err(|e| UpstreamError::Transport(e.to_string()))
	}
}
