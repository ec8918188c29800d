//! Upstream MCP targets and their transports.
//!
//! Connections are established lazily: a target is only dialed (or its child
//! process spawned) when a request first references it. In stateful mode the
//! upstream session is initialized once per client session; in shared mode
//! every request is wrapped with a fresh initialize so servers that require
//! the handshake behave correctly.

mod openapi;
mod sse;
mod stdio;
mod streamable;

use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::http::Response;
use crate::mcp::jsonrpc;
use crate::proxy::PolicyClient;
use crate::types::agent::{McpTarget, McpTargetSpec};

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
	#[error("authorization denied")]
	Authorization,
	#[error("unknown target: {0}")]
	UnknownTarget(String),
	#[error("method {0} cannot be used with multiple targets")]
	InvalidMethodWithMultiplexing(String),
	#[error("unsupported method: {0}")]
	InvalidMethod(String),
	#[error("transport: {0}")]
	Transport(String),
	#[error("protocol: {0}")]
	Protocol(String),
}

impl UpstreamError {
	/// JSON-RPC failures are HTTP 200 with an error object.
	pub fn into_response(self, id: Option<Value>) -> Response {
		let code = match &self {
			UpstreamError::Authorization => -32002,
			UpstreamError::InvalidMethod(_) | UpstreamError::InvalidMethodWithMultiplexing(_) => {
				jsonrpc::METHOD_NOT_FOUND
			},
			UpstreamError::UnknownTarget(_) => jsonrpc::INVALID_PARAMS,
			_ => jsonrpc::INTERNAL_ERROR,
		};
		crate::mcp::jsonrpc_error_response(id, code, self.to_string())
	}
}

/// One upstream target with its lazily established connection.
pub struct Upstream {
	pub name: String,
	target: McpTarget,
	client: PolicyClient,
	stateful: bool,
	conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Upstream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Upstream")
			.field("name", &self.name)
			.finish_non_exhaustive()
	}
}

enum Connection {
	Stdio(stdio::StdioClient),
	Streamable(streamable::StreamableClient),
	Sse(sse::SseClient),
	OpenAPI(openapi::OpenAPIClient),
}

impl Upstream {
	pub fn new(target: McpTarget, client: PolicyClient, stateful: bool) -> Upstream {
		Upstream {
			name: target.name.to_string(),
			target,
			client,
			stateful,
			conn: Mutex::new(None),
		}
	}

	/// Send a request and return its `result` value.
	pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
		let mut guard = self.conn.lock().await;
		if guard.is_none() {
			*guard = Some(self.connect().await?);
		}
		let conn = guard.as_mut().expect("connection just established");
		let reply = match conn {
			Connection::Stdio(c) => c.request(method, params).await?,
			Connection::Streamable(c) => c.request(method, params, self.stateful).await?,
			Connection::Sse(c) => c.request(method, params).await?,
			Connection::OpenAPI(c) => return c.request(method, params).await,
		};
		if jsonrpc::is_error(&reply) {
			// Forward the error object verbatim inside a protocol error.
			return Err(UpstreamError::Protocol(
				reply
					.get("error")
					.map(|e| e.to_string())
					.unwrap_or_else(|| "unknown error".to_string()),
			));
		}
		jsonrpc::result_of(&reply)
			.cloned()
			.ok_or_else(|| UpstreamError::Protocol("response missing result".to_string()))
	}

	pub async fn send_notification(&self, method: &str, params: Value) {
		let mut guard = self.conn.lock().await;
		let Some(conn) = guard.as_mut() else { return };
		let message = jsonrpc::notification(method, params);
		match conn {
			Connection::Stdio(c) => c.notify(message).await,
			Connection::Streamable(c) => c.notify(message).await,
			Connection::Sse(c) => c.notify(message).await,
			Connection::OpenAPI(_) => {},
		}
	}

	pub async fn shutdown(&self) {
		let mut guard = self.conn.lock().await;
		if let Some(Connection::Stdio(c)) = guard.take() {
			c.shutdown().await;
		}
	}

	async fn connect(&self) -> Result<Connection, UpstreamError> {
		match &self.target.spec {
			McpTargetSpec::Stdio { cmd, args, env } => {
				let client = stdio::StdioClient::spawn(cmd, args, env).await?;
				client.initialize().await?;
				Ok(Connection::Stdio(client))
			},
			McpTargetSpec::Streamable { backend, path } => Ok(Connection::Streamable(
				streamable::StreamableClient::new(
					self.client.clone(),
					backend.clone(),
					path.clone(),
				),
			)),
			McpTargetSpec::Sse { backend, path } => {
				let client =
					sse::SseClient::connect(self.client.clone(), backend.clone(), path.clone())
						.await?;
				client.initialize().await?;
				Ok(Connection::Sse(client))
			},
			McpTargetSpec::OpenAPI { backend, schema } => Ok(Connection::OpenAPI(
				openapi::OpenAPIClient::new(self.client.clone(), backend.clone(), schema.clone())?,
			)),
		}
	}
}

pub(crate) fn initialize_params() -> Value {
	json!({
		"protocolVersion": "2025-06-18",
		"capabilities": {},
		"clientInfo": {
			"name": "flowgate",
			"version": env!("CARGO_PKG_VERSION"),
		},
	})
}
