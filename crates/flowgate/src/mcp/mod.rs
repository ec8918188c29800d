//! The MCP backend: federates multiple upstream MCP servers (stdio, SSE,
//! streamable HTTP, OpenAPI-derived) behind one endpoint with session
//! affinity, tool namespacing, and per-tool authorization.

pub mod auth;
pub mod jsonrpc;
pub mod rbac;
pub mod relay;
pub mod session;
pub mod upstream;

use std::fmt::Display;
use std::sync::Arc;

pub use auth::McpAuthentication;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::http::{Request, Response, StatusCode, header};
use crate::proxy::PolicyClient;
use crate::store::BackendPolicies;
use crate::telemetry::log::AsyncLog;
use crate::types::agent::{BackendName, McpBackend};

pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum MCPOperation {
	Tool,
	Prompt,
	Resource,
}

impl Display for MCPOperation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			MCPOperation::Tool => write!(f, "tool"),
			MCPOperation::Prompt => write!(f, "prompt"),
			MCPOperation::Resource => write!(f, "resource"),
		}
	}
}

/// Telemetry for a single MCP call, filled asynchronously.
#[derive(Debug, Default, Clone)]
pub struct MCPInfo {
	pub method_name: Option<String>,
	pub resource_name: Option<String>,
	pub target_name: Option<String>,
	pub resource: Option<MCPOperation>,
}

/// Exposed to CEL as the `mcp` attribute during authorization.
pub use rbac::ResourceType;

/// The long-lived MCP serving state: one session registry shared by every
/// MCP backend.
#[derive(Clone, Debug, Default)]
pub struct App {
	sessions: Arc<session::SessionManager>,
}

impl App {
	pub fn new() -> App {
		App::default()
	}

	/// Serve one HTTP request against an MCP backend.
	pub async fn serve(
		&self,
		client: PolicyClient,
		name: BackendName,
		backend: McpBackend,
		policies: BackendPolicies,
		req: Request,
		log: AsyncLog<MCPInfo>,
	) -> Response {
		// Authentication gates everything, including session creation. The
		// discovery document itself is served unauthenticated.
		if let Some(authn) = &policies.mcp_authentication {
			if req.uri().path().ends_with(auth::RESOURCE_METADATA_PATH) {
				return authn.resource_metadata_response(&req);
			}
			if let Err(resp) = authn.check(&req) {
				return *resp;
			}
		}

		let method = req.method().clone();
		if method == crate::http::Method::POST {
			self
				.handle_post(client, name, backend, policies, req, log)
				.await
		} else if method == crate::http::Method::GET {
			// A standing stream for server-initiated messages. We hold it
			// open; upstream pushes are forwarded per-session.
			match self.session_from(&req) {
				Some(session) => session.serve_stream().await,
				None => http_error(StatusCode::BAD_REQUEST, "missing session"),
			}
		} else if method == crate::http::Method::DELETE {
			let Some(id) = session_id_of(&req) else {
				return http_error(StatusCode::BAD_REQUEST, "missing session");
			};
			match self.sessions.remove(&id).await {
				Some(_) => empty_response(StatusCode::ACCEPTED),
				None => http_error(StatusCode::NOT_FOUND, "unknown session"),
			}
		} else {
			http_error(StatusCode::METHOD_NOT_ALLOWED, "unsupported method")
		}
	}

	async fn handle_post(
		&self,
		client: PolicyClient,
		name: BackendName,
		backend: McpBackend,
		policies: BackendPolicies,
		req: Request,
		log: AsyncLog<MCPInfo>,
	) -> Response {
		let (parts, body) = req.into_parts();
		let bytes = match crate::http::read_body_with_limit(body, 4_194_304).await {
			Ok(b) => b,
			Err(_) => return http_error(StatusCode::PAYLOAD_TOO_LARGE, "body too large"),
		};
		let message: Value = match serde_json::from_slice(&bytes) {
			Ok(m) => m,
			Err(e) => return http_error(StatusCode::BAD_REQUEST, format!("invalid json: {e}")),
		};
		let method = message.get("method").and_then(|m| m.as_str()).unwrap_or("");
		log.non_atomic_mutate(|info| info.method_name = Some(method.to_string()));

		let session = if method == "initialize" {
			// Reuse a presented session id if we know it; mint otherwise.
			let existing = session_id_of_parts(&parts).and_then(|id| self.sessions.get(&id));
			match existing {
				Some(s) => s,
				None => {
					let relay = relay::Relay::new(
						client.clone(),
						name.clone(),
						backend.clone(),
						policies.mcp_authorization.clone().unwrap_or_default(),
					);
					self.sessions.create(relay)
				},
			}
		} else {
			match self.session_from_parts(&parts) {
				Some(s) => s,
				None => {
					return jsonrpc_error_response(
						message.get("id").cloned(),
						jsonrpc::INVALID_REQUEST,
						"no session established; send initialize first",
					);
				},
			}
		};

		debug!(session = %session.id, method, "mcp request");
		let resp = session.handle(&parts, message, &log).await;
		let mut resp = match resp {
			Ok(r) => r,
			Err(e) => e.into_response(message_id(&bytes)),
		};
		resp.headers_mut().insert(
			crate::http::HeaderName::from_static(SESSION_HEADER),
			crate::http::HeaderValue::try_from(session.id.to_string())
				.expect("session ids are valid header values"),
		);
		resp
	}

	fn session_from(&self, req: &Request) -> Option<session::Session> {
		session_id_of(req).and_then(|id| self.sessions.get(&id))
	}

	fn session_from_parts(&self, parts: &::http::request::Parts) -> Option<session::Session> {
		session_id_of_parts(parts).and_then(|id| self.sessions.get(&id))
	}
}

fn session_id_of(req: &Request) -> Option<String> {
	req
		.headers()
		.get(SESSION_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
}

fn session_id_of_parts(parts: &::http::request::Parts) -> Option<String> {
	parts
		.headers
		.get(SESSION_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
}

fn message_id(bytes: &Bytes) -> Option<Value> {
	serde_json::from_slice::<Value>(bytes)
		.ok()
		.and_then(|v| v.get("id").cloned())
}

pub(crate) fn http_error(status: StatusCode, body: impl Into<String>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(crate::http::Body::from(body.into()))
		.expect("static response must build")
}

pub(crate) fn empty_response(status: StatusCode) -> Response {
	::http::Response::builder()
		.status(status)
		.body(crate::http::Body::empty())
		.expect("static response must build")
}

/// Per JSON-RPC, protocol-level failures still ride on HTTP 200.
pub(crate) fn jsonrpc_error_response(
	id: Option<Value>,
	code: i64,
	message: impl Into<String>,
) -> Response {
	let body = jsonrpc::error_object(id, code, message.into());
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/json")
		.body(crate::http::Body::from(body.to_string()))
		.expect("static response must build")
}
