//! Agent-to-agent (A2A) traffic: passthrough with structured telemetry.
//!
//! Payloads are never mutated; we only peek at JSON-RPC POSTs to record the
//! method (message/send, tasks/get, ...) and tag agent-card fetches.

use serde::Deserialize;

use crate::http::{Request, Response};
use crate::telemetry::log::RequestLog;

pub const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

#[derive(Deserialize)]
struct RpcEnvelope {
	method: String,
}

pub async fn observe_request(req: &mut Request, log: &mut RequestLog) {
	if req.uri().path().ends_with(AGENT_CARD_PATH) {
		log.a2a_method = Some("agent-card".to_string());
		log.backend_protocol = Some(crate::cel::BackendProtocol::a2a);
		return;
	}
	if req.method() != crate::http::Method::POST {
		return;
	}
	if !matches!(
		crate::http::classify_content_type(req.headers()),
		crate::http::WellKnownContentTypes::Json
	) {
		return;
	}
	let Ok(body) = crate::http::inspect_body(req).await else {
		return;
	};
	if let Ok(envelope) = serde_json::from_slice::<RpcEnvelope>(&body) {
		log.a2a_method = Some(envelope.method);
		log.backend_protocol = Some(crate::cel::BackendProtocol::a2a);
	}
}

pub fn observe_response(_resp: &mut Response) {
	// Passthrough: nothing to rewrite today. The hook exists so card
	// rewriting (pointing clients back at the gateway) has a home.
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	#[tokio::test]
	async fn records_jsonrpc_method() {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = crate::telemetry::metrics::Metrics::new(&mut registry);
		let mut log = RequestLog::new(
			crate::telemetry::log::CelLogging::new(Default::default()),
			metrics,
			std::time::Instant::now(),
			"t".to_string(),
			crate::transport::stream::TCPConnectionInfo {
				peer_addr: "127.0.0.1:1".parse().unwrap(),
				local_addr: "127.0.0.1:2".parse().unwrap(),
				start: std::time::Instant::now(),
			},
		);
		let mut req = ::http::Request::builder()
			.method("POST")
			.uri("http://agent.example.com/")
			.header(crate::http::header::CONTENT_TYPE, "application/json")
			.body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"message/send"}"#))
			.unwrap();
		observe_request(&mut req, &mut log).await;
		assert_eq!(log.a2a_method.as_deref(), Some("message/send"));
		// The body is still intact for the upstream.
		let body = crate::http::read_body_with_limit(req.into_body(), 1024).await.unwrap();
		assert!(!body.is_empty());
	}
}
