//! The per-session multiplexer: fans requests out to upstream targets,
//! merges results, and rewrites tool names between the federated namespace
//! and each target's own.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cel::ContextBuilder;
use crate::http::{Response, StatusCode, header};
use crate::mcp::rbac::{McpAuthorization, ResourceId, ResourceType};
use crate::mcp::upstream::{Upstream, UpstreamError};
use crate::mcp::{MCPInfo, MCPOperation, jsonrpc};
use crate::proxy::PolicyClient;
use crate::telemetry::log::AsyncLog;
use crate::telemetry::metrics::MCPCallLabels;
use crate::types::agent::{BackendName, McpBackend};

pub struct Relay {
	client: PolicyClient,
	backend_name: BackendName,
	backend: McpBackend,
	policies: McpAuthorization,
	upstreams: Vec<Arc<Upstream>>,
}

impl std::fmt::Debug for Relay {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Relay")
			.field("backend", &self.backend_name)
			.finish_non_exhaustive()
	}
}

impl Relay {
	pub fn new(
		client: PolicyClient,
		backend_name: BackendName,
		backend: McpBackend,
		policies: McpAuthorization,
	) -> Relay {
		let upstreams = backend
			.targets
			.iter()
			.map(|t| {
				Arc::new(Upstream::new(
					(**t).clone(),
					client.clone(),
					backend.stateful,
				))
			})
			.collect();
		Relay {
			client,
			backend_name,
			backend,
			policies,
			upstreams,
		}
	}

	fn use_prefix(&self) -> bool {
		self.backend.always_use_prefix || self.upstreams.len() > 1
	}

	fn prefixed(&self, target: &str, name: &str) -> String {
		if self.use_prefix() {
			format!("{target}_{name}")
		} else {
			name.to_string()
		}
	}

	fn parse_resource_name<'a>(
		&self,
		name: &'a str,
	) -> Result<(&Arc<Upstream>, &'a str), UpstreamError> {
		if !self.use_prefix() {
			let upstream = self
				.upstreams
				.first()
				.ok_or_else(|| UpstreamError::UnknownTarget(name.to_string()))?;
			return Ok((upstream, name));
		}
		for upstream in &self.upstreams {
			if let Some(rest) = name.strip_prefix(&format!("{}_", upstream.name)) {
				return Ok((upstream, rest));
			}
		}
		Err(UpstreamError::UnknownTarget(name.to_string()))
	}

	fn single_target(&self, method: &str) -> Result<&Arc<Upstream>, UpstreamError> {
		if self.upstreams.len() == 1 {
			Ok(&self.upstreams[0])
		} else {
			Err(UpstreamError::InvalidMethodWithMultiplexing(
				method.to_string(),
			))
		}
	}

	pub async fn shutdown(&self) {
		for upstream in &self.upstreams {
			upstream.shutdown().await;
		}
	}

	pub async fn handle(
		&self,
		parts: &::http::request::Parts,
		message: Value,
		log: &AsyncLog<MCPInfo>,
	) -> Result<Response, UpstreamError> {
		match jsonrpc::classify(&message) {
			jsonrpc::MessageKind::Request => self.handle_request(parts, message, log).await,
			jsonrpc::MessageKind::Notification => {
				// Client lifecycle notifications stay at the gateway; each
				// upstream performs its own handshake.
				Ok(crate::mcp::empty_response(StatusCode::ACCEPTED))
			},
			jsonrpc::MessageKind::Response => {
				Ok(crate::mcp::empty_response(StatusCode::ACCEPTED))
			},
		}
	}

	async fn handle_request(
		&self,
		parts: &::http::request::Parts,
		message: Value,
		log: &AsyncLog<MCPInfo>,
	) -> Result<Response, UpstreamError> {
		let id = message.get("id").cloned();
		let method = message
			.get("method")
			.and_then(|m| m.as_str())
			.unwrap_or("")
			.to_string();
		let params = message.get("params").cloned().unwrap_or(json!({}));

		let result = match method.as_str() {
			"initialize" => self.initialize_result(),
			"ping" => json!({}),
			"tools/list" => self.merge_lists("tools/list", "tools", params).await?,
			"prompts/list" => self.merge_lists("prompts/list", "prompts", params).await?,
			"resources/list" | "resources/templates/list" => {
				let upstream = self.single_target(&method)?;
				upstream.send_request(&method, params).await?
			},
			"tools/call" => {
				let name = params
					.get("name")
					.and_then(|n| n.as_str())
					.ok_or_else(|| UpstreamError::Protocol("call without name".to_string()))?
					.to_string();
				let (upstream, tool) = self.parse_resource_name(&name)?;
				log.non_atomic_mutate(|info| {
					info.resource = Some(MCPOperation::Tool);
					info.resource_name = Some(tool.to_string());
					info.target_name = Some(upstream.name.clone());
				});
				self.authorize(
					parts,
					ResourceType::Tool(ResourceId::new(
						upstream.name.clone(),
						tool.to_string(),
					)),
				)?;
				self.record_call(&method, &upstream.name, tool);
				let mut params = params.clone();
				params["name"] = Value::String(tool.to_string());
				upstream.send_request("tools/call", params).await?
			},
			"prompts/get" => {
				let name = params
					.get("name")
					.and_then(|n| n.as_str())
					.ok_or_else(|| UpstreamError::Protocol("get without name".to_string()))?
					.to_string();
				let (upstream, prompt) = self.parse_resource_name(&name)?;
				log.non_atomic_mutate(|info| {
					info.resource = Some(MCPOperation::Prompt);
					info.resource_name = Some(prompt.to_string());
					info.target_name = Some(upstream.name.clone());
				});
				self.authorize(
					parts,
					ResourceType::Prompt(ResourceId::new(
						upstream.name.clone(),
						prompt.to_string(),
					)),
				)?;
				self.record_call(&method, &upstream.name, prompt);
				let mut params = params.clone();
				params["name"] = Value::String(prompt.to_string());
				upstream.send_request("prompts/get", params).await?
			},
			"resources/read" => {
				let upstream = self.single_target(&method)?;
				let uri = params
					.get("uri")
					.and_then(|u| u.as_str())
					.unwrap_or_default()
					.to_string();
				log.non_atomic_mutate(|info| {
					info.resource = Some(MCPOperation::Resource);
					info.resource_name = Some(uri.clone());
					info.target_name = Some(upstream.name.clone());
				});
				self.authorize(
					parts,
					ResourceType::Resource(ResourceId::new(upstream.name.clone(), uri)),
				)?;
				upstream.send_request(&method, params).await?
			},
			"completion/complete" => {
				let upstream = self.single_target(&method)?;
				upstream.send_request(&method, params).await?
			},
			other => return Err(UpstreamError::InvalidMethod(other.to_string())),
		};
		Ok(json_response(id, result))
	}

	fn initialize_result(&self) -> Value {
		let mut capabilities = json!({
			"tools": {"listChanged": false},
			"prompts": {"listChanged": false},
		});
		if self.upstreams.len() == 1 {
			capabilities["resources"] = json!({"listChanged": false});
		}
		json!({
			"protocolVersion": "2025-06-18",
			"capabilities": capabilities,
			"serverInfo": {
				"name": "flowgate",
				"version": env!("CARGO_PKG_VERSION"),
			},
		})
	}

	/// Fan a list request out to every target and merge, rewriting names to
	/// the federated namespace. Targets that fail simply contribute nothing,
	/// so a missing upstream makes its tools vanish rather than failing the
	/// whole listing.
	async fn merge_lists(
		&self,
		method: &str,
		key: &str,
		params: Value,
	) -> Result<Value, UpstreamError> {
		let calls = self.upstreams.iter().map(|upstream| {
			let params = params.clone();
			async move {
				(
					upstream.name.clone(),
					upstream.send_request(method, params).await,
				)
			}
		});
		let mut merged: Vec<Value> = vec![];
		let mut seen = std::collections::HashSet::new();
		for (target, result) in join_all(calls).await {
			let items = match result {
				Ok(v) => v.get(key).and_then(|t| t.as_array()).cloned().unwrap_or_default(),
				Err(e) => {
					warn!(target = %target, "list fanout failed: {e}");
					continue;
				},
			};
			for mut item in items {
				if let Some(name) = item.get("name").and_then(|n| n.as_str()) {
					let renamed = self.prefixed(&target, name);
					if !seen.insert(renamed.clone()) {
						debug!("dropping duplicate entry {renamed}");
						continue;
					}
					item["name"] = Value::String(renamed);
				}
				merged.push(item);
			}
		}
		Ok(json!({ key: merged }))
	}

	fn authorize(
		&self,
		parts: &::http::request::Parts,
		resource: ResourceType,
	) -> Result<(), UpstreamError> {
		let mut ctx = ContextBuilder::new();
		for e in self.policies.iter_expressions() {
			ctx.register_expression(e);
		}
		// The HTTP request context (headers, verified identity) is visible to
		// the rules alongside the mcp attribute.
		let req = ::http::Request::from_parts(parts.clone(), crate::http::Body::empty());
		ctx.with_request(&req, flowgate_core::telemetry::render_current_time());
		if let Some(claims) = parts.extensions.get::<crate::http::jwt::Claims>() {
			ctx.with_jwt(claims);
		}
		if self.policies.validate(&resource, &ctx) {
			Ok(())
		} else {
			Err(UpstreamError::Authorization)
		}
	}

	fn record_call(&self, method: &str, target: &str, resource: &str) {
		self
			.client
			.inputs
			.metrics
			.mcp_calls
			.get_or_create(&MCPCallLabels {
				method: method.into(),
				target: target.into(),
				resource: resource.into(),
			})
			.inc();
	}
}

fn json_response(id: Option<Value>, result: Value) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/json")
		.body(crate::http::Body::from(
			jsonrpc::response(id, result).to_string(),
		))
		.expect("static response must build")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::agent::{McpTarget, McpTargetSpec, SimpleBackendReference};

	fn backend(targets: &[&str], always_prefix: bool) -> McpBackend {
		McpBackend {
			targets: targets
				.iter()
				.map(|name| {
					Arc::new(McpTarget {
						name: (*name).into(),
						spec: McpTargetSpec::Streamable {
							backend: SimpleBackendReference::Invalid,
							path: "/mcp".to_string(),
						},
					})
				})
				.collect(),
			stateful: true,
			always_use_prefix: always_prefix,
		}
	}

	fn relay(targets: &[&str], always_prefix: bool) -> Relay {
		Relay::new(
			crate::proxy::PolicyClient {
				inputs: crate::ProxyInputs::test_default(),
			},
			"mcp".into(),
			backend(targets, always_prefix),
			McpAuthorization::default(),
		)
	}

	#[tokio::test]
	async fn prefix_parse_round_trip() {
		let r = relay(&["a", "b"], false);
		assert_eq!(r.prefixed("a", "echo"), "a_echo");
		let (upstream, tool) = r.parse_resource_name("b_echo").unwrap();
		assert_eq!(upstream.name, "b");
		assert_eq!(tool, "echo");
		assert!(r.parse_resource_name("c_echo").is_err());
	}

	#[tokio::test]
	async fn single_target_skips_prefix() {
		let r = relay(&["only"], false);
		assert_eq!(r.prefixed("only", "echo"), "echo");
		let (upstream, tool) = r.parse_resource_name("echo").unwrap();
		assert_eq!(upstream.name, "only");
		assert_eq!(tool, "echo");
	}

	#[tokio::test]
	async fn single_target_with_forced_prefix() {
		let r = relay(&["only"], true);
		assert_eq!(r.prefixed("only", "echo"), "only_echo");
		let (_, tool) = r.parse_resource_name("only_echo").unwrap();
		assert_eq!(tool, "echo");
	}
}
