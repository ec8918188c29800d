//! OpenAPI targets: MCP tools synthesized from an OpenAPI document, invoked
//! as plain HTTP calls through the shared client.

use std::sync::Arc;

use openapiv3::{OpenAPI, Operation, Parameter, ReferenceOr};
use serde_json::{Map, Value, json};

use super::UpstreamError;
use crate::http::header;
use crate::proxy::PolicyClient;
use crate::types::agent::SimpleBackendReference;

pub struct OpenAPIClient {
	client: PolicyClient,
	backend: SimpleBackendReference,
	tools: Vec<SynthesizedTool>,
}

#[derive(Debug, Clone)]
struct SynthesizedTool {
	name: String,
	description: Option<String>,
	method: ::http::Method,
	path: String,
	path_params: Vec<String>,
	query_params: Vec<String>,
	has_body: bool,
	input_schema: Value,
}

impl OpenAPIClient {
	pub fn new(
		client: PolicyClient,
		backend: SimpleBackendReference,
		schema: Arc<OpenAPI>,
	) -> Result<OpenAPIClient, UpstreamError> {
		let tools = synthesize_tools(&schema)
			.map_err(|e| UpstreamError::Protocol(format!("bad openapi schema: {e}")))?;
		Ok(OpenAPIClient {
			client,
			backend,
			tools,
		})
	}

	pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
		match method {
			"initialize" => Ok(json!({
				"protocolVersion": "2025-06-18",
				"capabilities": {"tools": {}},
				"serverInfo": {"name": "flowgate-openapi", "version": env!("CARGO_PKG_VERSION")},
			})),
			"tools/list" => Ok(json!({
				"tools": self.tools.iter().map(|t| {
					json!({
						"name": t.name,
						"description": t.description,
						"inputSchema": t.input_schema,
					})
				}).collect::<Vec<_>>(),
			})),
			"tools/call" => self.call_tool(params).await,
			"ping" => Ok(json!({})),
			other => Err(UpstreamError::InvalidMethod(other.to_string())),
		}
	}

	async fn call_tool(&self, params: Value) -> Result<Value, UpstreamError> {
		let name = params
			.get("name")
			.and_then(|n| n.as_str())
			.ok_or_else(|| UpstreamError::Protocol("tools/call without name".to_string()))?;
		let tool = self
			.tools
			.iter()
			.find(|t| t.name == name)
			.ok_or_else(|| UpstreamError::UnknownTarget(name.to_string()))?;
		let arguments = params
			.get("arguments")
			.and_then(|a| a.as_object())
			.cloned()
			.unwrap_or_default();

		let mut path = tool.path.clone();
		for p in &tool.path_params {
			let value = arguments
				.get(p)
				.map(value_to_plain_string)
				.ok_or_else(|| {
					UpstreamError::Protocol(format!("missing path parameter {p}"))
				})?;
			path = path.replace(&format!("{{{p}}}"), &value);
		}
		let mut query_pairs = vec![];
		for q in &tool.query_params {
			if let Some(v) = arguments.get(q) {
				query_pairs.push(format!("{q}={}", value_to_plain_string(v)));
			}
		}
		if !query_pairs.is_empty() {
			path = format!("{path}?{}", query_pairs.join("&"));
		}

		let mut builder = ::http::Request::builder()
			.method(tool.method.clone())
			.uri(path.as_str());
		let body = if tool.has_body {
			let mut body: Map<String, Value> = arguments.clone();
			for p in tool.path_params.iter().chain(tool.query_params.iter()) {
				body.remove(p);
			}
			builder = builder.header(header::CONTENT_TYPE, "application/json");
			crate::http::Body::from(Value::Object(body).to_string())
		} else {
			crate::http::Body::empty()
		};
		let req = builder
			.body(body)
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		let resp = self
			.client
			.call_reference(req, &self.backend)
			.await
			.map_err(|e| UpstreamError::Transport(e.to_string()))?;
		let status = resp.status();
		let bytes = crate::http::read_body_with_limit(resp.into_body(), 4_194_304)
			.await
			.map_err(|e| UpstreamError::Transport(format!("read response: {e}")))?;
		let text = String::from_utf8_lossy(&bytes).to_string();
		Ok(json!({
			"content": [{"type": "text", "text": text}],
			"isError": !status.is_success(),
		}))
	}
}

fn synthesize_tools(schema: &OpenAPI) -> anyhow::Result<Vec<SynthesizedTool>> {
	let mut tools = vec![];
	for (path, item) in schema.paths.iter() {
		let ReferenceOr::Item(item) = item else {
			continue;
		};
		let ops: [(&::http::Method, Option<&Operation>); 4] = [
			(&::http::Method::GET, item.get.as_ref()),
			(&::http::Method::POST, item.post.as_ref()),
			(&::http::Method::PUT, item.put.as_ref()),
			(&::http::Method::DELETE, item.delete.as_ref()),
		];
		for (method, op) in ops {
			let Some(op) = op else { continue };
			let name = match &op.operation_id {
				Some(id) => id.clone(),
				// No operationId: derive something stable from the route.
				None => format!(
					"{}_{}",
					method.as_str().to_lowercase(),
					path.trim_matches('/').replace(['/', '{', '}'], "_"),
				),
			};
			let mut path_params = vec![];
			let mut query_params = vec![];
			let mut properties = Map::new();
			let mut required = vec![];
			for p in &op.parameters {
				let ReferenceOr::Item(p) = p else { continue };
				match p {
					Parameter::Path { parameter_data, .. } => {
						path_params.push(parameter_data.name.clone());
						required.push(Value::String(parameter_data.name.clone()));
						properties
							.insert(parameter_data.name.clone(), json!({"type": "string"}));
					},
					Parameter::Query { parameter_data, .. } => {
						query_params.push(parameter_data.name.clone());
						if parameter_data.required {
							required.push(Value::String(parameter_data.name.clone()));
						}
						properties
							.insert(parameter_data.name.clone(), json!({"type": "string"}));
					},
					_ => {},
				}
			}
			let has_body = op.request_body.is_some();
			if has_body {
				properties.insert("body".to_string(), json!({"type": "object"}));
			}
			tools.push(SynthesizedTool {
				name,
				description: op.summary.clone().or_else(|| op.description.clone()),
				method: method.clone(),
				path: path.clone(),
				path_params,
				query_params,
				has_body,
				input_schema: json!({
					"type": "object",
					"properties": properties,
					"required": required,
				}),
			});
		}
	}
	Ok(tools)
}

fn value_to_plain_string(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> OpenAPI {
		serde_json::from_value(json!({
			"openapi": "3.0.0",
			"info": {"title": "pets", "version": "1.0.0"},
			"paths": {
				"/pets/{petId}": {
					"get": {
						"operationId": "getPet",
						"summary": "Fetch a pet",
						"parameters": [
							{"name": "petId", "in": "path", "required": true,
								"schema": {"type": "string"}},
							{"name": "verbose", "in": "query", "required": false,
								"schema": {"type": "boolean"}},
						],
						"responses": {"200": {"description": "ok"}},
					},
				},
			},
		}))
		.unwrap()
	}

	#[test]
	fn tools_synthesized_from_operations() {
		let tools = synthesize_tools(&schema()).unwrap();
		assert_eq!(tools.len(), 1);
		let t = &tools[0];
		assert_eq!(t.name, "getPet");
		assert_eq!(t.method, ::http::Method::GET);
		assert_eq!(t.path_params, vec!["petId"]);
		assert_eq!(t.query_params, vec!["verbose"]);
		assert_eq!(t.input_schema["required"], json!(["petId"]));
	}
}
