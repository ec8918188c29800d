use bytes::Bytes;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::llm::policy::PromptCaching;
use crate::llm::{AIError, LLMInfo, universal};
use crate::parse::sse;
use crate::telemetry::log::AsyncLog;

pub const DEFAULT_HOST_STR: &str = "api.anthropic.com";
pub const DEFAULT_HOST: Strng = strng::literal!("api.anthropic.com");
pub const DEFAULT_PATH: &str = "/v1/messages";
pub const VERSION_HEADER: &str = "2023-06-01";

const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	#[serde(default)]
	pub model: Option<Strng>,
}

/// The Messages API request shape, with passthrough for the fields we don't
/// operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
	pub model: String,
	pub max_tokens: u64,
	pub messages: Vec<MessagesMessage>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesMessage {
	pub role: String,
	pub content: Value,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
	#[serde(default)]
	id: Option<String>,
	model: String,
	#[serde(default)]
	content: Vec<ContentBlock>,
	#[serde(default)]
	stop_reason: Option<String>,
	usage: MessagesUsage,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
	#[serde(rename = "type")]
	block_type: String,
	#[serde(default)]
	text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MessagesUsage {
	#[serde(default)]
	input_tokens: u64,
	#[serde(default)]
	output_tokens: u64,
}

impl Provider {
	pub const NAME: Strng = strng::literal!("anthropic");

	/// Chat Completions -> Messages. System messages hoist into `system`;
	/// sampling parameters carry over; `max_tokens` is mandatory upstream so
	/// a default applies.
	pub fn translate_request(
		&self,
		req: &universal::Request,
		caching: Option<&PromptCaching>,
	) -> Result<Vec<u8>, AIError> {
		let model = req
			.model
			.clone()
			.ok_or(AIError::MissingField(strng::literal!("model")))?;

		let mut system_parts: Vec<String> = vec![];
		let mut messages: Vec<MessagesMessage> = vec![];
		for m in &req.messages {
			match m.role.as_str() {
				"system" | "developer" => {
					if let Some(text) = m.message_text() {
						system_parts.push(text);
					}
				},
				role => {
					let text = m.message_text().unwrap_or_default();
					messages.push(MessagesMessage {
						role: if role == "assistant" { "assistant" } else { "user" }.to_string(),
						content: Value::String(text),
						rest: Map::new(),
					});
				},
			}
		}
		let system = if system_parts.is_empty() {
			None
		} else {
			let joined = system_parts.join("\n");
			Some(match caching {
				// Cache markers go on blocks worth caching; ~4 chars/token.
				Some(c) if (joined.len() as u64) / 4 >= c.min_tokens => json!([{
					"type": "text",
					"text": joined,
					"cache_control": {"type": "ephemeral"},
				}]),
				_ => Value::String(joined),
			})
		};

		let translated = MessagesRequest {
			model,
			max_tokens: req
				.max_tokens
				.or(req.max_completion_tokens)
				.unwrap_or(DEFAULT_MAX_TOKENS),
			messages,
			system,
			stream: req.stream,
			temperature: req.temperature,
			top_p: req.top_p,
			rest: Map::new(),
		};
		serde_json::to_vec(&translated).map_err(AIError::RequestMarshal)
	}

	pub fn translate_response(&self, bytes: &[u8]) -> Result<universal::Response, AIError> {
		let resp: MessagesResponse =
			serde_json::from_slice(bytes).map_err(AIError::ResponseParsing)?;
		let text = resp
			.content
			.iter()
			.filter(|b| b.block_type == "text")
			.filter_map(|b| b.text.as_deref())
			.collect::<Vec<_>>()
			.join("");
		Ok(universal::Response {
			id: resp.id,
			model: resp.model,
			choices: vec![universal::Choice {
				index: 0,
				message: universal::Message::text("assistant", text),
				finish_reason: resp.stop_reason.as_deref().map(map_stop_reason),
				rest: Map::new(),
			}],
			usage: Some(universal::Usage {
				prompt_tokens: resp.usage.input_tokens,
				completion_tokens: resp.usage.output_tokens,
				total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
				rest: Map::new(),
			}),
			rest: Map::new(),
		})
	}

	pub fn process_error(&self, bytes: &[u8]) -> universal::ErrorResponse {
		#[derive(Deserialize)]
		struct AnthropicError {
			error: AnthropicErrorDetail,
		}
		#[derive(Deserialize)]
		struct AnthropicErrorDetail {
			#[serde(rename = "type")]
			error_type: String,
			message: String,
		}
		match serde_json::from_slice::<AnthropicError>(bytes) {
			Ok(e) => universal::ErrorResponse::new(e.error.error_type, e.error.message),
			Err(_) => universal::ErrorResponse::new(
				"api_error",
				String::from_utf8_lossy(bytes).to_string(),
			),
		}
	}

	/// Re-emit the Anthropic event stream as OpenAI chat deltas, feeding
	/// usage into the log as it arrives.
	pub fn process_streaming(
		&self,
		log: AsyncLog<LLMInfo>,
		resp: crate::http::Response,
		include_completion: bool,
	) -> crate::http::Response {
		let limit = crate::http::response_buffer_limit(&resp);
		resp.map(move |body| {
			let mut completion = include_completion.then(String::new);
			let mut model = String::new();
			let mut first_token_seen = false;
			let log = log.clone();
			sse::transform(body, limit, move |event| {
				let Some(event) = event else {
					return vec![Bytes::from_static(b"data: [DONE]\n\n")];
				};
				let Ok(parsed) = serde_json::from_str::<Value>(&event.data) else {
					return vec![];
				};
				let event_type = parsed
					.get("type")
					.and_then(|t| t.as_str())
					.unwrap_or_default()
					.to_string();
				let mut out = vec![];
				match event_type.as_str() {
					"message_start" => {
						if let Some(message) = parsed.get("message") {
							model = message
								.get("model")
								.and_then(|m| m.as_str())
								.unwrap_or_default()
								.to_string();
							let input = message
								.pointer("/usage/input_tokens")
								.and_then(|v| v.as_u64());
							log.non_atomic_mutate(|info| {
								info.response.provider_model = Some(strng::new(&model));
								info.response.input_tokens = input;
							});
							out.push(delta_frame(&model, json!({"role": "assistant"}), None));
						}
					},
					"content_block_delta" => {
						if let Some(text) = parsed
							.pointer("/delta/text")
							.and_then(|t| t.as_str())
						{
							if !first_token_seen {
								first_token_seen = true;
								log.non_atomic_mutate(|info| {
									info.response.first_token = Some(std::time::Instant::now());
								});
							}
							if let Some(c) = completion.as_mut() {
								c.push_str(text);
							}
							out.push(delta_frame(&model, json!({"content": text}), None));
						}
					},
					"message_delta" => {
						let output = parsed
							.pointer("/usage/output_tokens")
							.and_then(|v| v.as_u64());
						let stop = parsed
							.pointer("/delta/stop_reason")
							.and_then(|v| v.as_str())
							.map(map_stop_reason);
						log.non_atomic_mutate(|info| {
							info.response.output_tokens = output;
							if let (Some(i), Some(o)) = (info.response.input_tokens, output) {
								info.response.total_tokens = Some(i + o);
							}
						});
						let usage = {
							let taken = log.take();
							let usage = taken.as_ref().and_then(|info| {
								Some(json!({
									"prompt_tokens": info.response.input_tokens?,
									"completion_tokens": output.unwrap_or_default(),
									"total_tokens": info.response.total_tokens?,
								}))
							});
							log.store(taken);
							usage
						};
						out.push(finish_frame(&model, stop.as_deref(), usage));
					},
					"message_stop" => {
						if let Some(c) = completion.take() {
							log.non_atomic_mutate(|info| {
								info.response.completion = Some(vec![c]);
							});
						}
					},
					_ => {},
				}
				out
			})
		})
	}
}

fn delta_frame(model: &str, delta: Value, finish: Option<&str>) -> Bytes {
	let frame = json!({
		"object": "chat.completion.chunk",
		"model": model,
		"choices": [{
			"index": 0,
			"delta": delta,
			"finish_reason": finish,
		}],
	});
	sse::encode_event(&sse::Event {
		event: None,
		data: frame.to_string(),
	})
}

fn finish_frame(model: &str, finish: Option<&str>, usage: Option<Value>) -> Bytes {
	let mut frame = json!({
		"object": "chat.completion.chunk",
		"model": model,
		"choices": [{
			"index": 0,
			"delta": {},
			"finish_reason": finish,
		}],
	});
	if let Some(usage) = usage {
		frame["usage"] = usage;
	}
	sse::encode_event(&sse::Event {
		event: None,
		data: frame.to_string(),
	})
}

fn map_stop_reason(reason: &str) -> String {
	match reason {
		"end_turn" | "stop_sequence" => "stop",
		"max_tokens" => "length",
		"tool_use" => "tool_calls",
		other => other,
	}
	.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(json: Value) -> universal::Request {
		serde_json::from_value(json).unwrap()
	}

	#[test]
	fn system_messages_hoisted() {
		let p = Provider::default();
		let req = request(json!({
			"model": "claude-sonnet-4-5",
			"messages": [
				{"role": "system", "content": "be kind"},
				{"role": "user", "content": "hi"},
			],
			"max_tokens": 100,
		}));
		let out: Value =
			serde_json::from_slice(&p.translate_request(&req, None).unwrap()).unwrap();
		assert_eq!(out["system"], json!("be kind"));
		assert_eq!(out["messages"], json!([{"role": "user", "content": "hi"}]));
		assert_eq!(out["max_tokens"], json!(100));
	}

	#[test]
	fn max_tokens_defaulted() {
		let p = Provider::default();
		let req = request(json!({
			"model": "claude-sonnet-4-5",
			"messages": [{"role": "user", "content": "hi"}],
		}));
		let out: Value =
			serde_json::from_slice(&p.translate_request(&req, None).unwrap()).unwrap();
		assert_eq!(out["max_tokens"], json!(DEFAULT_MAX_TOKENS));
	}

	#[test]
	fn caching_marker_added_for_long_system() {
		let p = Provider::default();
		let long = "x".repeat(400);
		let req = request(json!({
			"model": "claude-sonnet-4-5",
			"messages": [
				{"role": "system", "content": long},
				{"role": "user", "content": "hi"},
			],
		}));
		let caching = PromptCaching { min_tokens: 50 };
		let out: Value = serde_json::from_slice(
			&p.translate_request(&req, Some(&caching)).unwrap(),
		)
		.unwrap();
		assert_eq!(out["system"][0]["cache_control"]["type"], json!("ephemeral"));
	}

	#[test]
	fn response_translation() {
		let p = Provider::default();
		let resp = json!({
			"id": "msg_1",
			"model": "claude-sonnet-4-5",
			"content": [{"type": "text", "text": "hello"}],
			"stop_reason": "end_turn",
			"usage": {"input_tokens": 10, "output_tokens": 5},
		});
		let out = p
			.translate_response(&serde_json::to_vec(&resp).unwrap())
			.unwrap();
		assert_eq!(out.choices[0].message.message_text().as_deref(), Some("hello"));
		assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
		let usage = out.usage.unwrap();
		assert_eq!(usage.prompt_tokens + usage.completion_tokens, usage.total_tokens);
	}
}
