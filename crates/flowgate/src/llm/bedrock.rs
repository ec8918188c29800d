use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use flowgate_core::prelude::*;
use http_body::{Body as HttpBody, Frame, SizeHint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::llm::{AIError, LLMInfo, universal};
use crate::parse::aws_sse;
use crate::parse::sse;
use crate::telemetry::log::AsyncLog;

/// Bedrock speaks the Converse API over SigV4-signed HTTPS; streaming uses
/// the AWS binary event stream rather than SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	pub region: Strng,
	#[serde(default)]
	pub model: Option<Strng>,
}

impl Provider {
	pub const NAME: Strng = strng::literal!("bedrock");

	pub fn get_host(&self) -> Strng {
		strng::format!("bedrock-runtime.{}.amazonaws.com", self.region)
	}

	pub fn get_path_for_model(&self, streaming: bool, model: &str) -> String {
		if streaming {
			format!("/model/{model}/converse-stream")
		} else {
			format!("/model/{model}/converse")
		}
	}

	pub fn translate_request(&self, req: &universal::Request) -> Result<Vec<u8>, AIError> {
		let mut system = vec![];
		let mut messages = vec![];
		for m in &req.messages {
			let text = m.message_text().unwrap_or_default();
			match m.role.as_str() {
				"system" | "developer" => system.push(json!({"text": text})),
				"assistant" => {
					messages.push(json!({"role": "assistant", "content": [{"text": text}]}))
				},
				_ => messages.push(json!({"role": "user", "content": [{"text": text}]})),
			}
		}
		let mut body = json!({ "messages": messages });
		if !system.is_empty() {
			body["system"] = Value::Array(system);
		}
		let mut inference = Map::new();
		if let Some(t) = req.temperature {
			inference.insert("temperature".to_string(), json!(t));
		}
		if let Some(t) = req.top_p {
			inference.insert("topP".to_string(), json!(t));
		}
		if let Some(m) = req.max_tokens.or(req.max_completion_tokens) {
			inference.insert("maxTokens".to_string(), json!(m));
		}
		if !inference.is_empty() {
			body["inferenceConfig"] = Value::Object(inference);
		}
		serde_json::to_vec(&body).map_err(AIError::RequestMarshal)
	}

	pub fn translate_response(
		&self,
		bytes: &[u8],
		request_model: &str,
	) -> Result<universal::Response, AIError> {
		#[derive(Deserialize)]
		#[serde(rename_all = "camelCase")]
		struct ConverseResponse {
			output: ConverseOutput,
			#[serde(default)]
			stop_reason: Option<String>,
			usage: ConverseUsage,
		}
		#[derive(Deserialize)]
		struct ConverseOutput {
			message: ConverseMessage,
		}
		#[derive(Deserialize)]
		struct ConverseMessage {
			#[serde(default)]
			content: Vec<Value>,
		}
		let resp: ConverseResponse =
			serde_json::from_slice(bytes).map_err(AIError::ResponseParsing)?;
		let text = resp
			.output
			.message
			.content
			.iter()
			.filter_map(|c| c.get("text").and_then(|t| t.as_str()))
			.collect::<Vec<_>>()
			.join("");
		Ok(universal::Response {
			id: None,
			model: request_model.to_string(),
			choices: vec![universal::Choice {
				index: 0,
				message: universal::Message::text("assistant", text),
				finish_reason: resp.stop_reason.as_deref().map(map_stop_reason),
				rest: Map::new(),
			}],
			usage: Some(universal::Usage {
				prompt_tokens: resp.usage.input_tokens,
				completion_tokens: resp.usage.output_tokens,
				total_tokens: resp.usage.total_tokens,
				rest: Map::new(),
			}),
			rest: Map::new(),
		})
	}

	pub fn process_error(&self, bytes: &[u8]) -> universal::ErrorResponse {
		#[derive(Deserialize)]
		struct BedrockError {
			message: String,
		}
		match serde_json::from_slice::<BedrockError>(bytes) {
			Ok(e) => universal::ErrorResponse::new("api_error", e.message),
			Err(_) => universal::ErrorResponse::new(
				"api_error",
				String::from_utf8_lossy(bytes).to_string(),
			),
		}
	}

	/// Decode the AWS event stream and re-emit OpenAI SSE deltas; the
	/// response content type changes accordingly.
	pub fn process_streaming(
		&self,
		log: AsyncLog<LLMInfo>,
		resp: crate::http::Response,
		request_model: &str,
	) -> crate::http::Response {
		let model = request_model.to_string();
		let (mut parts, body) = resp.into_parts();
		parts.headers.remove(crate::http::header::CONTENT_LENGTH);
		parts.headers.insert(
			crate::http::header::CONTENT_TYPE,
			crate::http::HeaderValue::from_static("text/event-stream"),
		);
		let translated = ConverseStreamBody {
			inner: body,
			decoder: aws_sse::Decoder::default(),
			log,
			model,
			first_token_seen: false,
			pending: std::collections::VecDeque::new(),
			done: false,
		};
		::http::Response::from_parts(parts, crate::http::Body::new(translated))
	}
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
	#[serde(default)]
	input_tokens: u64,
	#[serde(default)]
	output_tokens: u64,
	#[serde(default)]
	total_tokens: u64,
}

struct ConverseStreamBody {
	inner: crate::http::Body,
	decoder: aws_sse::Decoder,
	log: AsyncLog<LLMInfo>,
	model: String,
	first_token_seen: bool,
	pending: std::collections::VecDeque<Bytes>,
	done: bool,
}

impl ConverseStreamBody {
	fn handle(&mut self, message: aws_sse::Message) {
		let Ok(payload) = serde_json::from_slice::<Value>(&message.payload) else {
			return;
		};
		match message.event_type.as_deref() {
			Some("contentBlockDelta") => {
				if let Some(text) = payload.pointer("/delta/text").and_then(|t| t.as_str()) {
					if !self.first_token_seen {
						self.first_token_seen = true;
						self.log.non_atomic_mutate(|info| {
							info.response.first_token = Some(std::time::Instant::now());
						});
					}
					let frame = json!({
						"object": "chat.completion.chunk",
						"model": self.model,
						"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}],
					});
					self.pending.push_back(sse::encode_event(&sse::Event {
						event: None,
						data: frame.to_string(),
					}));
				}
			},
			Some("messageStop") => {
				let finish = payload
					.get("stopReason")
					.and_then(|s| s.as_str())
					.map(map_stop_reason);
				let frame = json!({
					"object": "chat.completion.chunk",
					"model": self.model,
					"choices": [{"index": 0, "delta": {}, "finish_reason": finish}],
				});
				self.pending.push_back(sse::encode_event(&sse::Event {
					event: None,
					data: frame.to_string(),
				}));
			},
			Some("metadata") => {
				if let Ok(usage) = serde_json::from_value::<ConverseUsage>(
					payload.get("usage").cloned().unwrap_or(Value::Null),
				) {
					self.log.non_atomic_mutate(|info| {
						info.response.input_tokens = Some(usage.input_tokens);
						info.response.output_tokens = Some(usage.output_tokens);
						info.response.total_tokens = Some(usage.total_tokens);
					});
					let frame = json!({
						"object": "chat.completion.chunk",
						"model": self.model,
						"choices": [],
						"usage": {
							"prompt_tokens": usage.input_tokens,
							"completion_tokens": usage.output_tokens,
							"total_tokens": usage.total_tokens,
						},
					});
					self.pending.push_back(sse::encode_event(&sse::Event {
						event: None,
						data: frame.to_string(),
					}));
				}
			},
			_ => {},
		}
	}
}

impl HttpBody for ConverseStreamBody {
	type Data = Bytes;
	type Error = axum_core::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = &mut *self;
		loop {
			if let Some(chunk) = this.pending.pop_front() {
				return Poll::Ready(Some(Ok(Frame::data(chunk))));
			}
			if this.done {
				return Poll::Ready(None);
			}
			match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
				Some(Ok(frame)) => {
					if let Some(data) = frame.data_ref() {
						match this.decoder.push(data) {
							Ok(messages) => {
								for m in messages {
									this.handle(m);
								}
							},
							Err(e) => {
								tracing::debug!("failed to decode event stream: {e}");
							},
						}
					}
				},
				Some(Err(e)) => return Poll::Ready(Some(Err(e))),
				None => {
					this.done = true;
					this.pending.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
				},
			}
		}
	}

	fn is_end_stream(&self) -> bool {
		self.done && self.pending.is_empty()
	}

	fn size_hint(&self) -> SizeHint {
		SizeHint::default()
	}
}

fn map_stop_reason(reason: &str) -> String {
	match reason {
		"end_turn" | "stop_sequence" => "stop",
		"max_tokens" => "length",
		"tool_use" => "tool_calls",
		"content_filtered" => "content_filter",
		other => other,
	}
	.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_translation() {
		let p = Provider {
			region: "us-east-1".into(),
			model: None,
		};
		let req: universal::Request = serde_json::from_value(json!({
			"model": "anthropic.claude-3-haiku",
			"messages": [
				{"role": "system", "content": "hi"},
				{"role": "user", "content": "hello"},
			],
			"max_tokens": 50,
		}))
		.unwrap();
		let out: Value = serde_json::from_slice(&p.translate_request(&req).unwrap()).unwrap();
		assert_eq!(out["system"][0]["text"], json!("hi"));
		assert_eq!(out["messages"][0]["content"][0]["text"], json!("hello"));
		assert_eq!(out["inferenceConfig"]["maxTokens"], json!(50));
	}

	#[test]
	fn response_translation() {
		let p = Provider {
			region: "us-east-1".into(),
			model: None,
		};
		let resp = json!({
			"output": {"message": {"role": "assistant", "content": [{"text": "hey"}]}},
			"stopReason": "end_turn",
			"usage": {"inputTokens": 3, "outputTokens": 1, "totalTokens": 4},
		});
		let out = p
			.translate_response(&serde_json::to_vec(&resp).unwrap(), "m")
			.unwrap();
		assert_eq!(out.choices[0].message.message_text().as_deref(), Some("hey"));
		let usage = out.usage.unwrap();
		assert_eq!(usage.prompt_tokens + usage.completion_tokens, usage.total_tokens);
	}

	#[test]
	fn paths() {
		let p = Provider {
			region: "eu-west-1".into(),
			model: None,
		};
		assert_eq!(p.get_host(), "bedrock-runtime.eu-west-1.amazonaws.com");
		assert_eq!(p.get_path_for_model(true, "m"), "/model/m/converse-stream");
	}
}
