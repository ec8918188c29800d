use bytes::Bytes;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::llm::{AIError, LLMInfo, universal};
use crate::parse::sse;
use crate::telemetry::log::AsyncLog;

pub const DEFAULT_HOST_STR: &str = "generativelanguage.googleapis.com";
pub const DEFAULT_HOST: Strng = strng::literal!("generativelanguage.googleapis.com");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	#[serde(default)]
	pub model: Option<Strng>,
}

impl Provider {
	pub const NAME: Strng = strng::literal!("gemini");

	pub fn get_path_for_model(&self, model: &str, streaming: bool) -> String {
		if streaming {
			format!("/v1beta/models/{model}:streamGenerateContent?alt=sse")
		} else {
			format!("/v1beta/models/{model}:generateContent")
		}
	}
}

/// Chat Completions -> `generateContent`. Shared with the Vertex provider,
/// which speaks the same dialect on a different host.
pub fn translate_request(req: &universal::Request) -> Result<Vec<u8>, AIError> {
	let mut contents = vec![];
	let mut system_parts: Vec<Value> = vec![];
	for m in &req.messages {
		let text = m.message_text().unwrap_or_default();
		match m.role.as_str() {
			"system" | "developer" => system_parts.push(json!({"text": text})),
			"assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
			_ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
		}
	}
	let mut body = json!({ "contents": contents });
	if !system_parts.is_empty() {
		body["systemInstruction"] = json!({ "parts": system_parts });
	}
	let mut generation_config = Map::new();
	if let Some(t) = req.temperature {
		generation_config.insert("temperature".to_string(), json!(t));
	}
	if let Some(t) = req.top_p {
		generation_config.insert("topP".to_string(), json!(t));
	}
	if let Some(m) = req.max_tokens.or(req.max_completion_tokens) {
		generation_config.insert("maxOutputTokens".to_string(), json!(m));
	}
	if let Some(s) = req.seed {
		generation_config.insert("seed".to_string(), json!(s));
	}
	if !generation_config.is_empty() {
		body["generationConfig"] = Value::Object(generation_config);
	}
	serde_json::to_vec(&body).map_err(AIError::RequestMarshal)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
	#[serde(default)]
	candidates: Vec<Candidate>,
	#[serde(default)]
	usage_metadata: Option<UsageMetadata>,
	#[serde(default)]
	model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
	#[serde(default)]
	content: Option<CandidateContent>,
	#[serde(default)]
	finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
	#[serde(default)]
	parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
	#[serde(default)]
	text: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
	#[serde(default)]
	prompt_token_count: u64,
	#[serde(default)]
	candidates_token_count: u64,
	#[serde(default)]
	total_token_count: u64,
}

pub fn translate_response(
	bytes: &[u8],
	request_model: &str,
) -> Result<universal::Response, AIError> {
	let resp: GenerateContentResponse =
		serde_json::from_slice(bytes).map_err(AIError::ResponseParsing)?;
	let text = resp
		.candidates
		.first()
		.and_then(|c| c.content.as_ref())
		.map(|c| {
			c.parts
				.iter()
				.filter_map(|p| p.text.as_deref())
				.collect::<Vec<_>>()
				.join("")
		})
		.unwrap_or_default();
	let finish = resp
		.candidates
		.first()
		.and_then(|c| c.finish_reason.as_deref())
		.map(map_finish_reason);
	Ok(universal::Response {
		id: None,
		model: resp
			.model_version
			.unwrap_or_else(|| request_model.to_string()),
		choices: vec![universal::Choice {
			index: 0,
			message: universal::Message::text("assistant", text),
			finish_reason: finish,
			rest: Map::new(),
		}],
		usage: resp.usage_metadata.map(|u| universal::Usage {
			prompt_tokens: u.prompt_token_count,
			completion_tokens: u.candidates_token_count,
			total_tokens: u.total_token_count,
			rest: Map::new(),
		}),
		rest: Map::new(),
	})
}

pub fn process_error(bytes: &[u8]) -> universal::ErrorResponse {
	#[derive(Deserialize)]
	struct GoogleError {
		error: GoogleErrorDetail,
	}
	#[derive(Deserialize)]
	struct GoogleErrorDetail {
		#[serde(default)]
		status: Option<String>,
		message: String,
	}
	match serde_json::from_slice::<GoogleError>(bytes) {
		Ok(e) => universal::ErrorResponse::new(
			e.error.status.unwrap_or_else(|| "api_error".to_string()),
			e.error.message,
		),
		Err(_) => universal::ErrorResponse::new(
			"api_error",
			String::from_utf8_lossy(bytes).to_string(),
		),
	}
}

/// Streamed `generateContent` chunks re-emitted as OpenAI deltas.
pub fn process_streaming(
	log: AsyncLog<LLMInfo>,
	resp: crate::http::Response,
	request_model: String,
	include_completion: bool,
) -> crate::http::Response {
	let limit = crate::http::response_buffer_limit(&resp);
	resp.map(move |body| {
		let mut completion = include_completion.then(String::new);
		let mut first_token_seen = false;
		let log = log.clone();
		sse::transform(body, limit, move |event| {
			let Some(event) = event else {
				if let Some(c) = completion.take() {
					log.non_atomic_mutate(|info| info.response.completion = Some(vec![c]));
				}
				return vec![Bytes::from_static(b"data: [DONE]\n\n")];
			};
			let Ok(chunk) = serde_json::from_str::<GenerateContentResponse>(&event.data) else {
				return vec![];
			};
			let mut out = vec![];
			let model = chunk
				.model_version
				.clone()
				.unwrap_or_else(|| request_model.clone());
			if let Some(text) = chunk
				.candidates
				.first()
				.and_then(|c| c.content.as_ref())
				.and_then(|c| c.parts.first())
				.and_then(|p| p.text.as_deref())
			{
				if !first_token_seen {
					first_token_seen = true;
					log.non_atomic_mutate(|info| {
						info.response.provider_model = Some(strng::new(&model));
						info.response.first_token = Some(std::time::Instant::now());
					});
				}
				if let Some(c) = completion.as_mut() {
					c.push_str(text);
				}
				let frame = json!({
					"object": "chat.completion.chunk",
					"model": model,
					"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}],
				});
				out.push(sse::encode_event(&sse::Event {
					event: None,
					data: frame.to_string(),
				}));
			}
			if let Some(usage) = chunk.usage_metadata {
				log.non_atomic_mutate(|info| {
					info.response.input_tokens = Some(usage.prompt_token_count);
					info.response.output_tokens = Some(usage.candidates_token_count);
					info.response.total_tokens = Some(usage.total_token_count);
				});
			}
			if let Some(finish) = chunk
				.candidates
				.first()
				.and_then(|c| c.finish_reason.as_deref())
			{
				let usage = chunk.usage_metadata.unwrap_or_default();
				let frame = json!({
					"object": "chat.completion.chunk",
					"model": model,
					"choices": [{
						"index": 0,
						"delta": {},
						"finish_reason": map_finish_reason(finish),
					}],
					"usage": {
						"prompt_tokens": usage.prompt_token_count,
						"completion_tokens": usage.candidates_token_count,
						"total_tokens": usage.total_token_count,
					},
				});
				out.push(sse::encode_event(&sse::Event {
					event: None,
					data: frame.to_string(),
				}));
			}
			out
		})
	})
}

fn map_finish_reason(reason: &str) -> String {
	match reason {
		"STOP" => "stop",
		"MAX_TOKENS" => "length",
		"SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
		other => other,
	}
	.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_translation() {
		let req: universal::Request = serde_json::from_value(json!({
			"model": "gemini-2.5-flash",
			"messages": [
				{"role": "system", "content": "short answers"},
				{"role": "user", "content": "hi"},
				{"role": "assistant", "content": "hello"},
				{"role": "user", "content": "bye"},
			],
			"temperature": 0.2,
			"max_tokens": 64,
		}))
		.unwrap();
		let out: Value = serde_json::from_slice(&translate_request(&req).unwrap()).unwrap();
		assert_eq!(out["systemInstruction"]["parts"][0]["text"], json!("short answers"));
		assert_eq!(out["contents"][1]["role"], json!("model"));
		assert_eq!(out["generationConfig"]["maxOutputTokens"], json!(64));
	}

	#[test]
	fn response_translation() {
		let resp = json!({
			"candidates": [{
				"content": {"parts": [{"text": "hello"}], "role": "model"},
				"finishReason": "STOP",
			}],
			"usageMetadata": {
				"promptTokenCount": 4,
				"candidatesTokenCount": 2,
				"totalTokenCount": 6,
			},
			"modelVersion": "gemini-2.5-flash",
		});
		let out =
			translate_response(&serde_json::to_vec(&resp).unwrap(), "gemini-2.5-flash").unwrap();
		assert_eq!(out.choices[0].message.message_text().as_deref(), Some("hello"));
		assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
		assert_eq!(out.usage.unwrap().total_tokens, 6);
	}
}
