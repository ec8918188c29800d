//! The canonical LLM wire shape: OpenAI Chat Completions, parsed with a
//! passthrough strategy. Only the fields the gateway operates on are typed;
//! everything else rides along in a flattened JSON map and is re-emitted
//! unchanged, which keeps us compatible across provider API revisions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	/// Everything else, preserved verbatim.
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

impl Message {
	pub fn text(role: &str, content: impl Into<String>) -> Message {
		Message {
			role: role.to_string(),
			content: Some(Value::String(content.into())),
			name: None,
			rest: Map::new(),
		}
	}

	/// The textual content, flattening multi-part content blocks.
	pub fn message_text(&self) -> Option<String> {
		match &self.content {
			Some(Value::String(s)) => Some(s.clone()),
			Some(Value::Array(parts)) => {
				let texts: Vec<&str> = parts
					.iter()
					.filter_map(|p| {
						if p.get("type").and_then(|t| t.as_str()) == Some("text") {
							p.get("text").and_then(|t| t.as_str())
						} else {
							None
						}
					})
					.collect();
				(!texts.is_empty()).then(|| texts.join("\n"))
			},
			_ => None,
		}
	}

	pub fn set_text(&mut self, text: String) {
		self.content = Some(Value::String(text));
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default)]
	pub model: String,
	#[serde(default)]
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	#[serde(default)]
	pub index: u32,
	pub message: Message,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: u64,
	#[serde(default)]
	pub completion_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

/// One SSE frame of a streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default)]
	pub model: String,
	#[serde(default)]
	pub choices: Vec<StreamChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
	#[serde(default)]
	pub index: u32,
	#[serde(default)]
	pub delta: Delta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(flatten)]
	pub rest: Map<String, Value>,
}

/// The OpenAI error envelope; provider errors are converted into this shape
/// so clients see one dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
	#[serde(rename = "type")]
	pub r#type: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub param: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

impl ErrorResponse {
	pub fn new(r#type: impl Into<String>, message: impl Into<String>) -> ErrorResponse {
		ErrorResponse {
			error: ErrorDetail {
				r#type: r#type.into(),
				message: message.into(),
				param: None,
				code: None,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn passthrough_preserves_unknown_fields() {
		let input = serde_json::json!({
			"model": "gpt-5-nano",
			"messages": [{"role": "user", "content": "hi", "custom_field": {"a": 1}}],
			"tools": [{"type": "function", "function": {"name": "f"}}],
			"reasoning_effort": "high",
		});
		let parsed: Request = serde_json::from_value(input.clone()).unwrap();
		assert_eq!(parsed.model.as_deref(), Some("gpt-5-nano"));
		assert!(parsed.rest.contains_key("tools"));
		assert!(parsed.rest.contains_key("reasoning_effort"));
		let out = serde_json::to_value(&parsed).unwrap();
		assert_eq!(out, input);
	}

	#[test]
	fn multipart_content_text() {
		let m: Message = serde_json::from_value(serde_json::json!({
			"role": "user",
			"content": [
				{"type": "text", "text": "first"},
				{"type": "image_url", "image_url": {"url": "http://x"}},
				{"type": "text", "text": "second"},
			],
		}))
		.unwrap();
		assert_eq!(m.message_text().as_deref(), Some("first\nsecond"));
	}
}
