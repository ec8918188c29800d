use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::llm::{AIError, universal};

pub const DEFAULT_HOST_STR: &str = "api.openai.com";
pub const DEFAULT_HOST: Strng = strng::literal!("api.openai.com");
pub const DEFAULT_PATH: &str = "/v1/chat/completions";

/// OpenAI is the canonical dialect: requests and responses pass through
/// byte-for-byte (modulo policy mutations).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	#[serde(default)]
	pub model: Option<Strng>,
}

impl Provider {
	pub const NAME: Strng = strng::literal!("openai");

	pub fn translate_request(&self, req: &universal::Request) -> Result<Vec<u8>, AIError> {
		serde_json::to_vec(req).map_err(AIError::RequestMarshal)
	}

	pub fn translate_response(&self, bytes: &[u8]) -> Result<universal::Response, AIError> {
		serde_json::from_slice(bytes).map_err(AIError::ResponseParsing)
	}

	pub fn process_error(&self, bytes: &[u8]) -> universal::ErrorResponse {
		serde_json::from_slice(bytes).unwrap_or_else(|_| {
			universal::ErrorResponse::new(
				"api_error",
				String::from_utf8_lossy(bytes).to_string(),
			)
		})
	}
}
