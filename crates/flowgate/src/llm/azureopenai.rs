use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::llm::{AIError, universal};

const DEFAULT_API_VERSION: &str = "2024-10-21";

/// Azure OpenAI speaks the OpenAI dialect on a per-resource host with the
/// deployment encoded in the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	/// The Azure resource name: `{resource}.openai.azure.com`.
	pub resource: Strng,
	/// Deployment name; also used as the reported model when set.
	#[serde(default)]
	pub model: Option<Strng>,
	#[serde(default)]
	pub api_version: Option<Strng>,
}

impl Provider {
	pub const NAME: Strng = strng::literal!("azure.openai");

	pub fn get_host(&self) -> Strng {
		strng::format!("{}.openai.azure.com", self.resource)
	}

	pub fn get_path_for_model(&self, model: &str) -> String {
		format!(
			"/openai/deployments/{}/chat/completions?api-version={}",
			model,
			self
				.api_version
				.as_deref()
				.unwrap_or(DEFAULT_API_VERSION)
		)
	}

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
