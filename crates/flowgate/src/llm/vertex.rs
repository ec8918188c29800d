use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::llm::{AIError, universal};

/// Vertex AI serves the Gemini dialect on regional hosts with
/// project-scoped paths and GCP credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Provider {
	pub project: Strng,
	#[serde(default = "default_region")]
	pub region: Strng,
	#[serde(default)]
	pub model: Option<Strng>,
}

fn default_region() -> Strng {
	strng::literal!("us-central1")
}

impl Provider {
	pub const NAME: Strng = strng::literal!("vertex");

	pub fn get_host(&self) -> Strng {
		if self.region == "global" {
			strng::literal!("aiplatform.googleapis.com")
		} else {
			strng::format!("{}-aiplatform.googleapis.com", self.region)
		}
	}

	pub fn get_path_for_model(&self, model: &str, streaming: bool) -> String {
		let verb = if streaming {
			"streamGenerateContent?alt=sse"
		} else {
			"generateContent"
		};
		format!(
			"/v1/projects/{}/locations/{}/publishers/google/models/{model}:{verb}",
			self.project, self.region,
		)
	}

	pub fn translate_request(&self, req: &universal::Request) -> Result<Vec<u8>, AIError> {
		super::gemini::translate_request(req)
	}

	pub fn translate_response(
		&self,
		bytes: &[u8],
		request_model: &str,
	) -> Result<universal::Response, AIError> {
		super::gemini::translate_response(bytes, request_model)
	}

	pub fn process_error(&self, bytes: &[u8]) -> universal::ErrorResponse {
		super::gemini::process_error(bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn paths_and_hosts() {
		let p = Provider {
			project: "my-proj".into(),
			region: "europe-west4".into(),
			model: None,
		};
		assert_eq!(p.get_host(), "europe-west4-aiplatform.googleapis.com");
		assert_eq!(
			p.get_path_for_model("gemini-2.5-pro", false),
			"/v1/projects/my-proj/locations/europe-west4/publishers/google/models/gemini-2.5-pro:generateContent"
		);
	}
}
