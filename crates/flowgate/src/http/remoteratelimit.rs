use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::cel::{Executor, Expression};
use crate::http::{PolicyResponse, Request, StatusCode, header};
use crate::proxy::{PolicyClient, ProxyError, ProxyResponse};
use crate::types::agent::SimpleBackendReference;

/// Rate limiting delegated to an external rate limit service speaking the
/// Envoy RLS JSON interface. Transport failures fail open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteRateLimit {
	pub domain: String,
	pub target: SimpleBackendReference,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Descriptor {
	pub entries: Vec<DescriptorEntry>,
	#[serde(default, rename = "type")]
	pub limit_type: super::localratelimit::RateLimitType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescriptorEntry {
	pub key: String,
	pub value: Arc<Expression>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RlsResponse {
	overall_code: Option<String>,
}

impl RemoteRateLimit {
	pub fn iter_expressions(&self) -> impl Iterator<Item = &Expression> {
		self
			.descriptors
			.iter()
			.flat_map(|d| d.entries.iter())
			.map(|e| e.value.as_ref())
	}

	pub async fn check(
		&self,
		client: PolicyClient,
		_req: &Request,
		exec: &Executor<'_>,
	) -> Result<PolicyResponse, ProxyResponse> {
		self.check_internal(client, exec, 1).await.map(|r| r.0)
	}

	/// LLM variant: charges the estimated input tokens now and returns a
	/// handle used to report the actual usage once the response is complete.
	pub async fn check_llm(
		&self,
		client: PolicyClient,
		_req: &Request,
		exec: &Executor<'_>,
		input_tokens: u64,
	) -> Result<(PolicyResponse, Option<AmendHandle>), ProxyResponse> {
		self.check_internal(client, exec, input_tokens).await
	}

	async fn check_internal(
		&self,
		client: PolicyClient,
		exec: &Executor<'_>,
		hits: u64,
	) -> Result<(PolicyResponse, Option<AmendHandle>), ProxyResponse> {
		let descriptors = self.render_descriptors(exec);
		match self.call(&client, &descriptors, hits).await {
			Ok(true) => Ok((
				PolicyResponse::default(),
				Some(AmendHandle {
					policy: self.clone(),
					client,
					descriptors,
				}),
			)),
			Ok(false) => Err(ProxyResponse::Error(ProxyError::RateLimitExceeded)),
			Err(e) => {
				// Fail open: the rate limit service being down must not take
				// the data path down with it.
				warn!("rate limit service unavailable, allowing request: {e}");
				Ok((PolicyResponse::default(), None))
			},
		}
	}

	fn render_descriptors(&self, exec: &Executor<'_>) -> Vec<Vec<(String, String)>> {
		self
			.descriptors
			.iter()
			.map(|d| {
				d.entries
					.iter()
					.map(|e| {
						let value = exec
							.eval(&e.value)
							.ok()
							.and_then(|v| crate::cel::value_as_string(&v))
							.unwrap_or_default();
						(e.key.clone(), value)
					})
					.collect()
			})
			.collect()
	}

	async fn call(
		&self,
		client: &PolicyClient,
		descriptors: &[Vec<(String, String)>],
		hits: u64,
	) -> anyhow::Result<bool> {
		let body = json!({
			"domain": self.domain,
			"descriptors": descriptors.iter().map(|d| json!({
				"entries": d.iter().map(|(k, v)| json!({"key": k, "value": v})).collect::<Vec<_>>(),
			})).collect::<Vec<_>>(),
			"hitsAddend": hits,
		});
		let path = self.path.as_deref().unwrap_or("/json");
		let req = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri(path)
			.header(header::CONTENT_TYPE, "application/json")
			.body(crate::http::Body::from(serde_json::to_vec(&body)?))?;
		let resp = client.call_reference(req, &self.target).await?;
		let status = resp.status();
		if status == StatusCode::TOO_MANY_REQUESTS {
			return Ok(false);
		}
		if !status.is_success() {
			anyhow::bail!("rate limit service returned {status}");
		}
		let bytes = crate::http::read_body_with_limit(resp.into_body(), 65_536)
			.await
			.map_err(|e| anyhow::anyhow!("{e}"))?;
		let parsed: RlsResponse = serde_json::from_slice(&bytes)?;
		Ok(!matches!(parsed.overall_code.as_deref(), Some("OVER_LIMIT")))
	}
}

/// Reports the final token usage of an LLM request to the rate limit service.
#[derive(Debug)]
pub struct AmendHandle {
	policy: RemoteRateLimit,
	client: PolicyClient,
	descriptors: Vec<Vec<(String, String)>>,
}

impl AmendHandle {
	pub fn amend_tokens(self, delta: i64) {
		if delta <= 0 {
			return;
		}
		tokio::task::spawn(async move {
			if let Err(e) = self
				.policy
				.call(&self.client, &self.descriptors, delta as u64)
				.await
			{
				debug!("failed to report token usage to rate limit service: {e}");
			}
		});
	}
}
