//! AI traffic policy: model aliasing, prompt enrichment, parameter defaults
//! and overrides, request/response prompt guarding, and prompt caching.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::http::{Response, StatusCode};
use crate::llm::universal;
use crate::proxy::PolicyClient;
use crate::types::agent::SimpleBackendReference;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
	#[serde(default)]
	pub model_aliases: HashMap<String, String>,
	#[serde(default)]
	pub prompts: Option<PromptEnrichment>,
	/// Parameters merged in when the request omits them.
	#[serde(default)]
	pub defaults: HashMap<String, Value>,
	/// Parameters forced regardless of the request.
	#[serde(default)]
	pub overrides: HashMap<String, Value>,
	#[serde(default)]
	pub prompt_guard: Option<PromptGuard>,
	#[serde(default)]
	pub prompt_caching: Option<PromptCaching>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptEnrichment {
	#[serde(default)]
	pub prepend: Vec<EnrichmentMessage>,
	#[serde(default)]
	pub append: Vec<EnrichmentMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnrichmentMessage {
	pub role: String,
	pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptGuard {
	#[serde(default)]
	pub request: Option<RequestGuard>,
	#[serde(default)]
	pub response: Option<ResponseGuard>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestGuard {
	#[serde(default)]
	pub regex: Option<RegexGuard>,
	#[serde(default)]
	pub webhook: Option<Webhook>,
	#[serde(default)]
	pub moderation: Option<Moderation>,
	#[serde(default)]
	pub rejection: Rejection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResponseGuard {
	#[serde(default)]
	pub regex: Option<RegexGuard>,
	#[serde(default)]
	pub webhook: Option<Webhook>,
	#[serde(default)]
	pub rejection: Rejection,
}

impl ResponseGuard {
	pub fn is_configured(&self) -> bool {
		self.regex.is_some() || self.webhook.is_some()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegexGuard {
	pub rules: Vec<RegexRule>,
	#[serde(default)]
	pub action: GuardAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegexRule {
	#[serde(with = "serde_regex")]
	pub pattern: regex::Regex,
	#[serde(default)]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardAction {
	/// Return the rejection response.
	#[default]
	Reject,
	/// Replace matched spans and continue.
	Mask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Webhook {
	pub target: SimpleBackendReference,
	#[serde(default)]
	pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Moderation {
	#[serde(default)]
	pub model: Option<String>,
	#[serde(serialize_with = "crate::serdes::ser_redacted")]
	pub auth: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rejection {
	#[serde(default = "default_rejection_status")]
	pub status: u16,
	#[serde(default = "default_rejection_body")]
	pub body: String,
}

fn default_rejection_status() -> u16 {
	403
}

fn default_rejection_body() -> String {
	"The request was rejected because it did not conform to the configured policies".to_string()
}

impl Default for Rejection {
	fn default() -> Self {
		Rejection {
			status: default_rejection_status(),
			body: default_rejection_body(),
		}
	}
}

impl Rejection {
	pub fn into_response(&self) -> Response {
		::http::Response::builder()
			.status(StatusCode::from_u16(self.status).unwrap_or(StatusCode::FORBIDDEN))
			.header(::http::header::CONTENT_TYPE, "text/plain")
			.body(crate::http::Body::from(self.body.clone()))
			.expect("static response must build")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptCaching {
	/// Blocks with at least this many (approximate) tokens get cache markers.
	pub min_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WebhookVerdict {
	action: String,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
	results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
	flagged: bool,
}

impl Policy {
	pub fn resolve_alias(&self, model: &str) -> Option<&str> {
		self.model_aliases.get(model).map(|s| s.as_str())
	}

	pub fn apply_prompt_enrichment(&self, req: &mut universal::Request) {
		let Some(p) = &self.prompts else { return };
		let prepend = p
			.prepend
			.iter()
			.map(|m| universal::Message::text(&m.role, m.content.clone()));
		let append = p
			.append
			.iter()
			.map(|m| universal::Message::text(&m.role, m.content.clone()));
		let existing = std::mem::take(&mut req.messages);
		req.messages = prepend.chain(existing).chain(append).collect();
	}

	/// Defaults fill gaps; overrides always win. Typed fields are updated in
	/// place, anything else lands in the passthrough map.
	pub fn apply_parameters(&self, req: &mut universal::Request) {
		for (k, v) in &self.defaults {
			apply_param(req, k, v, false);
		}
		for (k, v) in &self.overrides {
			apply_param(req, k, v, true);
		}
	}

	/// Request-side guard. A deny produces the configured rejection response
	/// and the upstream is never called.
	pub async fn apply_prompt_guard(
		&self,
		client: &PolicyClient,
		req: &mut universal::Request,
	) -> anyhow::Result<Option<Response>> {
		let Some(guard) = self.prompt_guard.as_ref().and_then(|g| g.request.as_ref()) else {
			return Ok(None);
		};
		if let Some(rg) = &guard.regex {
			match rg.action {
				GuardAction::Reject => {
					let hit = req.messages.iter().any(|m| {
						m.message_text()
							.map(|t| rg.rules.iter().any(|r| r.pattern.is_match(&t)))
							.unwrap_or(false)
					});
					if hit {
						return Ok(Some(guard.rejection.into_response()));
					}
				},
				GuardAction::Mask => {
					for m in req.messages.iter_mut() {
						if let Some(text) = m.message_text() {
							let mut masked = text;
							for rule in &rg.rules {
								masked = rule.pattern.replace_all(&masked, "<redacted>").to_string();
							}
							m.set_text(masked);
						}
					}
				},
			}
		}
		if let Some(webhook) = &guard.webhook {
			let allowed = call_webhook(client, webhook, &req.messages).await?;
			if !allowed {
				return Ok(Some(guard.rejection.into_response()));
			}
		}
		if let Some(moderation) = &guard.moderation {
			let flagged = call_moderation(client, moderation, &req.messages).await?;
			if flagged {
				return Ok(Some(guard.rejection.into_response()));
			}
		}
		Ok(None)
	}

	/// Response-side guard over the buffered completion text. Returns a
	/// replacement response on deny.
	pub async fn apply_response_guard(
		client: &PolicyClient,
		guard: &ResponseGuard,
		completion: &mut String,
	) -> anyhow::Result<Option<Response>> {
		if let Some(rg) = &guard.regex {
			match rg.action {
				GuardAction::Reject => {
					if rg.rules.iter().any(|r| r.pattern.is_match(completion)) {
						return Ok(Some(guard.rejection.into_response()));
					}
				},
				GuardAction::Mask => {
					for rule in &rg.rules {
						*completion = rule.pattern.replace_all(completion, "<redacted>").to_string();
					}
				},
			}
		}
		if let Some(webhook) = &guard.webhook {
			let messages = vec![universal::Message::text("assistant", completion.clone())];
			let allowed = call_webhook(client, webhook, &messages).await?;
			if !allowed {
				return Ok(Some(guard.rejection.into_response()));
			}
		}
		Ok(None)
	}
}

fn apply_param(req: &mut universal::Request, key: &str, value: &Value, force: bool) {
	macro_rules! set_typed {
		($field:ident, $extract:expr) => {{
			if force || req.$field.is_none() {
				if let Some(v) = $extract {
					req.$field = Some(v);
				}
			}
			return;
		}};
	}
	match key {
		"temperature" => set_typed!(temperature, value.as_f64()),
		"topP" | "top_p" => set_typed!(top_p, value.as_f64()),
		"frequencyPenalty" | "frequency_penalty" => {
			set_typed!(frequency_penalty, value.as_f64())
		},
		"presencePenalty" | "presence_penalty" => set_typed!(presence_penalty, value.as_f64()),
		"seed" => set_typed!(seed, value.as_i64()),
		"maxTokens" | "max_tokens" => set_typed!(max_tokens, value.as_u64()),
		_ => {
			if force || !req.rest.contains_key(key) {
				req.rest.insert(key.to_string(), value.clone());
			}
		},
	}
}

async fn call_webhook(
	client: &PolicyClient,
	webhook: &Webhook,
	messages: &[universal::Message],
) -> anyhow::Result<bool> {
	let body = serde_json::json!({
		"messages": messages
			.iter()
			.map(|m| serde_json::json!({
				"role": m.role,
				"content": m.message_text().unwrap_or_default(),
			}))
			.collect::<Vec<_>>(),
	});
	let req = ::http::Request::builder()
		.method(::http::Method::POST)
		.uri(webhook.path.as_deref().unwrap_or("/request"))
		.header(::http::header::CONTENT_TYPE, "application/json")
		.body(crate::http::Body::from(serde_json::to_vec(&body)?))?;
	let resp = client.call_reference(req, &webhook.target).await?;
	if !resp.status().is_success() {
		anyhow::bail!("guard webhook returned {}", resp.status());
	}
	let bytes = crate::http::read_body_with_limit(resp.into_body(), 1_048_576)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))?;
	let verdict: WebhookVerdict = serde_json::from_slice(&bytes)?;
	Ok(verdict.action != "deny")
}

async fn call_moderation(
	client: &PolicyClient,
	moderation: &Moderation,
	messages: &[universal::Message],
) -> anyhow::Result<bool> {
	let input: Vec<String> = messages.iter().filter_map(|m| m.message_text()).collect();
	if input.is_empty() {
		return Ok(false);
	}
	let mut body = serde_json::json!({ "input": input });
	if let Some(model) = &moderation.model {
		body["model"] = Value::String(model.clone());
	}
	let req = ::http::Request::builder()
		.method(::http::Method::POST)
		.uri("https://api.openai.com/v1/moderations")
		.header(::http::header::CONTENT_TYPE, "application/json")
		.header(
			::http::header::AUTHORIZATION,
			format!("Bearer {}", moderation.auth.expose_secret()),
		)
		.body(crate::http::Body::from(serde_json::to_vec(&body)?))?;
	let resp = client.simple_call(req).await?;
	if !resp.status().is_success() {
		warn!("moderation endpoint returned {}", resp.status());
		anyhow::bail!("moderation endpoint returned {}", resp.status());
	}
	let bytes = crate::http::read_body_with_limit(resp.into_body(), 1_048_576)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))?;
	let parsed: ModerationResponse = serde_json::from_slice(&bytes)?;
	Ok(parsed.results.iter().any(|r| r.flagged))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request_with(content: &str) -> universal::Request {
		serde_json::from_value(serde_json::json!({
			"model": "m",
			"messages": [{"role": "user", "content": content}],
		}))
		.unwrap()
	}

	#[test]
	fn enrichment_order() {
		let p = Policy {
			prompts: Some(PromptEnrichment {
				prepend: vec![EnrichmentMessage {
					role: "system".to_string(),
					content: "be brief".to_string(),
				}],
				append: vec![EnrichmentMessage {
					role: "user".to_string(),
					content: "thanks".to_string(),
				}],
			}),
			..Default::default()
		};
		let mut req = request_with("hi");
		p.apply_prompt_enrichment(&mut req);
		let roles: Vec<&str> = req.messages.iter().map(|m| m.role.as_str()).collect();
		assert_eq!(roles, vec!["system", "user", "user"]);
		assert_eq!(
			req.messages[0].message_text().as_deref(),
			Some("be brief")
		);
	}

	#[test]
	fn defaults_do_not_override() {
		let p = Policy {
			defaults: HashMap::from([("temperature".to_string(), Value::from(0.5))]),
			overrides: HashMap::from([("seed".to_string(), Value::from(42))]),
			..Default::default()
		};
		let mut req = request_with("hi");
		req.temperature = Some(0.9);
		p.apply_parameters(&mut req);
		assert_eq!(req.temperature, Some(0.9));
		assert_eq!(req.seed, Some(42));
	}

	#[test]
	fn regex_guard_rejects() {
		let guard = RequestGuard {
			regex: Some(RegexGuard {
				rules: vec![RegexRule {
					pattern: regex::Regex::new("SSN").unwrap(),
					name: None,
				}],
				action: GuardAction::Reject,
			}),
			webhook: None,
			moderation: None,
			rejection: Rejection {
				status: 400,
				body: "blocked".to_string(),
			},
		};
		let req = request_with("my SSN is 123-45-6789");
		let hit = req.messages.iter().any(|m| {
			m.message_text()
				.map(|t| {
					guard
						.regex
						.as_ref()
						.unwrap()
						.rules
						.iter()
						.any(|r| r.pattern.is_match(&t))
				})
				.unwrap_or(false)
		});
		assert!(hit);
		let resp = guard.rejection.into_response();
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn regex_guard_masks() {
		let rule = RegexRule {
			pattern: regex::Regex::new(r"\d{3}-\d{2}-\d{4}").unwrap(),
			name: None,
		};
		let mut text = "my SSN is 123-45-6789".to_string();
		text = rule.pattern.replace_all(&text, "<redacted>").to_string();
		assert_eq!(text, "my SSN is <redacted>");
	}
}
