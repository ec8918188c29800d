//! The LLM backend: a protocol-translation layer between the OpenAI dialect
//! on the listener side and each provider's dialect on the backend side.

pub mod anthropic;
pub mod azureopenai;
pub mod bedrock;
pub mod gemini;
pub mod openai;
pub mod policy;
pub mod universal;
pub mod vertex;

use std::sync::Arc;
use std::time::Instant;

use flowgate_core::prelude::*;
use indexmap::IndexMap;
pub use policy::Policy;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

use crate::http::auth::{AwsAuth, BackendAuth};
use crate::http::{Body, Request, Response, header};
use crate::proxy::PolicyClient;
use crate::store::{BackendPolicies, LLMResponsePolicies};
use crate::telemetry::log::{AsyncLog, RequestLog};
use crate::types::agent::Target;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AIBackend {
	pub providers: Vec<Arc<NamedAIProvider>>,
}

impl AIBackend {
	pub fn select_provider(&self) -> Option<Arc<NamedAIProvider>> {
		self
			.providers
			.choose_weighted(&mut rand::rng(), |p| p.weight)
			.ok()
			.cloned()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedAIProvider {
	pub name: Strng,
	#[serde(flatten)]
	pub provider: AIProvider,
	#[serde(default = "default_weight")]
	pub weight: usize,
	#[serde(default)]
	pub host_override: Option<Target>,
	#[serde(default)]
	pub path_override: Option<Strng>,
	/// Tokenize requests locally so rate limits see (part of) the cost
	/// upfront. Costs CPU on the request path.
	#[serde(default)]
	pub tokenize: bool,
	#[serde(default)]
	pub routes: IndexMap<Strng, RouteType>,
}

fn default_weight() -> usize {
	1
}

const DEFAULT_ROUTE: &str = "*";

impl NamedAIProvider {
	pub fn use_default_policies(&self) -> bool {
		self.host_override.is_none()
	}

	pub fn resolve_route(&self, path: &str) -> RouteType {
		for (suffix, rt) in &self.routes {
			if suffix == DEFAULT_ROUTE || path.ends_with(suffix.as_str()) {
				return *rt;
			}
		}
		if path.ends_with("/v1/messages") {
			return RouteType::Messages;
		}
		if path.ends_with("/v1/models") {
			return RouteType::Models;
		}
		if path.ends_with("/v1/embeddings") {
			return RouteType::Embeddings;
		}
		if path.ends_with("/chat/completions") {
			return RouteType::Completions;
		}
		RouteType::Completions
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteType {
	/// OpenAI /v1/chat/completions
	Completions,
	/// Anthropic /v1/messages
	Messages,
	/// OpenAI /v1/models, answered from config
	Models,
	/// OpenAI /v1/embeddings, passthrough with usage accounting
	Embeddings,
	/// Forwarded to the provider as-is
	Passthrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AIProvider {
	#[serde(rename = "openAI")]
	OpenAI(openai::Provider),
	#[serde(rename = "azureOpenAI")]
	AzureOpenAI(azureopenai::Provider),
	Anthropic(anthropic::Provider),
	Gemini(gemini::Provider),
	Vertex(vertex::Provider),
	Bedrock(bedrock::Provider),
}

#[derive(Debug, Clone)]
pub struct LLMRequest {
	/// Locally tokenized input count; only set when tokenization is enabled.
	pub input_tokens: Option<u64>,
	pub request_model: Strng,
	pub provider: Strng,
	pub streaming: bool,
	pub params: LLMRequestParams,
}

#[cfg(test)]
impl LLMRequest {
	pub(crate) fn test_default() -> LLMRequest {
		LLMRequest {
			input_tokens: None,
			request_model: strng::literal!("test"),
			provider: strng::literal!("test"),
			streaming: false,
			params: Default::default(),
		}
	}
}

#[derive(Default, Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LLMRequestParams {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frequency_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub presence_penalty: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
	pub input_tokens: Option<u64>,
	pub output_tokens: Option<u64>,
	pub total_tokens: Option<u64>,
	pub provider_model: Option<Strng>,
	pub completion: Option<Vec<String>>,
	/// Time of the first streamed token.
	pub first_token: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct LLMInfo {
	pub request: LLMRequest,
	pub response: LLMResponse,
}

impl Default for LLMInfo {
	fn default() -> Self {
		LLMInfo {
			request: LLMRequest {
				input_tokens: None,
				request_model: Strng::default(),
				provider: Strng::default(),
				streaming: false,
				params: Default::default(),
			},
			response: Default::default(),
		}
	}
}

impl LLMInfo {
	pub fn input_tokens(&self) -> Option<u64> {
		self.response.input_tokens.or(self.request.input_tokens)
	}
}

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum RequestResult {
	Success(Request, LLMRequest),
	Rejected(Response),
}

#[derive(thiserror::Error, Debug)]
pub enum AIError {
	#[error("missing field: {0}")]
	MissingField(Strng),
	#[error("request was too large")]
	RequestTooLarge,
	#[error("response was too large")]
	ResponseTooLarge,
	#[error("unsupported route for this provider")]
	UnsupportedRoute,
	#[error("prompt guard failed")]
	PromptWebhookError,
	#[error("failed to parse request: {0}")]
	RequestParsing(serde_json::Error),
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("failed to marshal response: {0}")]
	ResponseMarshal(serde_json::Error),
}

impl AIProvider {
	pub fn provider(&self) -> Strng {
		match self {
			AIProvider::OpenAI(_) => openai::Provider::NAME,
			AIProvider::AzureOpenAI(_) => azureopenai::Provider::NAME,
			AIProvider::Anthropic(_) => anthropic::Provider::NAME,
			AIProvider::Gemini(_) => gemini::Provider::NAME,
			AIProvider::Vertex(_) => vertex::Provider::NAME,
			AIProvider::Bedrock(_) => bedrock::Provider::NAME,
		}
	}

	pub fn override_model(&self) -> Option<Strng> {
		match self {
			AIProvider::OpenAI(p) => p.model.clone(),
			AIProvider::AzureOpenAI(p) => p.model.clone(),
			AIProvider::Anthropic(p) => p.model.clone(),
			AIProvider::Gemini(p) => p.model.clone(),
			AIProvider::Vertex(p) => p.model.clone(),
			AIProvider::Bedrock(p) => p.model.clone(),
		}
	}

	/// Where this provider lives when no host override is configured, plus
	/// the policies (TLS, cloud credentials) dialing it requires.
	pub fn default_connector(&self) -> (Target, BackendPolicies) {
		let tls = BackendPolicies {
			backend_tls: Some(crate::http::backendtls::SYSTEM_TRUST.clone()),
			..Default::default()
		};
		match self {
			AIProvider::OpenAI(_) => (Target::Hostname(openai::DEFAULT_HOST, 443), tls),
			AIProvider::Anthropic(_) => (Target::Hostname(anthropic::DEFAULT_HOST, 443), tls),
			AIProvider::Gemini(_) => (Target::Hostname(gemini::DEFAULT_HOST, 443), tls),
			AIProvider::AzureOpenAI(p) => (Target::Hostname(p.get_host(), 443), tls),
			AIProvider::Vertex(p) => (
				Target::Hostname(p.get_host(), 443),
				BackendPolicies {
					backend_tls: Some(crate::http::backendtls::SYSTEM_TRUST.clone()),
					backend_auth: Some(BackendAuth::Gcp {}),
					..Default::default()
				},
			),
			AIProvider::Bedrock(p) => (
				Target::Hostname(p.get_host(), 443),
				BackendPolicies {
					backend_tls: Some(crate::http::backendtls::SYSTEM_TRUST.clone()),
					backend_auth: Some(BackendAuth::Aws(AwsAuth::Implicit {})),
					..Default::default()
				},
			),
		}
	}

	/// Point the outgoing request at the provider: authority, path, and any
	/// header dialect differences.
	pub fn setup_request(
		&self,
		req: &mut Request,
		route_type: RouteType,
		llm_request: Option<&LLMRequest>,
	) -> anyhow::Result<()> {
		// Only translated routes get their path rewritten; embeddings and
		// passthrough keep the caller's path against the provider host.
		let override_path = matches!(route_type, RouteType::Completions | RouteType::Messages);
		let streaming = llm_request.map(|l| l.streaming).unwrap_or_default();
		let model = llm_request
			.map(|l| l.request_model.to_string())
			.unwrap_or_default();
		// Responses stream back as-is; skip content negotiation surprises.
		req
			.headers_mut()
			.insert(header::ACCEPT_ENCODING, crate::http::HeaderValue::from_static("identity"));
		match self {
			AIProvider::OpenAI(_) => crate::http::modify_req(req, |parts| {
				crate::http::modify_uri(parts, |uri| {
					uri.authority = Some(crate::http::Authority::from_static(
						openai::DEFAULT_HOST_STR,
					));
					if override_path && route_type == RouteType::Completions {
						uri.path_and_query =
							Some(crate::http::uri::PathAndQuery::from_static(openai::DEFAULT_PATH));
					}
					Ok(())
				})
			}),
			AIProvider::AzureOpenAI(p) => {
				let path = p.get_path_for_model(&model);
				let host = p.get_host();
				crate::http::modify_req(req, |parts| {
					crate::http::modify_uri(parts, |uri| {
						uri.authority = Some(crate::http::Authority::try_from(host.as_str())?);
						if override_path {
							uri.path_and_query =
								Some(crate::http::uri::PathAndQuery::try_from(path.as_str())?);
						}
						Ok(())
					})?;
					// Azure wants the key in `api-key` when not using Entra.
					if let Some(auth) = parts.headers.remove(header::AUTHORIZATION)
						&& let Ok(token) = auth.to_str()
						&& let Some(key) = token.strip_prefix("Bearer ")
					{
						let mut v = crate::http::HeaderValue::try_from(key)?;
						v.set_sensitive(true);
						parts.headers.insert("api-key", v);
					}
					Ok(())
				})
			},
			AIProvider::Anthropic(_) => crate::http::modify_req(req, |parts| {
				crate::http::modify_uri(parts, |uri| {
					uri.authority = Some(crate::http::Authority::from_static(
						anthropic::DEFAULT_HOST_STR,
					));
					if override_path {
						uri.path_and_query = Some(crate::http::uri::PathAndQuery::from_static(
							anthropic::DEFAULT_PATH,
						));
					}
					Ok(())
				})?;
				if let Some(auth) = parts.headers.remove(header::AUTHORIZATION)
					&& let Ok(token) = auth.to_str()
					&& let Some(key) = token.strip_prefix("Bearer ")
				{
					let mut v = crate::http::HeaderValue::try_from(key)?;
					v.set_sensitive(true);
					parts.headers.insert("x-api-key", v);
				}
				parts.headers.insert(
					"anthropic-version",
					crate::http::HeaderValue::from_static(anthropic::VERSION_HEADER),
				);
				Ok(())
			}),
			AIProvider::Gemini(p) => {
				let path = p.get_path_for_model(&model, streaming);
				crate::http::modify_req(req, |parts| {
					crate::http::modify_uri(parts, |uri| {
						uri.authority = Some(crate::http::Authority::from_static(
							gemini::DEFAULT_HOST_STR,
						));
						if override_path {
							uri.path_and_query =
								Some(crate::http::uri::PathAndQuery::try_from(path.as_str())?);
						}
						Ok(())
					})?;
					// API keys travel in x-goog-api-key, not Authorization.
					if let Some(auth) = parts.headers.remove(header::AUTHORIZATION)
						&& let Ok(token) = auth.to_str()
						&& let Some(key) = token.strip_prefix("Bearer ")
					{
						let mut v = crate::http::HeaderValue::try_from(key)?;
						v.set_sensitive(true);
						parts.headers.insert("x-goog-api-key", v);
					}
					Ok(())
				})
			},
			AIProvider::Vertex(p) => {
				let path = p.get_path_for_model(&model, streaming);
				let host = p.get_host();
				crate::http::modify_req(req, |parts| {
					crate::http::modify_uri(parts, |uri| {
						uri.authority = Some(crate::http::Authority::try_from(host.as_str())?);
						if override_path {
							uri.path_and_query =
								Some(crate::http::uri::PathAndQuery::try_from(path.as_str())?);
						}
						Ok(())
					})
				})
			},
			AIProvider::Bedrock(p) => {
				let path = p.get_path_for_model(streaming, &model);
				let host = p.get_host();
				let region = p.region.to_string();
				crate::http::modify_req(req, |parts| {
					crate::http::modify_uri(parts, |uri| {
						uri.authority = Some(crate::http::Authority::try_from(host.as_str())?);
						if override_path {
							uri.path_and_query =
								Some(crate::http::uri::PathAndQuery::try_from(path.as_str())?);
						}
						Ok(())
					})?;
					parts
						.extensions
						.insert(crate::http::auth::AwsRegion { region });
					Ok(())
				})
			},
		}
	}

	/// Parse, police, and translate an incoming chat completion request.
	pub async fn process_completions_request(
		&self,
		client: &PolicyClient,
		policies: Option<&Policy>,
		req: Request,
		tokenize: bool,
		log: &mut Option<&mut RequestLog>,
	) -> Result<RequestResult, AIError> {
		let buffer_limit = crate::http::buffer_limit(&req);
		let (mut parts, body) = req.into_parts();
		let Ok(bytes) = crate::http::read_body_with_limit(body, buffer_limit).await else {
			return Err(AIError::RequestTooLarge);
		};
		let mut request: universal::Request =
			serde_json::from_slice(&bytes).map_err(AIError::RequestParsing)?;

		// Without usage in the stream we cannot account tokens; always ask.
		if request.stream.unwrap_or_default() && request.stream_options.is_none() {
			request.stream_options = Some(universal::StreamOptions {
				include_usage: true,
			});
		}
		if let Some(forced) = self.override_model() {
			request.model = Some(forced.to_string());
		}
		if let Some(p) = policies {
			if let Some(model) = &request.model
				&& let Some(aliased) = p.resolve_alias(model)
			{
				request.model = Some(aliased.to_string());
			}
			p.apply_prompt_enrichment(&mut request);
			p.apply_parameters(&mut request);
			if let Some(rejection) = p
				.apply_prompt_guard(client, &mut request)
				.await
				.map_err(|e| {
					tracing::warn!("prompt guard failed: {e}");
					AIError::PromptWebhookError
				})? {
				return Ok(RequestResult::Rejected(rejection));
			}
		}
		if request.model.is_none() {
			return Err(AIError::MissingField(strng::literal!("model")));
		}

		let llm_request = self.build_llm_request(&request, tokenize)?;
		if let Some(log) = log {
			let needs_prompt = log.cel.cel_context.with_llm_request(&llm_request);
			if needs_prompt {
				let prompt = request
					.messages
					.iter()
					.map(SimpleChatCompletionMessage::from)
					.collect();
				log.cel.cel_context.with_llm_prompt(prompt);
			}
		}

		let caching = policies.and_then(|p| p.prompt_caching.as_ref());
		let new_body = match self {
			AIProvider::OpenAI(p) => p.translate_request(&request)?,
			AIProvider::AzureOpenAI(p) => p.translate_request(&request)?,
			AIProvider::Anthropic(p) => p.translate_request(&request, caching)?,
			AIProvider::Gemini(_) | AIProvider::Vertex(_) => gemini::translate_request(&request)?,
			AIProvider::Bedrock(p) => p.translate_request(&request)?,
		};
		parts.headers.remove(header::CONTENT_LENGTH);
		let req = Request::from_parts(parts, Body::from(new_body));
		Ok(RequestResult::Success(req, llm_request))
	}

	/// Anthropic-dialect input. Only the Anthropic provider accepts it; the
	/// body passes through with aliasing and accounting applied.
	pub async fn process_messages_request(
		&self,
		policies: Option<&Policy>,
		req: Request,
		tokenize: bool,
		log: &mut Option<&mut RequestLog>,
	) -> Result<RequestResult, AIError> {
		if !matches!(self, AIProvider::Anthropic(_)) {
			return Err(AIError::UnsupportedRoute);
		}
		let buffer_limit = crate::http::buffer_limit(&req);
		let (mut parts, body) = req.into_parts();
		let Ok(bytes) = crate::http::read_body_with_limit(body, buffer_limit).await else {
			return Err(AIError::RequestTooLarge);
		};
		let mut request: anthropic::MessagesRequest =
			serde_json::from_slice(&bytes).map_err(AIError::RequestParsing)?;
		if let Some(forced) = self.override_model() {
			request.model = forced.to_string();
		} else if let Some(p) = policies
			&& let Some(aliased) = p.resolve_alias(&request.model)
		{
			request.model = aliased.to_string();
		}
		let input_tokens = tokenize
			.then(|| {
				let texts: Vec<String> = request
					.messages
					.iter()
					.filter_map(|m| m.content.as_str().map(|s| s.to_string()))
					.collect();
				approximate_tokens(&request.model, &texts)
			})
			.flatten();
		let llm_request = LLMRequest {
			input_tokens,
			request_model: strng::new(&request.model),
			provider: self.provider(),
			streaming: request.stream.unwrap_or_default(),
			params: LLMRequestParams {
				temperature: request.temperature,
				top_p: request.top_p,
				max_tokens: Some(request.max_tokens),
				..Default::default()
			},
		};
		if let Some(log) = log {
			log.cel.cel_context.with_llm_request(&llm_request);
		}
		let body = serde_json::to_vec(&request).map_err(AIError::RequestMarshal)?;
		parts.headers.remove(header::CONTENT_LENGTH);
		Ok(RequestResult::Success(
			Request::from_parts(parts, Body::from(body)),
			llm_request,
		))
	}

	fn build_llm_request(
		&self,
		req: &universal::Request,
		tokenize: bool,
	) -> Result<LLMRequest, AIError> {
		let model = req.model.clone().unwrap_or_default();
		let input_tokens = if tokenize {
			let texts: Vec<String> = req.messages.iter().filter_map(|m| m.message_text()).collect();
			approximate_tokens(&model, &texts)
		} else {
			None
		};
		Ok(LLMRequest {
			input_tokens,
			request_model: strng::new(&model),
			provider: self.provider(),
			streaming: req.stream.unwrap_or_default(),
			params: LLMRequestParams {
				temperature: req.temperature,
				top_p: req.top_p,
				frequency_penalty: req.frequency_penalty,
				presence_penalty: req.presence_penalty,
				seed: req.seed,
				max_tokens: req.max_tokens.or(req.max_completion_tokens),
			},
		})
	}

	/// Translate the provider response back to the canonical dialect,
	/// applying the response guard and recording token usage.
	pub async fn process_response(
		&self,
		client: &PolicyClient,
		req: LLMRequest,
		rate_limit: LLMResponsePolicies,
		log: AsyncLog<LLMInfo>,
		include_completion: bool,
		resp: Response,
	) -> Result<Response, AIError> {
		if req.streaming {
			return Ok(self.process_streaming(req, rate_limit, log, include_completion, resp));
		}
		let buffer_limit = crate::http::response_buffer_limit(&resp);
		let (mut parts, body) = resp.into_parts();
		let Ok(bytes) = crate::http::read_body_with_limit(body, buffer_limit).await else {
			return Err(AIError::ResponseTooLarge);
		};

		if !parts.status.is_success() {
			// Provider errors pass through with the body translated to the
			// canonical error envelope.
			let err = match self {
				AIProvider::OpenAI(p) => p.process_error(&bytes),
				AIProvider::AzureOpenAI(p) => p.process_error(&bytes),
				AIProvider::Anthropic(p) => p.process_error(&bytes),
				AIProvider::Gemini(_) | AIProvider::Vertex(_) => gemini::process_error(&bytes),
				AIProvider::Bedrock(p) => p.process_error(&bytes),
			};
			let body = serde_json::to_vec(&err).map_err(AIError::ResponseMarshal)?;
			parts.headers.remove(header::CONTENT_LENGTH);
			let info = LLMInfo {
				request: req,
				response: LLMResponse::default(),
			};
			log.store(Some(info));
			return Ok(Response::from_parts(parts, Body::from(body)));
		}

		let mut translated = match self {
			AIProvider::OpenAI(p) => p.translate_response(&bytes)?,
			AIProvider::AzureOpenAI(p) => p.translate_response(&bytes)?,
			AIProvider::Anthropic(p) => p.translate_response(&bytes)?,
			AIProvider::Gemini(_) => gemini::translate_response(&bytes, req.request_model.as_str())?,
			AIProvider::Vertex(p) => {
				p.translate_response(&bytes, req.request_model.as_str())?
			},
			AIProvider::Bedrock(p) => {
				p.translate_response(&bytes, req.request_model.as_str())?
			},
		};

		// Response-side guard needs the full completion; we already have it.
		if let Some(guard) = &rate_limit.prompt_guard
			&& guard.is_configured()
		{
			for choice in translated.choices.iter_mut() {
				let mut text = choice.message.message_text().unwrap_or_default();
				if let Some(rejection) =
					Policy::apply_response_guard(client, guard, &mut text)
						.await
						.map_err(|e| {
							tracing::warn!("response guard failed: {e}");
							AIError::PromptWebhookError
						})? {
					return Ok(rejection);
				}
				choice.message.set_text(text);
			}
		}

		let llm_response = LLMResponse {
			input_tokens: translated.usage.as_ref().map(|u| u.prompt_tokens),
			output_tokens: translated.usage.as_ref().map(|u| u.completion_tokens),
			total_tokens: translated.usage.as_ref().map(|u| u.total_tokens),
			provider_model: Some(strng::new(&translated.model)),
			completion: include_completion.then(|| {
				translated
					.choices
					.iter()
					.filter_map(|c| c.message.message_text())
					.collect()
			}),
			first_token: None,
		};
		let body = serde_json::to_vec(&translated).map_err(AIError::ResponseMarshal)?;
		parts.headers.remove(header::CONTENT_LENGTH);
		let resp = Response::from_parts(parts, Body::from(body));

		let info = LLMInfo {
			request: req,
			response: llm_response,
		};
		amend_tokens(rate_limit, &info);
		log.store(Some(info));
		Ok(resp)
	}

	fn process_streaming(
		&self,
		req: LLMRequest,
		rate_limit: LLMResponsePolicies,
		log: AsyncLog<LLMInfo>,
		include_completion: bool,
		resp: Response,
	) -> Response {
		let model = req.request_model.clone();
		// Seed the slot; the stream fills it in as frames arrive.
		log.store(Some(LLMInfo {
			request: req,
			response: LLMResponse::default(),
		}));
		match self {
			AIProvider::Anthropic(p) => p.process_streaming(log, resp, include_completion),
			AIProvider::Gemini(_) | AIProvider::Vertex(_) => {
				gemini::process_streaming(log, resp, model.to_string(), include_completion)
			},
			AIProvider::Bedrock(p) => p.process_streaming(log, resp, model.as_str()),
			AIProvider::OpenAI(_) | AIProvider::AzureOpenAI(_) => {
				self.default_process_streaming(log, include_completion, rate_limit, resp)
			},
		}
	}

	/// OpenAI-dialect streams pass through unchanged; we only observe.
	fn default_process_streaming(
		&self,
		log: AsyncLog<LLMInfo>,
		include_completion: bool,
		rate_limit: LLMResponsePolicies,
		resp: Response,
	) -> Response {
		let buffer_limit = crate::http::response_buffer_limit(&resp);
		resp.map(move |body| {
			let mut completion = include_completion.then(String::new);
			let mut saw_provider = false;
			let mut saw_token = false;
			let mut rate_limit = Some(rate_limit);
			crate::parse::sse::json_passthrough::<universal::StreamResponse>(
				body,
				buffer_limit,
				move |frame| match frame {
					Some(Ok(frame)) => {
						if let Some(delta) =
							frame.choices.first().and_then(|c| c.delta.content.as_deref())
						{
							if let Some(c) = completion.as_mut() {
								c.push_str(delta);
							}
							if !saw_token {
								saw_token = true;
								log.non_atomic_mutate(|info| {
									info.response.first_token = Some(Instant::now());
								});
							}
						}
						if !saw_provider && !frame.model.is_empty() {
							saw_provider = true;
							log.non_atomic_mutate(|info| {
								info.response.provider_model = Some(strng::new(&frame.model));
							});
						}
						if let Some(usage) = frame.usage {
							log.non_atomic_mutate(|info| {
								info.response.input_tokens = Some(usage.prompt_tokens);
								info.response.output_tokens = Some(usage.completion_tokens);
								info.response.total_tokens = Some(usage.total_tokens);
								if let Some(c) = completion.take() {
									info.response.completion = Some(vec![c]);
								}
							});
							let taken = log.take();
							if let (Some(info), Some(rl)) = (taken.as_ref(), rate_limit.take()) {
								amend_tokens(rl, info);
							}
							log.store(taken);
						}
					},
					Some(Err(e)) => {
						tracing::debug!("failed to parse streaming response: {e}");
					},
					None => {
						log.non_atomic_mutate(|info| {
							if let Some(c) = completion.take() {
								info.response.completion = Some(vec![c]);
							}
						});
					},
				},
			)
		})
	}
}

/// Reconcile rate limit accounting once real usage is known: remove the
/// difference between what the response reports and what the request side
/// already charged.
fn amend_tokens(rate_limit: LLMResponsePolicies, info: &LLMInfo) {
	let input_mismatch = match (info.request.input_tokens, info.response.input_tokens) {
		(Some(charged), Some(actual)) => actual as i64 - charged as i64,
		(_, None) => 0,
		(None, Some(actual)) => actual as i64,
	};
	let output = info.response.output_tokens.unwrap_or_default() as i64;
	let delta = input_mismatch + output;
	for lrl in &rate_limit.local_rate_limit {
		lrl.amend_tokens(delta);
	}
	if let Some(rrl) = rate_limit.remote_rate_limit {
		rrl.amend_tokens(delta);
	}
}

/// Serve `/v1/models` from configuration.
pub fn models_response(providers: &[Arc<NamedAIProvider>]) -> Response {
	let data: Vec<serde_json::Value> = providers
		.iter()
		.filter_map(|p| p.provider.override_model())
		.map(|m| {
			serde_json::json!({
				"id": m.as_str(),
				"object": "model",
				"owned_by": "organization",
			})
		})
		.collect();
	let body = serde_json::json!({ "object": "list", "data": data });
	::http::Response::builder()
		.status(crate::http::StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response must build")
}

fn approximate_tokens(model: &str, texts: &[String]) -> Option<u64> {
	let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
	let bpe = match tokenizer {
		Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
		_ => tiktoken_rs::cl100k_base_singleton(),
	};
	// Per-message framing overhead plus the content itself.
	let mut tokens: u64 = 3;
	for t in texts {
		tokens += 4;
		tokens += bpe.encode_with_special_tokens(t).len() as u64;
	}
	Some(tokens)
}

/// Tokenizers lazily build large merge tables; warm them off the request
/// path.
pub fn preload_tokenizers() {
	let _ = tiktoken_rs::cl100k_base_singleton();
	let _ = tiktoken_rs::o200k_base_singleton();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleChatCompletionMessage {
	pub role: Strng,
	pub content: Strng,
}

impl From<&universal::Message> for SimpleChatCompletionMessage {
	fn from(m: &universal::Message) -> Self {
		SimpleChatCompletionMessage {
			role: strng::new(&m.role),
			content: strng::new(m.message_text().unwrap_or_default()),
		}
	}
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
