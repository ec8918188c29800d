//! CEL expression support for logging, metrics, authorization, and
//! transformations.
//!
//! Expressions are compiled once when a snapshot is installed. Compilation
//! records which context attributes the expression touches so the request
//! path only materializes (and, for bodies, buffers) what is actually
//! needed. Evaluating an attribute that is absent at the current pipeline
//! stage yields `null` (false in boolean position), never an error.

use std::collections::HashSet;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
pub use cel::Value;
use cel::{Context, ExecutionError, ParseErrors, Program};
use flowgate_core::prelude::*;
use prometheus_client::encoding::EncodeLabelValue;
use serde::{Deserialize, Serialize, Serializer};

use crate::http::{apikey, basicauth, jwt};
use crate::llm;
use crate::llm::{LLMInfo, LLMRequest};
use crate::types::agent::BackendInfo;

use crate::transport::stream::{TCPConnectionInfo, TLSConnectionInfo};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("execution: {0}")]
	Resolve(#[from] ExecutionError),
	#[error("parse: {0}")]
	Parse(#[from] ParseErrors),
	#[error("variable: {0}")]
	Variable(String),
}

pub const SOURCE_ATTRIBUTE: &str = "source";
pub const REQUEST_ATTRIBUTE: &str = "request";
pub const REQUEST_BODY_ATTRIBUTE: &str = "request.body";
pub const RESPONSE_ATTRIBUTE: &str = "response";
pub const RESPONSE_BODY_ATTRIBUTE: &str = "response.body";
pub const JWT_ATTRIBUTE: &str = "jwt";
pub const API_KEY_ATTRIBUTE: &str = "apiKey";
pub const BASIC_AUTH_ATTRIBUTE: &str = "basicAuth";
pub const LLM_ATTRIBUTE: &str = "llm";
pub const LLM_PROMPT_ATTRIBUTE: &str = "llm.prompt";
pub const LLM_COMPLETION_ATTRIBUTE: &str = "llm.completion";
pub const MCP_ATTRIBUTE: &str = "mcp";
pub const BACKEND_ATTRIBUTE: &str = "backend";

pub const ALL_ATTRIBUTES: &[&str] = &[
	SOURCE_ATTRIBUTE,
	REQUEST_ATTRIBUTE,
	REQUEST_BODY_ATTRIBUTE,
	RESPONSE_ATTRIBUTE,
	RESPONSE_BODY_ATTRIBUTE,
	JWT_ATTRIBUTE,
	API_KEY_ATTRIBUTE,
	BASIC_AUTH_ATTRIBUTE,
	LLM_ATTRIBUTE,
	LLM_PROMPT_ATTRIBUTE,
	LLM_COMPLETION_ATTRIBUTE,
	MCP_ATTRIBUTE,
	BACKEND_ATTRIBUTE,
];

pub struct Expression {
	attributes: HashSet<String>,
	program: Program,
	source: String,
}

impl Expression {
	/// Compile, rejecting invalid expressions. Used for local config where we
	/// want errors surfaced at load time.
	pub fn new_strict(source: impl Into<String>) -> Result<Self, Error> {
		let source = source.into();
		let program = Program::compile(&source)?;

		let refs = program.references();
		let mut attributes: HashSet<String> = refs
			.variables()
			.into_iter()
			.filter(|v| ALL_ATTRIBUTES.contains(v))
			.map(|v| v.to_string())
			.collect();

		// The nested attributes force buffering or extra capture; detect them
		// from the source text since references() only reports roots.
		for nested in [
			REQUEST_BODY_ATTRIBUTE,
			RESPONSE_BODY_ATTRIBUTE,
			LLM_PROMPT_ATTRIBUTE,
			LLM_COMPLETION_ATTRIBUTE,
		] {
			if source.contains(nested) {
				attributes.insert(nested.to_string());
			}
		}
		// variables() (the CEL function) observes everything
		if refs.functions().contains(&"variables") {
			for a in ALL_ATTRIBUTES {
				attributes.insert(a.to_string());
			}
		}

		Ok(Expression {
			attributes,
			program,
			source,
		})
	}

	/// Compile, replacing an invalid expression with one that always fails to
	/// evaluate. Used for remotely-delivered config where one bad expression
	/// must not reject the snapshot.
	pub fn new_permissive(source: impl Into<String>) -> Self {
		let source = source.into();
		match Self::new_strict(source.clone()) {
			Ok(e) => e,
			Err(err) => {
				tracing::debug!("ignoring failed expression: {err}");
				let fallback =
					Self::new_strict("has(flowgate_invalid_expression.x)").expect("must compile");
				Expression {
					attributes: Default::default(),
					program: fallback.program,
					source,
				}
			},
		}
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	pub fn attributes(&self) -> &HashSet<String> {
		&self.attributes
	}
}

impl Debug for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Expression")
			.field("expression", &self.source)
			.finish()
	}
}

impl Serialize for Expression {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.source)
	}
}

impl<'de> Deserialize<'de> for Expression {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Expression::new_strict(s).map_err(serde::de::Error::custom)
	}
}

/// Accumulates the per-request context lazily: each `with_*` is a no-op when
/// no registered expression needs the attribute.
#[derive(Debug, Default)]
pub struct ContextBuilder {
	pub attributes: HashSet<String>,
	pub context: ExpressionContext,
}

impl ContextBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record the attributes an expression needs. Must be called for every
	/// expression that will later be evaluated against this context.
	pub fn register_expression(&mut self, expression: &Expression) {
		self
			.attributes
			.extend(expression.attributes.iter().cloned());
	}

	/// Returns whether the request body must be buffered.
	pub fn with_request(&mut self, req: &crate::http::Request, start_time: String) -> bool {
		if !self.attributes.contains(REQUEST_ATTRIBUTE) {
			return false;
		}
		if let Some(r) = self.context.request.as_ref() {
			return r.body.is_none() && self.attributes.contains(REQUEST_BODY_ATTRIBUTE);
		}
		self.context.request = Some(RequestContext {
			method: req.method().clone(),
			uri: req.uri().clone(),
			host: req.uri().authority().cloned(),
			scheme: req.uri().scheme().cloned(),
			path: req.uri().path().to_string(),
			headers: req.headers().clone(),
			body: None,
			start_time,
			end_time: None,
		});
		self.attributes.contains(REQUEST_BODY_ATTRIBUTE)
	}

	pub fn with_request_body(&mut self, body: Bytes) {
		if let Some(r) = &mut self.context.request {
			r.body = Some(body);
		}
	}

	/// Returns whether the response body must be buffered.
	pub fn with_response(&mut self, resp: &crate::http::Response) -> bool {
		if !self.attributes.contains(RESPONSE_ATTRIBUTE) {
			return false;
		}
		self.context.response = Some(ResponseContext {
			code: resp.status(),
			headers: resp.headers().clone(),
			body: None,
		});
		self.attributes.contains(RESPONSE_BODY_ATTRIBUTE)
	}

	pub fn with_response_body(&mut self, body: Bytes) {
		if let Some(r) = &mut self.context.response {
			r.body = Some(body);
		}
	}

	pub fn with_source(&mut self, tcp: &TCPConnectionInfo, tls: Option<&TLSConnectionInfo>) {
		if !self.attributes.contains(SOURCE_ATTRIBUTE) || self.context.source.is_some() {
			return;
		}
		self.context.source = Some(SourceContext {
			address: tcp.peer_addr.ip(),
			port: tcp.peer_addr.port(),
			server_name: tls.and_then(|t| t.server_name.clone()),
		});
	}

	pub fn with_jwt(&mut self, claims: &jwt::Claims) {
		if self.attributes.contains(JWT_ATTRIBUTE) {
			self.context.jwt = Some(claims.clone());
		}
	}

	pub fn with_api_key(&mut self, claims: &apikey::Claims) {
		if self.attributes.contains(API_KEY_ATTRIBUTE) {
			self.context.api_key = Some(claims.clone());
		}
	}

	pub fn with_basic_auth(&mut self, claims: &basicauth::Claims) {
		if self.attributes.contains(BASIC_AUTH_ATTRIBUTE) {
			self.context.basic_auth = Some(claims.clone());
		}
	}

	pub fn with_backend(&mut self, info: &BackendInfo, protocol: BackendProtocol) {
		if !self.attributes.contains(BACKEND_ATTRIBUTE) {
			return;
		}
		self.context.backend = Some(BackendContext {
			name: info.backend_name.clone(),
			backend_type: info.backend_type,
			protocol,
		});
	}

	/// Returns whether the prompt must be captured.
	pub fn with_llm_request(&mut self, info: &LLMRequest) -> bool {
		if !self.attributes.contains(LLM_ATTRIBUTE) {
			return false;
		}
		self.context.llm = Some(LLMContext {
			streaming: info.streaming,
			request_model: info.request_model.clone(),
			response_model: None,
			provider: info.provider.clone(),
			input_tokens: info.input_tokens,
			output_tokens: None,
			total_tokens: None,
			prompt: None,
			completion: None,
			params: info.params.clone(),
		});
		self.attributes.contains(LLM_PROMPT_ATTRIBUTE)
	}

	pub fn with_llm_prompt(&mut self, msg: Vec<llm::SimpleChatCompletionMessage>) {
		if let Some(l) = &mut self.context.llm {
			l.prompt = Some(msg);
		}
	}

	pub fn with_llm_response(&mut self, info: &LLMInfo) {
		if !self.attributes.contains(LLM_ATTRIBUTE) {
			return;
		}
		let resp = &info.response;
		if let Some(o) = self.context.llm.as_mut() {
			o.output_tokens = resp.output_tokens;
			o.total_tokens = resp.total_tokens;
			if let Some(pt) = resp.input_tokens {
				o.input_tokens = Some(pt);
			}
			o.response_model = resp.provider_model.clone();
			o.completion = resp.completion.clone();
		}
	}

	pub fn with_request_completion(&mut self, end_time: String) {
		if let Some(r) = self.context.request.as_mut() {
			r.end_time = Some(end_time);
		}
	}

	pub fn needs_llm_completion(&self) -> bool {
		self.attributes.contains(LLM_COMPLETION_ATTRIBUTE)
	}

	pub fn build(&self) -> Result<Executor<'static>, Error> {
		self.build_with_mcp(None)
	}

	pub fn build_with_mcp(
		&self,
		mcp: Option<&crate::mcp::ResourceType>,
	) -> Result<Executor<'static>, Error> {
		let mut ctx = Context::default();
		let ExpressionContext {
			request,
			response,
			source,
			jwt,
			api_key,
			basic_auth,
			llm,
			backend,
		} = &self.context;
		ctx.add_variable_from_value(REQUEST_ATTRIBUTE, opt_to_value(request)?);
		ctx.add_variable_from_value(RESPONSE_ATTRIBUTE, opt_to_value(response)?);
		ctx.add_variable_from_value(SOURCE_ATTRIBUTE, opt_to_value(source)?);
		ctx.add_variable_from_value(JWT_ATTRIBUTE, opt_to_value(jwt)?);
		ctx.add_variable_from_value(API_KEY_ATTRIBUTE, opt_to_value(api_key)?);
		ctx.add_variable_from_value(BASIC_AUTH_ATTRIBUTE, opt_to_value(basic_auth)?);
		ctx.add_variable_from_value(LLM_ATTRIBUTE, opt_to_value(llm)?);
		ctx.add_variable_from_value(BACKEND_ATTRIBUTE, opt_to_value(backend)?);
		ctx.add_variable_from_value(MCP_ATTRIBUTE, opt_to_value(&mcp)?);
		Ok(Executor { ctx })
	}
}

pub struct Executor<'a> {
	ctx: Context<'a>,
}

impl Executor<'_> {
	pub fn eval(&self, expr: &Expression) -> Result<Value, Error> {
		expr.program.execute(&self.ctx).map_err(|e| {
			tracing::trace!("failed to evaluate {}: {e}", expr.source);
			e.into()
		})
	}

	/// Boolean evaluation: anything but `true` (including errors against
	/// absent attributes) is false.
	pub fn eval_bool(&self, expr: &Expression) -> bool {
		matches!(self.eval(expr), Ok(Value::Bool(true)))
	}
}

pub fn value_as_string(v: &Value) -> Option<String> {
	match v {
		Value::String(s) => Some(s.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		Value::Int(i) => Some(i.to_string()),
		Value::UInt(u) => Some(u.to_string()),
		Value::Float(f) => Some(f.to_string()),
		Value::Bytes(b) => {
			use base64::Engine;
			Some(base64::prelude::BASE64_STANDARD.encode(b.as_ref()))
		},
		_ => None,
	}
}

pub fn value_as_json(v: &Value) -> Option<serde_json::Value> {
	use serde_json::Value as J;
	Some(match v {
		Value::Null => J::Null,
		Value::Bool(b) => J::Bool(*b),
		Value::Int(i) => J::from(*i),
		Value::UInt(u) => J::from(*u),
		Value::Float(f) => J::from(*f),
		Value::String(s) => J::String(s.to_string()),
		Value::Bytes(b) => {
			use base64::Engine;
			J::String(base64::prelude::BASE64_STANDARD.encode(b.as_ref()))
		},
		Value::List(items) => J::Array(items.iter().filter_map(value_as_json).collect()),
		Value::Map(m) => {
			let mut out = serde_json::Map::new();
			for (k, v) in m.map.iter() {
				if let Some(v) = value_as_json(v) {
					out.insert(key_to_string(k), v);
				}
			}
			J::Object(out)
		},
		_ => return None,
	})
}

fn key_to_string(k: &cel::objects::Key) -> String {
	use cel::objects::Key;
	match k {
		Key::String(s) => s.to_string(),
		Key::Int(i) => i.to_string(),
		Key::Uint(u) => u.to_string(),
		Key::Bool(b) => b.to_string(),
	}
}

pub fn value_as_header_value(v: &Value) -> Option<http::HeaderValue> {
	value_as_string(v).and_then(|s| http::HeaderValue::from_str(&s).ok())
}

pub fn value_as_float(v: &Value) -> Option<f64> {
	match v {
		Value::Float(f) => Some(*f),
		Value::Int(i) => Some(*i as f64),
		Value::UInt(u) => Some(*u as f64),
		_ => None,
	}
}

fn opt_to_value<S: Serialize>(v: &Option<S>) -> Result<Value, Error> {
	Ok(
		v.as_ref()
			.map(|v| cel::to_value(v).map_err(|e| Error::Variable(e.to_string())))
			.transpose()?
			.unwrap_or(Value::Null),
	)
}

#[derive(Default, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionContext {
	pub request: Option<RequestContext>,
	pub response: Option<ResponseContext>,
	pub source: Option<SourceContext>,
	pub jwt: Option<jwt::Claims>,
	pub api_key: Option<apikey::Claims>,
	pub basic_auth: Option<basicauth::Claims>,
	pub llm: Option<LLMContext>,
	pub backend: Option<BackendContext>,
}

fn serialize_opt_scheme<S: Serializer>(
	scheme: &Option<::http::uri::Scheme>,
	ser: S,
) -> Result<S::Ok, S::Error> {
	match scheme {
		Some(scheme) => ser.collect_str(scheme),
		None => ser.serialize_none(),
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
	#[serde(with = "http_serde::method")]
	pub method: ::http::Method,
	#[serde(with = "http_serde::uri")]
	pub uri: ::http::Uri,
	#[serde(with = "http_serde::option::authority")]
	pub host: Option<::http::uri::Authority>,
	#[serde(serialize_with = "serialize_opt_scheme")]
	pub scheme: Option<::http::uri::Scheme>,
	pub path: String,
	#[serde(with = "http_serde::header_map")]
	pub headers: ::http::HeaderMap,
	/// Accessing the body from an expression causes it to be buffered.
	pub body: Option<Bytes>,
	pub start_time: String,
	pub end_time: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContext {
	#[serde(with = "http_serde::status_code")]
	pub code: ::http::StatusCode,
	#[serde(with = "http_serde::header_map")]
	pub headers: ::http::HeaderMap,
	pub body: Option<Bytes>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceContext {
	pub address: IpAddr,
	pub port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendContext {
	pub name: Strng,
	#[serde(rename = "type")]
	pub backend_type: BackendType,
	pub protocol: BackendProtocol,
}

#[derive(Copy, PartialEq, Eq, Hash, Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
	AI,
	MCP,
	Static,
	Dynamic,
	Service,
	Unknown,
}

#[derive(Copy, PartialEq, Eq, Hash, EncodeLabelValue, Debug, Clone, Serialize)]
#[allow(non_camel_case_types)]
pub enum BackendProtocol {
	http,
	tcp,
	a2a,
	mcp,
	llm,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LLMContext {
	pub streaming: bool,
	pub request_model: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_model: Option<Strng>,
	pub provider: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total_tokens: Option<u64>,
	/// Accessing the prompt from an expression has a cost for large prompts.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt: Option<Vec<llm::SimpleChatCompletionMessage>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completion: Option<Vec<String>>,
	pub params: llm::LLMRequestParams,
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
