use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use http_body::{Body as HttpBody, Frame, SizeHint};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::event;

use crate::cel::{ContextBuilder, Expression};
use crate::llm::{LLMInfo, LLMRequest};
use crate::mcp::MCPInfo;
use crate::proxy::ProxyResponseReason;
use crate::telemetry::metrics::{GenAILabels, HTTPLabels, Metrics, RouteIdentifier};
use crate::telemetry::trc::{TraceParent, Tracer};
use crate::transport::stream::{TCPConnectionInfo, TLSConnectionInfo};
use crate::types::agent::{BackendInfo, Target};

/// A slot that can be written after the owning `RequestLog` reference is
/// gone, typically from a streaming response body.
pub struct AsyncLog<T>(Arc<AtomicCell<Option<T>>>);

impl<T> AsyncLog<T> {
	pub fn store(&self, v: Option<T>) {
		self.0.store(v)
	}

	pub fn take(&self) -> Option<T> {
		self.0.take()
	}

	/// Racey read-modify-write; loads observe an empty slot during the
	/// mutation, which is acceptable for telemetry.
	pub fn non_atomic_mutate(&self, f: impl FnOnce(&mut T))
	where
		T: Default,
	{
		let mut cur = self.0.take().unwrap_or_default();
		f(&mut cur);
		self.0.store(Some(cur));
	}
}

impl<T> Clone for AsyncLog<T> {
	fn clone(&self) -> Self {
		AsyncLog(self.0.clone())
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(AtomicCell::new(None)))
	}
}

impl<T> Debug for AsyncLog<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AsyncLog").finish_non_exhaustive()
	}
}

/// Global access log configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
	pub filter: Option<Arc<Expression>>,
	pub fields: LoggingFields,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingFields {
	pub remove: Vec<String>,
	pub add: IndexMap<String, Arc<Expression>>,
}

/// The CEL half of logging: the per-request context plus the effective
/// filter and extra fields.
#[derive(Debug)]
pub struct CelLogging {
	pub cel_context: ContextBuilder,
	pub filter: Option<Arc<Expression>>,
	pub fields: LoggingFields,
}

impl CelLogging {
	pub fn new(cfg: Config) -> CelLogging {
		let mut cel_context = ContextBuilder::new();
		if let Some(f) = &cfg.filter {
			cel_context.register_expression(f);
		}
		for e in cfg.fields.add.values() {
			cel_context.register_expression(e);
		}
		CelLogging {
			cel_context,
			filter: cfg.filter,
			fields: cfg.fields,
		}
	}

	pub fn ctx(&mut self) -> &mut ContextBuilder {
		&mut self.cel_context
	}

	pub fn register(&mut self, fields: &IndexMap<String, Arc<Expression>>) {
		for e in fields.values() {
			self.cel_context.register_expression(e);
		}
	}
}

/// Everything we know about one request, accumulated through the pipeline
/// and emitted as the access log when the response body completes.
#[derive(Debug)]
pub struct RequestLog {
	pub cel: CelLogging,
	pub metrics: Arc<Metrics>,
	pub start: Instant,
	pub start_time: String,
	pub tcp_info: TCPConnectionInfo,
	pub tls_info: Option<TLSConnectionInfo>,

	pub bind_name: Option<flowgate_core::strng::Strng>,
	pub gateway_name: Option<flowgate_core::strng::Strng>,
	pub listener_name: Option<flowgate_core::strng::Strng>,
	pub route_name: Option<flowgate_core::strng::Strng>,
	pub route_rule_name: Option<flowgate_core::strng::Strng>,

	pub host: Option<String>,
	pub method: Option<::http::Method>,
	pub path: Option<String>,
	pub version: Option<::http::Version>,
	pub status: Option<::http::StatusCode>,
	pub reason: Option<ProxyResponseReason>,
	pub error: Option<String>,
	pub retry_attempt: Option<u8>,
	pub jwt_sub: Option<String>,
	pub a2a_method: Option<String>,

	pub backend_info: Option<BackendInfo>,
	pub backend_protocol: Option<crate::cel::BackendProtocol>,
	pub endpoint: Option<Target>,

	pub grpc_status: AsyncLog<u8>,
	pub llm_request: Option<LLMRequest>,
	pub llm_response: AsyncLog<LLMInfo>,
	pub mcp_status: AsyncLog<MCPInfo>,

	pub incoming_span: Option<TraceParent>,
	pub outgoing_span: Option<TraceParent>,
	pub tracer: Option<Tracer>,
}

impl RequestLog {
	pub fn new(
		cel: CelLogging,
		metrics: Arc<Metrics>,
		start: Instant,
		start_time: String,
		tcp_info: TCPConnectionInfo,
	) -> RequestLog {
		RequestLog {
			cel,
			metrics,
			start,
			start_time,
			tcp_info,
			tls_info: None,
			bind_name: None,
			gateway_name: None,
			listener_name: None,
			route_name: None,
			route_rule_name: None,
			host: None,
			method: None,
			path: None,
			version: None,
			status: None,
			reason: None,
			error: None,
			retry_attempt: None,
			jwt_sub: None,
			a2a_method: None,
			backend_info: None,
			backend_protocol: None,
			endpoint: None,
			grpc_status: Default::default(),
			llm_request: None,
			llm_response: Default::default(),
			mcp_status: Default::default(),
			incoming_span: None,
			outgoing_span: None,
			tracer: None,
		}
	}

	/// Decide whether this request is traced, combining the incoming context
	/// with the configured sampling expressions.
	pub fn trace_sampled(&mut self, incoming: Option<&TraceParent>) -> bool {
		let Some(tracer) = &self.tracer else {
			return false;
		};
		tracer.sample(&self.cel.cel_context, incoming)
	}

	fn finish(mut self) {
		let duration = self.start.elapsed();
		let llm_info = self.llm_response.take();
		let mcp_info = self.mcp_status.take();

		// No status recorded means the request never produced a response:
		// the client went away mid-flight.
		if self.status.is_none() && self.reason.is_none() {
			self.reason = Some(ProxyResponseReason::Cancelled);
		}

		// Metrics are unconditional; the log filter only gates the log line.
		let route = RouteIdentifier {
			bind: self.bind_name.as_ref().into(),
			gateway: self.gateway_name.as_ref().into(),
			listener: self.listener_name.as_ref().into(),
			route: self.route_name.as_ref().into(),
			route_rule: self.route_rule_name.as_ref().into(),
		};
		self
			.metrics
			.requests
			.get_or_create(&HTTPLabels {
				backend: self
					.backend_info
					.as_ref()
					.map(|b| b.backend_name.clone())
					.into(),
				method: self
					.method
					.clone()
					.map(flowgate_core::metrics::EncodeDisplay)
					.into(),
				status: self
					.status
					.map(|s| flowgate_core::metrics::EncodeDisplay(s.as_u16()))
					.into(),
				reason: self.reason.map(flowgate_core::metrics::EncodeDisplay).into(),
				route: route.clone(),
			})
			.inc();
		self
			.metrics
			.request_duration
			.get_or_create(&route)
			.observe(duration.as_secs_f64());
		if let Some(llm) = &llm_info {
			let record = |token_type: &str, count: u64| {
				self
					.metrics
					.gen_ai_token_usage
					.get_or_create(&GenAILabels {
						gen_ai_operation_name: "chat".into(),
						gen_ai_system: llm.request.provider.clone().into(),
						gen_ai_request_model: llm.request.request_model.clone().into(),
						gen_ai_response_model: llm
							.response
							.provider_model
							.as_ref()
							.into(),
						gen_ai_token_type: token_type.into(),
					})
					.inc_by(count);
			};
			if let Some(t) = llm.input_tokens() {
				record("input", t);
			}
			if let Some(t) = llm.response.output_tokens {
				record("output", t);
			}
		}

		// Fill the remaining CEL context before rendering fields.
		if let Some(llm) = &llm_info {
			self.cel.cel_context.with_llm_response(llm);
		}
		self
			.cel
			.cel_context
			.with_request_completion(flowgate_core::telemetry::render_current_time());

		let exec = match self.cel.cel_context.build() {
			Ok(e) => e,
			Err(e) => {
				tracing::debug!("failed to build log context: {e}");
				return;
			},
		};
		if let Some(filter) = &self.cel.filter
			&& !exec.eval_bool(filter)
		{
			return;
		}

		let mut fields: IndexMap<&str, Value> = IndexMap::new();
		let mut add = |k: &'static str, v: Option<Value>| {
			if let Some(v) = v {
				fields.insert(k, v);
			}
		};
		add("start_time", Some(Value::from(self.start_time.clone())));
		add("src.addr", Some(Value::from(self.tcp_info.peer_addr.to_string())));
		add("bind", self.bind_name.as_ref().map(|s| Value::from(s.to_string())));
		add(
			"gateway",
			self.gateway_name.as_ref().map(|s| Value::from(s.to_string())),
		);
		add(
			"listener",
			self.listener_name.as_ref().map(|s| Value::from(s.to_string())),
		);
		add("route", self.route_name.as_ref().map(|s| Value::from(s.to_string())));
		add(
			"route_rule",
			self.route_rule_name.as_ref().map(|s| Value::from(s.to_string())),
		);
		add("host", self.host.clone().map(Value::from));
		add("method", self.method.as_ref().map(|m| Value::from(m.to_string())));
		add("path", self.path.clone().map(Value::from));
		add(
			"version",
			self.version.map(|v| Value::from(format!("{v:?}"))),
		);
		add("status", self.status.map(|s| Value::from(s.as_u16())));
		add("reason", self.reason.map(|r| Value::from(r.to_string())));
		add("duration_ms", Some(Value::from(duration.as_millis() as u64)));
		add(
			"backend",
			self
				.backend_info
				.as_ref()
				.map(|b| Value::from(b.backend_name.to_string())),
		);
		add(
			"endpoint",
			self.endpoint.as_ref().map(|e| Value::from(e.to_string())),
		);
		add(
			"protocol",
			self
				.backend_protocol
				.map(|p| Value::from(format!("{p:?}"))),
		);
		add("retry_attempt", self.retry_attempt.map(Value::from));
		add("jwt.sub", self.jwt_sub.clone().map(Value::from));
		add("a2a.method", self.a2a_method.clone().map(Value::from));
		add("grpc.status", self.grpc_status.take().map(Value::from));
		add("error", self.error.clone().map(Value::from));
		if let Some(llm) = &llm_info {
			add("llm.provider", Some(Value::from(llm.request.provider.to_string())));
			add(
				"llm.request_model",
				Some(Value::from(llm.request.request_model.to_string())),
			);
			add(
				"llm.response_model",
				llm
					.response
					.provider_model
					.as_ref()
					.map(|m| Value::from(m.to_string())),
			);
			add("llm.input_tokens", llm.input_tokens().map(Value::from));
			add("llm.output_tokens", llm.response.output_tokens.map(Value::from));
			add("llm.total_tokens", llm.response.total_tokens.map(Value::from));
			add("llm.streaming", Some(Value::from(llm.request.streaming)));
			if let Some(first) = llm.response.first_token {
				add(
					"llm.first_token_ms",
					Some(Value::from(
						first.duration_since(self.start).as_millis() as u64
					)),
				);
			}
		}
		if let Some(mcp) = &mcp_info {
			add("mcp.method", mcp.method_name.clone().map(Value::from));
			add("mcp.resource", mcp.resource_name.clone().map(Value::from));
			add("mcp.target", mcp.target_name.clone().map(Value::from));
		}
		if let Some(trace) = &self.outgoing_span {
			add("trace.id", Some(Value::from(trace.trace_id_string())));
			add("span.id", Some(Value::from(trace.span_id_string())));
		}

		// User-configured fields: additions are CEL, removals drop baked-in
		// fields.
		for name in &self.cel.fields.remove {
			fields.shift_remove(name.as_str());
		}
		let added: Vec<(String, Value)> = self
			.cel
			.fields
			.add
			.iter()
			.filter_map(|(k, e)| {
				let v = exec.eval(e).ok()?;
				crate::cel::value_as_json(&v).map(|j| (k.clone(), j))
			})
			.collect();
		for (k, v) in &added {
			fields.insert(k.as_str(), v.clone());
		}

		let rendered =
			serde_json::to_string(&fields).unwrap_or_else(|_| "{}".to_string());
		event!(target: "request", parent: None, tracing::Level::INFO, "{rendered}");

		if let Some(tracer) = &self.tracer {
			tracer.send(&self, &exec, duration);
		}
	}
}

/// Holds the log and emits it exactly once on drop.
#[derive(Debug, Default)]
pub struct DropOnLog {
	log: Option<RequestLog>,
}

impl DropOnLog {
	pub fn as_mut(&mut self) -> Option<&mut RequestLog> {
		self.log.as_mut()
	}

	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(l) = self.log.as_mut() {
			f(l);
		}
	}

	pub fn take(&mut self) -> Option<RequestLog> {
		self.log.take()
	}
}

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		DropOnLog { log: Some(log) }
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(log) = self.log.take() {
			log.finish();
		}
	}
}

pin_project_lite::pin_project! {
	/// Carries the access log with the response body so the log (and its
	/// duration) covers the full stream, not just the headers.
	pub struct LogBody<B> {
		#[pin]
		body: B,
		log: DropOnLog,
	}
}

impl<B> LogBody<B> {
	pub fn new(body: B, log: DropOnLog) -> Self {
		Self { body, log }
	}
}

impl<B: HttpBody<Data = bytes::Bytes>> HttpBody for LogBody<B>
where
	B::Error: std::fmt::Display,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.body.poll_frame(cx));
		match result {
			Some(Ok(frame)) => {
				if let Some(trailers) = frame.trailers_ref()
					&& let Some(log) = this.log.as_mut()
					&& let Some(status) = trailers.get("grpc-status")
				{
					let parsed = status.to_str().ok().and_then(|s| s.parse::<u8>().ok());
					log.grpc_status.store(parsed);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			Some(Err(e)) => {
				this.log.with(|l| {
					if l.error.is_none() {
						l.error = Some(e.to_string());
					}
				});
				Poll::Ready(Some(Err(e)))
			},
			None => Poll::Ready(None),
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}
