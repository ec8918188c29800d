//! W3C trace context propagation and OTLP span export.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use opentelemetry::KeyValue;
use opentelemetry::trace::{SpanBuilder, SpanId, SpanKind, TraceId, Tracer as _};
use opentelemetry_otlp::WithExportConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cel::{ContextBuilder, Expression};
use crate::http::{HeaderName, HeaderValue, Request};

const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

/// A W3C `traceparent` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
	pub trace_id: u128,
	pub span_id: u64,
	pub flags: u8,
}

impl TraceParent {
	pub fn new() -> TraceParent {
		let mut rng = rand::rng();
		TraceParent {
			trace_id: rng.random(),
			span_id: rng.random(),
			flags: 0,
		}
	}

	pub fn from_request(req: &Request) -> Option<TraceParent> {
		let raw = req.headers().get(&TRACEPARENT)?.to_str().ok()?;
		Self::parse(raw)
	}

	fn parse(raw: &str) -> Option<TraceParent> {
		let mut parts = raw.split('-');
		let version = parts.next()?;
		if version != "00" {
			return None;
		}
		let trace_id = u128::from_str_radix(parts.next()?, 16).ok()?;
		let span_id = u64::from_str_radix(parts.next()?, 16).ok()?;
		let flags = u8::from_str_radix(parts.next()?, 16).ok()?;
		if trace_id == 0 || span_id == 0 {
			return None;
		}
		Some(TraceParent {
			trace_id,
			span_id,
			flags,
		})
	}

	/// A child span within the same trace.
	pub fn new_span(&self) -> TraceParent {
		TraceParent {
			trace_id: self.trace_id,
			span_id: rand::rng().random(),
			flags: self.flags,
		}
	}

	pub fn sampled(&self) -> bool {
		self.flags & 1 == 1
	}

	pub fn trace_id_string(&self) -> String {
		format!("{:032x}", self.trace_id)
	}

	pub fn span_id_string(&self) -> String {
		format!("{:016x}", self.span_id)
	}

	pub fn insert_header(&self, req: &mut Request) {
		let value = format!(
			"00-{}-{}-{:02x}",
			self.trace_id_string(),
			self.span_id_string(),
			self.flags
		);
		if let Ok(v) = HeaderValue::try_from(value) {
			req.headers_mut().insert(&TRACEPARENT, v);
		}
	}
}

impl Default for TraceParent {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
	pub otlp_endpoint: Option<String>,
	/// Probability (or boolean) deciding sampling for requests with no
	/// incoming trace.
	#[serde(default)]
	pub random_sampling: Option<Arc<Expression>>,
	/// Probability (or boolean) for honoring an incoming, sampled trace.
	#[serde(default)]
	pub client_sampling: Option<Arc<Expression>>,
	#[serde(default)]
	pub fields: IndexMap<String, Arc<Expression>>,
}

#[derive(Clone)]
pub struct Tracer {
	tracer: opentelemetry_sdk::trace::SdkTracer,
	provider: opentelemetry_sdk::trace::SdkTracerProvider,
	pub config: Arc<Config>,
}

impl std::fmt::Debug for Tracer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tracer").finish_non_exhaustive()
	}
}

impl Tracer {
	pub fn new(config: &Config) -> anyhow::Result<Option<Tracer>> {
		let Some(endpoint) = &config.otlp_endpoint else {
			return Ok(None);
		};
		let exporter = opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.with_endpoint(endpoint.clone())
			.build()?;
		let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
			.with_batch_exporter(exporter)
			.with_resource(
				opentelemetry_sdk::Resource::builder()
					.with_service_name("flowgate")
					.build(),
			)
			.build();
		let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, "flowgate");
		Ok(Some(Tracer {
			tracer,
			provider,
			config: Arc::new(config.clone()),
		}))
	}

	pub fn shutdown(&self) {
		let _ = self.provider.shutdown();
	}

	/// The sampling decision. With an incoming trace, `client_sampling`
	/// applies; otherwise `random_sampling` decides (default off).
	pub fn sample(&self, ctx: &ContextBuilder, incoming: Option<&TraceParent>) -> bool {
		let decide = |expr: &Option<Arc<Expression>>, default: bool| -> bool {
			let Some(expr) = expr else { return default };
			let Ok(exec) = ctx.build() else {
				return default;
			};
			match exec.eval(expr) {
				Ok(crate::cel::Value::Bool(b)) => b,
				Ok(v) => match crate::cel::value_as_float(&v) {
					Some(p) => rand::rng().random_bool(p.clamp(0.0, 1.0)),
					None => default,
				},
				Err(_) => default,
			}
		};
		match incoming {
			Some(tp) if tp.sampled() => decide(&self.config.client_sampling, true),
			// Not sampled upstream, and we never un-hide: random decides.
			_ => decide(&self.config.random_sampling, false),
		}
	}

	pub fn send(
		&self,
		log: &crate::telemetry::log::RequestLog,
		exec: &crate::cel::Executor<'_>,
		duration: Duration,
	) {
		let Some(span) = &log.outgoing_span else {
			return;
		};
		let mut attributes = vec![];
		let mut push = |k: &'static str, v: Option<String>| {
			if let Some(v) = v {
				attributes.push(KeyValue::new(k, v));
			}
		};
		push("http.request.method", log.method.as_ref().map(|m| m.to_string()));
		push("url.path", log.path.clone());
		push(
			"http.response.status_code",
			log.status.map(|s| s.as_u16().to_string()),
		);
		push("server.address", log.host.clone());
		push(
			"gateway.route",
			log.route_name.as_ref().map(|r| r.to_string()),
		);
		for (k, e) in &self.config.fields {
			if let Ok(v) = exec.eval(e) {
				push_owned(&mut attributes, k.clone(), crate::cel::value_as_string(&v));
			}
		}

		let name = log
			.route_name
			.as_ref()
			.map(|r| r.to_string())
			.unwrap_or_else(|| "request".to_string());
		let end = SystemTime::now();
		let start = end - duration;
		let builder = SpanBuilder::from_name(name)
			.with_trace_id(TraceId::from(span.trace_id))
			.with_span_id(SpanId::from(span.span_id))
			.with_kind(SpanKind::Server)
			.with_start_time(start)
			.with_end_time(end)
			.with_attributes(attributes);
		let span = self.tracer.build(builder);
		drop(span);
	}
}

fn push_owned(attributes: &mut Vec<KeyValue>, key: String, value: Option<String>) {
	if let Some(v) = value {
		attributes.push(KeyValue::new(key, v));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn traceparent_roundtrip() {
		let tp = TraceParent::parse(
			"00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
		)
		.unwrap();
		assert_eq!(tp.trace_id_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
		assert_eq!(tp.span_id_string(), "00f067aa0ba902b7");
		assert!(tp.sampled());

		let child = tp.new_span();
		assert_eq!(child.trace_id, tp.trace_id);
		assert_ne!(child.span_id, tp.span_id);
	}

	#[test]
	fn invalid_traceparent_rejected() {
		assert!(TraceParent::parse("01-abc-def-01").is_none());
		assert!(
			TraceParent::parse("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none()
		);
	}
}
