use std::sync::Arc;
use std::time::Duration;

use flowgate_core::metrics::{DefaultedUnknown, EncodeDisplay};
use flowgate_core::strng::RichStrng;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::types::agent::BindProtocol;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteIdentifier {
	pub bind: DefaultedUnknown<RichStrng>,
	pub gateway: DefaultedUnknown<RichStrng>,
	pub listener: DefaultedUnknown<RichStrng>,
	pub route: DefaultedUnknown<RichStrng>,
	pub route_rule: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct HTTPLabels {
	pub backend: DefaultedUnknown<RichStrng>,
	pub method: DefaultedUnknown<EncodeDisplay<::http::Method>>,
	pub status: DefaultedUnknown<EncodeDisplay<u16>>,
	pub reason: DefaultedUnknown<EncodeDisplay<crate::proxy::ProxyResponseReason>>,

	#[prometheus(flatten)]
	pub route: RouteIdentifier,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct GenAILabels {
	pub gen_ai_operation_name: DefaultedUnknown<RichStrng>,
	pub gen_ai_system: DefaultedUnknown<RichStrng>,
	pub gen_ai_request_model: DefaultedUnknown<RichStrng>,
	pub gen_ai_response_model: DefaultedUnknown<RichStrng>,
	pub gen_ai_token_type: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct MCPCallLabels {
	pub method: DefaultedUnknown<RichStrng>,
	pub target: DefaultedUnknown<RichStrng>,
	pub resource: DefaultedUnknown<RichStrng>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct TCPLabels {
	pub bind: DefaultedUnknown<RichStrng>,
	pub gateway: DefaultedUnknown<RichStrng>,
	pub listener: DefaultedUnknown<RichStrng>,
	pub protocol: BindProtocol,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectLabels {
	pub transport: DefaultedUnknown<RichStrng>,
}

pub struct Metrics {
	pub requests: Family<HTTPLabels, Counter>,
	pub request_duration: Family<RouteIdentifier, Histogram>,
	pub response_size: Family<RouteIdentifier, Histogram>,
	pub downstream_connection: Family<TCPLabels, Counter>,
	pub tls_handshake_duration: Family<TCPLabels, Histogram>,
	pub upstream_connect_duration: Family<ConnectLabels, Histogram>,
	pub gen_ai_token_usage: Family<GenAILabels, Counter>,
	pub mcp_calls: Family<MCPCallLabels, Counter>,
	pub config_generation: Gauge,
}

impl std::fmt::Debug for Metrics {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Metrics").finish_non_exhaustive()
	}
}

/// Request durations in seconds.
fn duration_buckets() -> Histogram {
	Histogram::new(
		[
			0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
			60.0,
		]
		.into_iter(),
	)
}

/// Response sizes in bytes.
fn size_buckets() -> Histogram {
	Histogram::new(
		[
			64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
			16777216.0,
		]
		.into_iter(),
	)
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Arc<Metrics> {
		let m = Metrics {
			requests: Family::default(),
			request_duration: Family::new_with_constructor(duration_buckets as fn() -> Histogram),
			response_size: Family::new_with_constructor(size_buckets as fn() -> Histogram),
			downstream_connection: Family::default(),
			tls_handshake_duration: Family::new_with_constructor(
				duration_buckets as fn() -> Histogram,
			),
			upstream_connect_duration: Family::new_with_constructor(
				duration_buckets as fn() -> Histogram,
			),
			gen_ai_token_usage: Family::default(),
			mcp_calls: Family::default(),
			config_generation: Gauge::default(),
		};
		registry.register("requests", "Requests handled", m.requests.clone());
		registry.register(
			"request_duration_seconds",
			"Duration of requests",
			m.request_duration.clone(),
		);
		registry.register(
			"response_size_bytes",
			"Size of response bodies",
			m.response_size.clone(),
		);
		registry.register(
			"downstream_connections",
			"Connections accepted",
			m.downstream_connection.clone(),
		);
		registry.register(
			"tls_handshake_duration_seconds",
			"Duration of downstream TLS handshakes",
			m.tls_handshake_duration.clone(),
		);
		registry.register(
			"upstream_connect_duration_seconds",
			"Duration of upstream connection establishment",
			m.upstream_connect_duration.clone(),
		);
		registry.register(
			"gen_ai_client_token_usage",
			"LLM tokens processed",
			m.gen_ai_token_usage.clone(),
		);
		registry.register("mcp_calls", "MCP resource calls", m.mcp_calls.clone());
		registry.register(
			"config_generation",
			"Generation of the active configuration snapshot",
			m.config_generation.clone(),
		);
		Arc::new(m)
	}

	pub fn record_upstream_connect(&self, transport: &'static str, dur: Duration) {
		self
			.upstream_connect_duration
			.get_or_create(&ConnectLabels {
				transport: transport.into(),
			})
			.observe(dur.as_secs_f64());
	}
}
