//! flowgate: an L7 proxy data plane for AI and agent workloads.
//!
//! The engine terminates HTTP/1.1, HTTP/2, and TLS on configured binds,
//! resolves requests against a routing table, runs a policy pipeline, and
//! dispatches to typed backends: plain HTTP, LLM providers (with protocol
//! translation), and federated MCP servers.

pub mod a2a;
pub mod admin;
pub mod app;
pub mod cel;
pub mod client;
pub mod config;
pub mod http;
pub mod llm;
pub mod mcp;
pub mod parse;
pub mod proxy;
pub mod serdes;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flowgate_core::prelude::*;

/// The processed runtime configuration.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub num_worker_threads: usize,
	#[serde(with = "serdes::serde_dur")]
	pub termination_max_deadline: Duration,
	#[serde(with = "serdes::serde_dur")]
	pub termination_min_deadline: Duration,
	pub admin_addr: Address,
	/// The gateway name used for frontend policy attachment.
	pub gateway: Strng,
	pub backend: client::BackendConfig,
	#[serde(skip)]
	pub logging: telemetry::log::Config,
	#[serde(skip)]
	pub tracing: telemetry::trc::Config,
	pub local_config: Option<ConfigSource>,
	/// xDS management server address; unused when local config is set.
	pub xds_address: Option<String>,
	pub hbone_identity: Option<HboneIdentityConfig>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			num_worker_threads: num_cpus::get(),
			termination_max_deadline: Duration::from_secs(10),
			termination_min_deadline: Duration::ZERO,
			admin_addr: Address::Localhost(true, 15000),
			gateway: strng::literal!("gateway"),
			backend: Default::default(),
			logging: Default::default(),
			tracing: Default::default(),
			local_config: None,
			xds_address: None,
			hbone_identity: None,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HboneIdentityConfig {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub roots: PathBuf,
}

#[derive(Clone, Debug)]
pub enum ConfigSource {
	File(PathBuf),
	Static(Bytes),
}

impl serde::Serialize for ConfigSource {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			ConfigSource::File(p) => serializer.serialize_str(&p.to_string_lossy()),
			ConfigSource::Static(_) => serializer.serialize_str("static"),
		}
	}
}

impl ConfigSource {
	pub async fn read_to_string(&self) -> anyhow::Result<String> {
		Ok(match self {
			ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
			ConfigSource::Static(data) => std::str::from_utf8(data)?.to_string(),
		})
	}

	pub fn read_to_string_sync(&self) -> anyhow::Result<String> {
		Ok(match self {
			ConfigSource::File(path) => std::fs::read_to_string(path)?,
			ConfigSource::Static(data) => std::str::from_utf8(data)?.to_string(),
		})
	}
}

/// Either a plain socket address or "localhost on both stacks".
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub enum Address {
	/// (ipv6 enabled, port)
	Localhost(bool, u16),
	SocketAddr(SocketAddr),
}

impl Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Localhost(_, port) => write!(f, "localhost:{port}"),
			Address::SocketAddr(s) => write!(f, "{s}"),
		}
	}
}

impl Address {
	pub fn parse(ipv6_enabled: bool, s: &str) -> anyhow::Result<Address> {
		if let Some(port) = s.strip_prefix("localhost:") {
			Ok(Address::Localhost(ipv6_enabled, port.parse()?))
		} else {
			Ok(Address::SocketAddr(s.parse()?))
		}
	}

	pub fn addresses(&self) -> Vec<SocketAddr> {
		match self {
			Address::Localhost(ipv6, port) => {
				let mut out = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port)];
				if *ipv6 {
					out.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), *port));
				}
				out
			},
			Address::SocketAddr(s) => vec![*s],
		}
	}
}

/// Everything the proxy needs at request time, assembled once at startup.
#[derive(Clone)]
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub store: Arc<store::Store>,
	pub upstream: client::Client,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	pub tracer: Option<telemetry::trc::Tracer>,
	pub mcp_state: mcp::App,
}

impl std::fmt::Debug for ProxyInputs {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyInputs").finish_non_exhaustive()
	}
}

impl ProxyInputs {
	#[cfg(test)]
	pub(crate) fn test_default() -> Arc<ProxyInputs> {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = telemetry::metrics::Metrics::new(&mut registry);
		Arc::new(ProxyInputs {
			cfg: Arc::new(Config::default()),
			store: Arc::new(store::Store::new()),
			upstream: client::Client::new(Default::default(), None, None),
			metrics,
			tracer: None,
			mcp_state: mcp::App::new(),
		})
	}
}
