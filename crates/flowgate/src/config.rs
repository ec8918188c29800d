//! User-facing configuration: the `config` block of the document, plus
//! environment fallbacks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flowgate_core::prelude::*;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::{Address, Config, ConfigSource, HboneIdentityConfig};

/// The raw `config` section as users write it. `Config` is the processed
/// form.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default)]
	pub enable_ipv6: Option<bool>,
	#[serde(default)]
	pub worker_threads: Option<usize>,
	#[serde(default)]
	pub admin_addr: Option<String>,
	#[serde(default)]
	pub gateway: Option<String>,
	#[serde(default)]
	pub xds_address: Option<String>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub connection_termination_deadline: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub connection_min_termination_deadline: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub pool_idle_timeout: Option<Duration>,
	#[serde(default)]
	pub pool_max_idle_per_host: Option<usize>,
	#[serde(default)]
	pub pool_max_streams_per_conn: Option<usize>,
	#[serde(default)]
	pub logging: Option<RawLogging>,
	#[serde(default)]
	pub tracing: Option<crate::telemetry::trc::Config>,
	#[serde(default)]
	pub hbone_identity: Option<HboneIdentityConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawLogging {
	#[serde(default)]
	pub filter: Option<String>,
	#[serde(default)]
	pub fields: Option<RawLoggingFields>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawLoggingFields {
	#[serde(default)]
	pub remove: Vec<String>,
	#[serde(default)]
	pub add: IndexMap<String, String>,
}

impl RawConfig {
	pub fn build(self, source: Option<PathBuf>) -> anyhow::Result<Config> {
		let ipv6 = self.enable_ipv6.unwrap_or(true);
		let logging = match self.logging {
			Some(raw) => {
				let filter = raw
					.filter
					.map(|f| crate::cel::Expression::new_strict(f).map(Arc::new))
					.transpose()?;
				let mut add = IndexMap::new();
				if let Some(fields) = &raw.fields {
					for (k, v) in &fields.add {
						add.insert(
							k.clone(),
							Arc::new(crate::cel::Expression::new_strict(v.clone())?),
						);
					}
				}
				crate::telemetry::log::Config {
					filter,
					fields: crate::telemetry::log::LoggingFields {
						remove: raw.fields.map(|f| f.remove).unwrap_or_default(),
						add,
					},
				}
			},
			None => Default::default(),
		};

		let mut backend = crate::client::BackendConfig::default();
		if let Some(v) = self.connect_timeout {
			backend.connect_timeout = v;
		}
		if let Some(v) = self.pool_idle_timeout {
			backend.pool_idle_timeout = v;
		}
		if let Some(v) = self.pool_max_idle_per_host {
			backend.pool_max_idle_per_host = v;
		}
		if let Some(v) = self.pool_max_streams_per_conn {
			backend.pool_max_streams_per_conn = v;
		}

		Ok(Config {
			num_worker_threads: self
				.worker_threads
				.or_else(|| {
					std::env::var("WORKER_THREADS")
						.ok()
						.and_then(|v| v.parse().ok())
				})
				.unwrap_or_else(num_cpus::get),
			termination_max_deadline: self
				.connection_termination_deadline
				.unwrap_or(Duration::from_secs(10)),
			termination_min_deadline: self
				.connection_min_termination_deadline
				.unwrap_or(Duration::ZERO),
			admin_addr: match self.admin_addr {
				Some(a) => Address::parse(ipv6, &a)?,
				None => Address::Localhost(ipv6, 15000),
			},
			gateway: self
				.gateway
				.map(Strng::from)
				.unwrap_or(strng::literal!("gateway")),
			backend,
			logging,
			tracing: self.tracing.unwrap_or_default(),
			local_config: source.map(ConfigSource::File),
			xds_address: self
				.xds_address
				.or_else(|| std::env::var("XDS_ADDRESS").ok()),
			hbone_identity: self.hbone_identity,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_config_builds() {
		let raw: RawConfig = serde_yaml::from_str("{}").unwrap();
		let cfg = raw.build(None).unwrap();
		assert!(cfg.num_worker_threads > 0);
		assert_eq!(cfg.gateway, "gateway");
	}

	#[test]
	fn knobs_apply() {
		let raw: RawConfig = serde_yaml::from_str(
			r#"
workerThreads: 2
adminAddr: "localhost:19000"
connectionTerminationDeadline: 30s
poolMaxIdlePerHost: 4
"#,
		)
		.unwrap();
		let cfg = raw.build(None).unwrap();
		assert_eq!(cfg.num_worker_threads, 2);
		assert_eq!(cfg.termination_max_deadline, Duration::from_secs(30));
		assert_eq!(cfg.backend.pool_max_idle_per_host, 4);
	}

	#[test]
	fn unknown_fields_rejected() {
		assert!(serde_yaml::from_str::<RawConfig>("bogusKnob: true").is_err());
	}
}
