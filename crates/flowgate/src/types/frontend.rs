//! Listener-side (frontend) tuning policies.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HTTP {
	#[serde(default = "defaults::max_buffer_size")]
	pub max_buffer_size: usize,
	#[serde(default)]
	pub http1_max_headers: Option<usize>,
	#[serde(default = "defaults::http1_idle_timeout", with = "crate::serdes::serde_dur")]
	pub http1_idle_timeout: Duration,
	#[serde(default)]
	pub http2_window_size: Option<u32>,
	#[serde(default)]
	pub http2_connection_window_size: Option<u32>,
	#[serde(default)]
	pub http2_frame_size: Option<u32>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub http2_keepalive_interval: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub http2_keepalive_timeout: Option<Duration>,
}

impl Default for HTTP {
	fn default() -> Self {
		HTTP {
			max_buffer_size: defaults::max_buffer_size(),
			http1_max_headers: None,
			http1_idle_timeout: defaults::http1_idle_timeout(),
			http2_window_size: None,
			http2_connection_window_size: None,
			http2_frame_size: None,
			http2_keepalive_interval: None,
			http2_keepalive_timeout: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TLS {
	#[serde(
		default = "defaults::tls_handshake_timeout",
		with = "crate::serdes::serde_dur"
	)]
	pub tls_handshake_timeout: Duration,
	/// ALPN protocols offered on terminated listeners, most preferred first.
	#[serde(default)]
	pub alpn: Option<Vec<String>>,
}

impl Default for TLS {
	fn default() -> Self {
		TLS {
			tls_handshake_timeout: defaults::tls_handshake_timeout(),
			alpn: None,
		}
	}
}

impl TLS {
	pub fn alpn_bytes(&self) -> Option<Vec<Vec<u8>>> {
		self
			.alpn
			.as_ref()
			.map(|a| a.iter().map(|p| p.as_bytes().to_vec()).collect())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TCP {
	#[serde(default = "defaults::always_true")]
	pub keepalive_enabled: bool,
	#[serde(default = "defaults::keepalive_time", with = "crate::serdes::serde_dur")]
	pub keepalive_time: Duration,
	#[serde(
		default = "defaults::keepalive_interval",
		with = "crate::serdes::serde_dur"
	)]
	pub keepalive_interval: Duration,
	#[serde(default = "defaults::keepalive_retries")]
	pub keepalive_retries: u32,
}

impl Default for TCP {
	fn default() -> Self {
		TCP {
			keepalive_enabled: true,
			keepalive_time: defaults::keepalive_time(),
			keepalive_interval: defaults::keepalive_interval(),
			keepalive_retries: defaults::keepalive_retries(),
		}
	}
}

/// Per-gateway access log adjustments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingPolicy {
	#[serde(default)]
	pub filter: Option<std::sync::Arc<crate::cel::Expression>>,
	#[serde(default)]
	pub add: IndexMap<String, std::sync::Arc<crate::cel::Expression>>,
	#[serde(default)]
	pub remove: Vec<String>,
}

mod defaults {
	use std::time::Duration;

	pub fn always_true() -> bool {
		true
	}
	pub fn max_buffer_size() -> usize {
		2_097_152
	}
	pub fn http1_idle_timeout() -> Duration {
		Duration::from_secs(60)
	}
	pub fn tls_handshake_timeout() -> Duration {
		Duration::from_secs(10)
	}
	pub fn keepalive_time() -> Duration {
		Duration::from_secs(180)
	}
	pub fn keepalive_interval() -> Duration {
		Duration::from_secs(180)
	}
	pub fn keepalive_retries() -> u32 {
		9
	}
}
