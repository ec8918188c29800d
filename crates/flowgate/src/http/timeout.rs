use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request timeouts. `request` bounds the whole request including retries;
/// `backend_request` bounds each individual attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub request: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub backend_request: Option<Duration>,
}

impl Policy {
	/// The deadline for a single attempt: the tighter of the two bounds.
	pub fn effective_timeout(&self) -> Option<Duration> {
		match (self.request, self.backend_request) {
			(Some(r), Some(b)) => Some(r.min(b)),
			(r, b) => r.or(b),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tighter_bound_wins() {
		let p = Policy {
			request: Some(Duration::from_secs(10)),
			backend_request: Some(Duration::from_secs(2)),
		};
		assert_eq!(p.effective_timeout(), Some(Duration::from_secs(2)));
		let p = Policy {
			request: None,
			backend_request: Some(Duration::from_secs(2)),
		};
		assert_eq!(p.effective_timeout(), Some(Duration::from_secs(2)));
		assert_eq!(Policy::default().effective_timeout(), None);
	}
}
