use std::collections::HashMap;

use flowgate_core::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::http::{HeaderName, Request, StatusCode, header};
use crate::proxy::{ProxyError, ProxyResponse};
use crate::telemetry::log::RequestLog;

/// Static API key authentication.
///
/// Keys can arrive as a bearer token or in a configurable header. Each key
/// carries an opaque metadata document that becomes the CEL `apiKey`
/// attribute for authorization rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct APIKeyAuthentication {
	#[serde(default)]
	pub header: Option<Strng>,
	pub keys: Vec<ConfiguredKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfiguredKey {
	#[serde(serialize_with = "crate::serdes::ser_redacted")]
	pub key: SecretString,
	#[serde(default)]
	pub name: Option<Strng>,
	#[serde(default)]
	pub metadata: HashMap<String, serde_json::Value>,
}

/// Exposed to CEL as the `apiKey` attribute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<Strng>,
	#[serde(flatten)]
	pub metadata: HashMap<String, serde_json::Value>,
}

impl APIKeyAuthentication {
	pub async fn apply(
		&self,
		log: &mut RequestLog,
		req: &mut Request,
	) -> Result<(), ProxyResponse> {
		let Some(presented) = self.extract(req) else {
			return Err(unauthorized());
		};
		let Some(matched) = self
			.keys
			.iter()
			.find(|k| constant_time_eq(k.key.expose_secret().as_bytes(), presented.as_bytes()))
		else {
			return Err(unauthorized());
		};
		let claims = Claims {
			name: matched.name.clone(),
			metadata: matched.metadata.clone(),
		};
		log.cel.ctx().with_api_key(&claims);
		req.extensions_mut().insert(claims);
		// The key is consumed at the gateway; backends get their own auth.
		match &self.header {
			Some(h) => {
				if let Ok(name) = HeaderName::try_from(h.as_str()) {
					req.headers_mut().remove(name);
				}
			},
			None => {
				req.headers_mut().remove(header::AUTHORIZATION);
			},
		}
		Ok(())
	}

	fn extract(&self, req: &Request) -> Option<String> {
		match &self.header {
			Some(h) => {
				let name = HeaderName::try_from(h.as_str()).ok()?;
				Some(req.headers().get(name)?.to_str().ok()?.to_string())
			},
			None => {
				let auth = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
				Some(auth.strip_prefix("Bearer ")?.to_string())
			},
		}
	}
}

fn unauthorized() -> ProxyResponse {
	ProxyResponse::Error(ProxyError::AuthenticationFailure(StatusCode::UNAUTHORIZED))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn auth() -> APIKeyAuthentication {
		APIKeyAuthentication {
			header: Some("x-api-key".into()),
			keys: vec![ConfiguredKey {
				key: "sk-123".into(),
				name: Some("team-a".into()),
				metadata: Default::default(),
			}],
		}
	}

	#[test]
	fn extracts_from_configured_header() {
		let req = ::http::Request::builder()
			.uri("http://example.com/")
			.header("x-api-key", "sk-123")
			.body(Body::empty())
			.unwrap();
		assert_eq!(auth().extract(&req), Some("sk-123".to_string()));
	}

	#[test]
	fn bearer_fallback() {
		let a = APIKeyAuthentication {
			header: None,
			keys: vec![],
		};
		let req = ::http::Request::builder()
			.uri("http://example.com/")
			.header(header::AUTHORIZATION, "Bearer sk-9")
			.body(Body::empty())
			.unwrap();
		assert_eq!(a.extract(&req), Some("sk-9".to_string()));
	}

	#[test]
	fn timing_safe_compare() {
		assert!(constant_time_eq(b"abc", b"abc"));
		assert!(!constant_time_eq(b"abc", b"abd"));
		assert!(!constant_time_eq(b"abc", b"ab"));
	}
}
