use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::http::{Request, header};
use crate::telemetry::log::RequestLog;

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
	#[error("no token found")]
	MissingToken,
	#[error("token was not a valid bearer token")]
	MalformedToken,
	#[error("no key matched the token")]
	UnknownKey,
	#[error("jwks is not yet available")]
	JwksUnavailable,
	#[error("token validation failed: {0}")]
	Invalid(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
	/// Requests without a valid token are rejected.
	Strict,
	/// Tokens are validated when present; absent tokens pass.
	#[default]
	Optional,
	/// Tokens are validated and recorded but never cause rejection.
	Permissive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum JwksSource {
	File(PathBuf),
	Inline(String),
	Remote { url: String },
}

/// Config-file form of the JWT policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalJwtConfig {
	#[serde(default)]
	pub mode: Mode,
	pub issuer: String,
	#[serde(default)]
	pub audiences: Option<Vec<String>>,
	pub jwks: JwksSource,
}

impl LocalJwtConfig {
	pub fn build(&self) -> anyhow::Result<Jwt> {
		let jwks = match &self.jwks {
			JwksSource::File(path) => {
				let raw = std::fs::read_to_string(path)?;
				Some(serde_json::from_str::<JwkSet>(&raw)?)
			},
			JwksSource::Inline(raw) => Some(serde_json::from_str::<JwkSet>(raw)?),
			JwksSource::Remote { .. } => None,
		};
		let jwt = Jwt {
			mode: self.mode,
			issuer: self.issuer.clone(),
			audiences: self.audiences.clone(),
			remote_url: match &self.jwks {
				JwksSource::Remote { url } => Some(url.clone()),
				_ => None,
			},
			jwks: Arc::new(ArcSwapOption::new(jwks.map(Arc::new))),
		};
		Ok(jwt)
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Jwt {
	pub mode: Mode,
	pub issuer: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub audiences: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_url: Option<String>,
	#[serde(skip)]
	jwks: Arc<ArcSwapOption<JwkSet>>,
}

/// Verified claims, exposed to CEL as the `jwt` attribute.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
	#[serde(flatten)]
	pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
	pub fn from_map(claims: serde_json::Map<String, serde_json::Value>) -> Self {
		Claims { claims }
	}

	pub fn sub(&self) -> Option<&str> {
		self.claims.get("sub").and_then(|v| v.as_str())
	}
}

impl Jwt {
	/// Install a freshly fetched remote JWKS.
	pub fn set_jwks(&self, jwks: JwkSet) {
		self.jwks.store(Some(Arc::new(jwks)));
	}

	pub fn remote_url(&self) -> Option<&str> {
		self.remote_url.as_deref()
	}

	pub async fn apply(&self, log: &mut RequestLog, req: &mut Request) -> Result<(), TokenError> {
		match self.validate(req) {
			Ok(claims) => {
				log.cel.ctx().with_jwt(&claims);
				log.jwt_sub = claims.sub().map(|s| s.to_string());
				req.extensions_mut().insert(claims);
				Ok(())
			},
			Err(TokenError::MissingToken) if self.mode != Mode::Strict => Ok(()),
			Err(e) if self.mode == Mode::Permissive => {
				debug!("permissive mode, ignoring invalid token: {e}");
				Ok(())
			},
			Err(e) => Err(e),
		}
	}

	fn validate(&self, req: &Request) -> Result<Claims, TokenError> {
		let token = extract_bearer(req)?;
		let jwks = self.jwks.load_full().ok_or(TokenError::JwksUnavailable)?;
		let header = jsonwebtoken::decode_header(token)?;
		let key = select_key(&jwks, header.kid.as_deref()).ok_or(TokenError::UnknownKey)?;

		let alg = key
			.common
			.key_algorithm
			.and_then(|a| Algorithm::from_str(&a.to_string()).ok())
			.unwrap_or(header.alg);
		let mut validation = Validation::new(alg);
		validation.set_issuer(&[&self.issuer]);
		match &self.audiences {
			Some(auds) => validation.set_audience(auds),
			None => validation.validate_aud = false,
		}
		let decoding = DecodingKey::from_jwk(key)?;
		let data =
			jsonwebtoken::decode::<serde_json::Map<String, serde_json::Value>>(
				token, &decoding, &validation,
			)?;
		Ok(Claims::from_map(data.claims))
	}
}

fn extract_bearer(req: &Request) -> Result<&str, TokenError> {
	let auth = req
		.headers()
		.get(header::AUTHORIZATION)
		.ok_or(TokenError::MissingToken)?;
	let auth = auth.to_str().map_err(|_| TokenError::MalformedToken)?;
	auth
		.strip_prefix("Bearer ")
		.or_else(|| auth.strip_prefix("bearer "))
		.ok_or(TokenError::MalformedToken)
}

fn select_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
	match kid {
		Some(kid) => jwks.find(kid),
		// No kid: only unambiguous with a single key.
		None if jwks.keys.len() == 1 => jwks.keys.first(),
		None => None,
	}
}

/// Periodically refresh remote JWKS documents for the given policies.
pub async fn refresh_remote_jwks(policies: Vec<Jwt>, client: crate::proxy::PolicyClient) {
	for jwt in policies {
		let Some(url) = jwt.remote_url().map(|s| s.to_string()) else {
			continue;
		};
		let client = client.clone();
		tokio::task::spawn(async move {
			loop {
				match fetch_jwks(&client, &url).await {
					Ok(jwks) => {
						jwt.set_jwks(jwks);
						tokio::time::sleep(std::time::Duration::from_secs(15 * 60)).await;
					},
					Err(e) => {
						warn!("failed to fetch jwks from {url}: {e}");
						tokio::time::sleep(std::time::Duration::from_secs(15)).await;
					},
				}
			}
		});
	}
}

async fn fetch_jwks(client: &crate::proxy::PolicyClient, url: &str) -> anyhow::Result<JwkSet> {
	let req = ::http::Request::builder()
		.uri(url)
		.header(header::ACCEPT, "application/json")
		.body(crate::http::Body::empty())?;
	let resp = client.simple_call(req).await?;
	if !resp.status().is_success() {
		anyhow::bail!("jwks fetch returned {}", resp.status());
	}
	let body = crate::http::read_body_with_limit(resp.into_body(), 1_048_576)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))?;
	Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
