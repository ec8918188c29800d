use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::http::{HeaderName, HeaderValue, Request, header};
use crate::proxy::{PolicyClient, ProxyError, ProxyResponse};

/// Credentials attached to requests leaving for a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum BackendAuth {
	/// Forward the caller's Authorization header untouched.
	Passthrough {},
	/// Static bearer token.
	Key(#[serde(serialize_with = "crate::serdes::ser_redacted")] SecretString),
	/// Token from the GCP metadata server.
	Gcp {},
	/// AWS SigV4 request signing.
	Aws(AwsAuth),
	/// Microsoft Entra client-credentials token.
	Azure(AzureAuth),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum AwsAuth {
	/// Credentials from the conventional environment variables.
	Implicit {},
	ExplicitConfig {
		access_key_id: String,
		#[serde(serialize_with = "crate::serdes::ser_redacted")]
		secret_access_key: SecretString,
		#[serde(default, serialize_with = "crate::serdes::ser_redacted_option")]
		session_token: Option<SecretString>,
		#[serde(default)]
		region: Option<String>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AzureAuth {
	pub tenant_id: String,
	pub client_id: String,
	#[serde(serialize_with = "crate::serdes::ser_redacted")]
	pub client_secret: SecretString,
}

/// The AWS region for signing, stashed in request extensions by the bedrock
/// provider.
#[derive(Debug, Clone)]
pub struct AwsRegion {
	pub region: String,
}

/// Early auth: applied before provider translation so providers can assume a
/// standardized Authorization header.
pub async fn apply_backend_auth(
	client: &PolicyClient,
	auth: &BackendAuth,
	req: &mut Request,
) -> Result<(), ProxyResponse> {
	match auth {
		BackendAuth::Passthrough {} => Ok(()),
		BackendAuth::Key(key) => {
			let mut v = HeaderValue::try_from(format!("Bearer {}", key.expose_secret()))
				.map_err(|e| ProxyError::Processing(e.into()))?;
			v.set_sensitive(true);
			req.headers_mut().insert(header::AUTHORIZATION, v);
			Ok(())
		},
		BackendAuth::Gcp {} => {
			let token = gcp_token(client)
				.await
				.map_err(ProxyError::BackendAuthenticationFailed)?;
			insert_bearer(req, &token)
		},
		BackendAuth::Azure(azure) => {
			let token = azure_token(client, azure)
				.await
				.map_err(ProxyError::BackendAuthenticationFailed)?;
			insert_bearer(req, &token)
		},
		// Signing covers the final bytes, so it runs late.
		BackendAuth::Aws(_) => Ok(()),
	}
}

/// Late auth: AWS SigV4 must run after every other request mutation since the
/// signature covers the final headers and payload.
pub async fn apply_late_backend_auth(
	auth: Option<&BackendAuth>,
	req: &mut Request,
) -> Result<(), ProxyResponse> {
	let Some(BackendAuth::Aws(aws)) = auth else {
		return Ok(());
	};
	let creds = aws.credentials().map_err(ProxyError::BackendAuthenticationFailed)?;
	let region = aws
		.region()
		.map(|r| r.to_string())
		.or_else(|| req.extensions().get::<AwsRegion>().map(|r| r.region.clone()))
		.unwrap_or_else(|| "us-east-1".to_string());
	let body = crate::http::inspect_body(req)
		.await
		.map_err(ProxyError::BackendAuthenticationFailed)?;
	sign_aws(req, &creds, &region, "bedrock", &body)
		.map_err(ProxyError::BackendAuthenticationFailed)?;
	Ok(())
}

fn insert_bearer(req: &mut Request, token: &str) -> Result<(), ProxyResponse> {
	let mut v = HeaderValue::try_from(format!("Bearer {token}"))
		.map_err(|e| ProxyError::Processing(e.into()))?;
	v.set_sensitive(true);
	req.headers_mut().insert(header::AUTHORIZATION, v);
	Ok(())
}

struct CachedToken {
	token: String,
	expires: Instant,
}

static TOKEN_CACHE: Lazy<RwLock<HashMap<String, CachedToken>>> =
	Lazy::new(|| RwLock::new(HashMap::new()));

fn cached(key: &str) -> Option<String> {
	let cache = TOKEN_CACHE.read().expect("token cache");
	cache.get(key).and_then(|t| {
		(t.expires > Instant::now() + Duration::from_secs(30)).then(|| t.token.clone())
	})
}

fn store(key: String, token: String, ttl: Duration) {
	TOKEN_CACHE.write().expect("token cache").insert(
		key,
		CachedToken {
			token,
			expires: Instant::now() + ttl,
		},
	);
}

#[derive(Deserialize)]
struct OauthTokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

async fn gcp_token(client: &PolicyClient) -> anyhow::Result<String> {
	const KEY: &str = "gcp";
	if let Some(t) = cached(KEY) {
		return Ok(t);
	}
	let req = ::http::Request::builder()
		.uri(
			"http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token",
		)
		.header(HeaderName::from_static("metadata-flavor"), "Google")
		.body(crate::http::Body::empty())?;
	let resp = client.simple_call(req).await?;
	if !resp.status().is_success() {
		anyhow::bail!("metadata server returned {}", resp.status());
	}
	let body = crate::http::read_body_with_limit(resp.into_body(), 65_536)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))?;
	let parsed: OauthTokenResponse = serde_json::from_slice(&body)?;
	store(
		KEY.to_string(),
		parsed.access_token.clone(),
		Duration::from_secs(parsed.expires_in.unwrap_or(300)),
	);
	Ok(parsed.access_token)
}

async fn azure_token(client: &PolicyClient, azure: &AzureAuth) -> anyhow::Result<String> {
	let key = format!("azure/{}/{}", azure.tenant_id, azure.client_id);
	if let Some(t) = cached(&key) {
		return Ok(t);
	}
	let form = format!(
		"grant_type=client_credentials&client_id={}&client_secret={}&scope=https%3A%2F%2Fcognitiveservices.azure.com%2F.default",
		azure.client_id,
		azure.client_secret.expose_secret(),
	);
	let req = ::http::Request::builder()
		.method(::http::Method::POST)
		.uri(format!(
			"https://login.microsoftonline.com/{}/oauth2/v2.0/token",
			azure.tenant_id
		))
		.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
		.body(crate::http::Body::from(form))?;
	let resp = client.simple_call(req).await?;
	if !resp.status().is_success() {
		anyhow::bail!("token endpoint returned {}", resp.status());
	}
	let body = crate::http::read_body_with_limit(resp.into_body(), 65_536)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))?;
	let parsed: OauthTokenResponse = serde_json::from_slice(&body)?;
	store(
		key,
		parsed.access_token.clone(),
		Duration::from_secs(parsed.expires_in.unwrap_or(300)),
	);
	Ok(parsed.access_token)
}

pub struct AwsCredentials {
	pub access_key_id: String,
	pub secret_access_key: String,
	pub session_token: Option<String>,
}

impl AwsAuth {
	fn credentials(&self) -> anyhow::Result<AwsCredentials> {
		match self {
			AwsAuth::Implicit {} => Ok(AwsCredentials {
				access_key_id: std::env::var("AWS_ACCESS_KEY_ID")
					.map_err(|_| anyhow::anyhow!("AWS_ACCESS_KEY_ID not set"))?,
				secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY")
					.map_err(|_| anyhow::anyhow!("AWS_SECRET_ACCESS_KEY not set"))?,
				session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
			}),
			AwsAuth::ExplicitConfig {
				access_key_id,
				secret_access_key,
				session_token,
				..
			} => Ok(AwsCredentials {
				access_key_id: access_key_id.clone(),
				secret_access_key: secret_access_key.expose_secret().to_string(),
				session_token: session_token.as_ref().map(|t| t.expose_secret().to_string()),
			}),
		}
	}

	fn region(&self) -> Option<&str> {
		match self {
			AwsAuth::ExplicitConfig { region, .. } => region.as_deref(),
			AwsAuth::Implicit {} => None,
		}
	}
}

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
	let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
	mac.update(data);
	mac.finalize().into_bytes().to_vec()
}

/// SigV4 request signing.
fn sign_aws(
	req: &mut Request,
	creds: &AwsCredentials,
	region: &str,
	service: &str,
	body: &[u8],
) -> anyhow::Result<()> {
	let now = Utc::now();
	let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
	let date_stamp = now.format("%Y%m%d").to_string();
	let host = req
		.uri()
		.authority()
		.map(|a| a.as_str().to_string())
		.ok_or_else(|| anyhow::anyhow!("request has no authority"))?;
	let payload_hash = hex::encode(Sha256::digest(body));

	req
		.headers_mut()
		.insert(HeaderName::from_static("x-amz-date"), HeaderValue::try_from(&amz_date)?);
	req.headers_mut().insert(
		HeaderName::from_static("x-amz-content-sha256"),
		HeaderValue::try_from(payload_hash.as_str())?,
	);
	if let Some(token) = &creds.session_token {
		req.headers_mut().insert(
			HeaderName::from_static("x-amz-security-token"),
			HeaderValue::try_from(token.as_str())?,
		);
	}

	// Signed headers: host plus all x-amz-* headers, sorted.
	let mut signed: Vec<(String, String)> = vec![("host".to_string(), host)];
	for (name, value) in req.headers() {
		let name = name.as_str().to_ascii_lowercase();
		if name.starts_with("x-amz-") || name == "content-type" {
			signed.push((name, value.to_str().unwrap_or_default().trim().to_string()));
		}
	}
	signed.sort();
	let signed_header_names = signed
		.iter()
		.map(|(n, _)| n.as_str())
		.collect::<Vec<_>>()
		.join(";");
	let canonical_headers = signed
		.iter()
		.map(|(n, v)| format!("{n}:{v}\n"))
		.collect::<String>();

	let path = req.uri().path();
	let query = req.uri().query().unwrap_or_default();
	let canonical_request = format!(
		"{}\n{}\n{}\n{}\n{}\n{}",
		req.method().as_str(),
		path,
		query,
		canonical_headers,
		signed_header_names,
		payload_hash,
	);

	let scope = format!("{date_stamp}/{region}/{service}/aws4_request");
	let string_to_sign = format!(
		"AWS4-HMAC-SHA256\n{}\n{}\n{}",
		amz_date,
		scope,
		hex::encode(Sha256::digest(canonical_request.as_bytes())),
	);

	let k_date = hmac(
		format!("AWS4{}", creds.secret_access_key).as_bytes(),
		date_stamp.as_bytes(),
	);
	let k_region = hmac(&k_date, region.as_bytes());
	let k_service = hmac(&k_region, service.as_bytes());
	let k_signing = hmac(&k_service, b"aws4_request");
	let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

	let authorization = format!(
		"AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
		creds.access_key_id, scope, signed_header_names, signature,
	);
	let mut v = HeaderValue::try_from(authorization)?;
	v.set_sensitive(true);
	req.headers_mut().insert(header::AUTHORIZATION, v);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	#[tokio::test]
	async fn sigv4_produces_stable_shape() {
		let mut req = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri("https://bedrock-runtime.us-east-1.amazonaws.com/model/m/converse")
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from("{}"))
			.unwrap();
		let creds = AwsCredentials {
			access_key_id: "AKIDEXAMPLE".to_string(),
			secret_access_key: "secret".to_string(),
			session_token: None,
		};
		sign_aws(&mut req, &creds, "us-east-1", "bedrock", b"{}").unwrap();
		let auth = req
			.headers()
			.get(header::AUTHORIZATION)
			.unwrap()
			.to_str()
			.unwrap();
		assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
		assert!(auth.contains("SignedHeaders="));
		assert!(auth.contains("content-type"));
		assert!(req.headers().contains_key("x-amz-date"));
		assert!(req.headers().contains_key("x-amz-content-sha256"));
	}
}
