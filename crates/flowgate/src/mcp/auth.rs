use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::http::{Request, Response, StatusCode, header, jwt};

pub const RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// OAuth protected-resource authentication for an MCP backend: bearer
/// tokens are validated against the issuer/audience, and unauthenticated
/// clients are pointed at the discovery document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpAuthentication {
	pub issuer: String,
	pub audience: String,
	#[serde(default)]
	pub jwks_url: Option<String>,
	/// Extra keys merged into the discovery document.
	#[serde(default)]
	pub resource_metadata: BTreeMap<String, Value>,
}

impl McpAuthentication {
	pub fn as_jwt(&self) -> anyhow::Result<jwt::Jwt> {
		let url = match &self.jwks_url {
			Some(url) => url.clone(),
			None => format!("{}/.well-known/jwks.json", self.issuer.trim_end_matches('/')),
		};
		jwt::LocalJwtConfig {
			mode: jwt::Mode::Strict,
			issuer: self.issuer.clone(),
			audiences: Some(vec![self.audience.clone()]),
			jwks: jwt::JwksSource::Remote { url },
		}
		.build()
	}

	/// Reject unauthenticated requests with a pointer to the discovery
	/// document, per the MCP authorization spec.
	pub fn check(&self, req: &Request) -> Result<(), Box<Response>> {
		let has_bearer = req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.starts_with("Bearer "))
			.unwrap_or(false);
		if has_bearer {
			// Token validity is enforced by the jwt policy attached to the
			// route; this layer only drives the discovery handshake.
			return Ok(());
		}
		let metadata_url = format!(
			"{}{}",
			request_base(req),
			RESOURCE_METADATA_PATH,
		);
		let resp = ::http::Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.header(
				header::WWW_AUTHENTICATE,
				format!("Bearer resource_metadata=\"{metadata_url}\""),
			)
			.body(crate::http::Body::empty())
			.expect("static response must build");
		Err(Box::new(resp))
	}

	pub fn resource_metadata_response(&self, req: &Request) -> Response {
		let mut doc = serde_json::Map::new();
		doc.insert("resource".to_string(), Value::String(request_base(req)));
		doc.insert(
			"authorization_servers".to_string(),
			json!([self.issuer.clone()]),
		);
		doc.insert(
			"bearer_methods_supported".to_string(),
			json!(["header"]),
		);
		for (k, v) in &self.resource_metadata {
			doc.insert(k.clone(), v.clone());
		}
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "application/json")
			.body(crate::http::Body::from(Value::Object(doc).to_string()))
			.expect("static response must build")
	}
}

fn request_base(req: &Request) -> String {
	let scheme = req
		.uri()
		.scheme_str()
		.unwrap_or("http");
	let authority = req
		.uri()
		.authority()
		.map(|a| a.as_str())
		.unwrap_or("localhost");
	format!("{scheme}://{authority}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn authn() -> McpAuthentication {
		McpAuthentication {
			issuer: "https://idp.example.com".to_string(),
			audience: "mcp".to_string(),
			jwks_url: None,
			resource_metadata: BTreeMap::new(),
		}
	}

	#[test]
	fn unauthenticated_gets_discovery_pointer() {
		let req = ::http::Request::builder()
			.uri("https://gw.example.com/mcp")
			.body(Body::empty())
			.unwrap();
		let err = authn().check(&req).unwrap_err();
		assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
		let www = err
			.headers()
			.get(header::WWW_AUTHENTICATE)
			.unwrap()
			.to_str()
			.unwrap();
		assert!(www.contains("/.well-known/oauth-protected-resource"));
	}

	#[test]
	fn discovery_document_contents() {
		let req = ::http::Request::builder()
			.uri("https://gw.example.com/.well-known/oauth-protected-resource")
			.body(Body::empty())
			.unwrap();
		let resp = authn().resource_metadata_response(&req);
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[test]
	fn default_jwks_url_derived_from_issuer() {
		let jwt = authn().as_jwt().unwrap();
		assert_eq!(
			jwt.remote_url(),
			Some("https://idp.example.com/.well-known/jwks.json")
		);
	}
}
