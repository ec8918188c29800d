use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::http::{
	HeaderName, PolicyResponse, Request, StatusCode, header,
};
use crate::proxy::{PolicyClient, ProxyError, ProxyResponse};
use crate::types::agent::SimpleBackendReference;

/// External authorization: the request (headers only) is described to an
/// HTTP check service; a non-2xx verdict is returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtAuthz {
	pub target: SimpleBackendReference,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub failure_mode: FailureMode,
	/// Request headers forwarded to the check service in addition to the
	/// pseudo headers. Empty forwards everything.
	#[serde(default)]
	pub include_request_headers: Vec<String>,
	/// Headers copied from an allow verdict onto the upstream request.
	#[serde(default)]
	pub allowed_upstream_headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureMode {
	#[default]
	Deny,
	Allow,
}

impl ExtAuthz {
	pub async fn check(
		&self,
		client: PolicyClient,
		req: &mut Request,
	) -> Result<PolicyResponse, ProxyResponse> {
		match self.call(client, req).await {
			Ok(Verdict::Allow(headers)) => {
				for (name, value) in headers {
					req.headers_mut().insert(name, value);
				}
				Ok(PolicyResponse::default())
			},
			Ok(Verdict::Deny(resp)) => Ok(PolicyResponse::default().with_response(resp)),
			Err(e) => match self.failure_mode {
				FailureMode::Allow => {
					warn!("ext_authz unavailable, allowing request: {e}");
					Ok(PolicyResponse::default())
				},
				FailureMode::Deny => {
					warn!("ext_authz unavailable, denying request: {e}");
					Err(ProxyResponse::Error(ProxyError::AuthorizationFailed))
				},
			},
		}
	}

	async fn call(&self, client: PolicyClient, req: &Request) -> anyhow::Result<Verdict> {
		let path = self.path.as_deref().unwrap_or("/check");
		let mut check = ::http::Request::builder()
			.method(::http::Method::POST)
			.uri(path)
			.header(
				HeaderName::from_static("x-forwarded-method"),
				req.method().as_str(),
			)
			.header(
				HeaderName::from_static("x-forwarded-uri"),
				req.uri().to_string(),
			);
		for (name, value) in req.headers() {
			let include = self.include_request_headers.is_empty()
				|| self
					.include_request_headers
					.iter()
					.any(|h| h.eq_ignore_ascii_case(name.as_str()));
			if include {
				check = check.header(name, value);
			}
		}
		let check = check.body(crate::http::Body::empty())?;
		let resp = client.call_reference(check, &self.target).await?;
		let status = resp.status();
		if status.is_success() {
			let mut upstream_headers = Vec::new();
			for allowed in &self.allowed_upstream_headers {
				if let Ok(name) = HeaderName::try_from(allowed.as_str())
					&& let Some(value) = resp.headers().get(&name)
				{
					upstream_headers.push((name, value.clone()));
				}
			}
			return Ok(Verdict::Allow(upstream_headers));
		}
		if status.is_server_error() {
			anyhow::bail!("check service returned {status}");
		}
		// The verdict response is returned to the client as-is, minus
		// connection-oriented headers.
		let (mut parts, body) = resp.into_parts();
		parts.headers.remove(header::TRANSFER_ENCODING);
		parts.headers.remove(header::CONNECTION);
		let status = if parts.status == StatusCode::OK {
			StatusCode::FORBIDDEN
		} else {
			parts.status
		};
		let mut denied = ::http::Response::from_parts(parts, body);
		*denied.status_mut() = status;
		Ok(Verdict::Deny(denied))
	}
}

enum Verdict {
	Allow(Vec<(HeaderName, crate::http::HeaderValue)>),
	Deny(crate::http::Response),
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::http::Body;
	use crate::types::agent::Target;

	fn policy(server: &MockServer, failure_mode: FailureMode) -> ExtAuthz {
		let addr = server.address();
		ExtAuthz {
			target: SimpleBackendReference::Inline(Target::Address(*addr)),
			path: Some("/check".to_string()),
			failure_mode,
			include_request_headers: vec![],
			allowed_upstream_headers: vec!["x-user".to_string()],
		}
	}

	fn request() -> Request {
		::http::Request::builder()
			.method(::http::Method::GET)
			.uri("http://gw.example.com/protected")
			.header("x-caller", "tester")
			.body(Body::empty())
			.unwrap()
	}

	fn client() -> PolicyClient {
		PolicyClient {
			inputs: crate::ProxyInputs::test_default(),
		}
	}

	#[tokio::test]
	async fn allow_verdict_copies_headers() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/check"))
			.respond_with(ResponseTemplate::new(200).insert_header("x-user", "alice"))
			.mount(&server)
			.await;
		let mut req = request();
		let out = policy(&server, FailureMode::Deny)
			.check(client(), &mut req)
			.await
			.unwrap();
		assert!(out.direct_response.is_none());
		assert_eq!(req.headers().get("x-user").unwrap(), "alice");
	}

	#[tokio::test]
	async fn deny_verdict_is_returned_to_client() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/check"))
			.respond_with(ResponseTemplate::new(403).set_body_string("nope"))
			.mount(&server)
			.await;
		let mut req = request();
		let out = policy(&server, FailureMode::Deny)
			.check(client(), &mut req)
			.await
			.unwrap();
		let resp = out.direct_response.expect("deny short-circuits");
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	}

	#[tokio::test]
	async fn transport_failure_honors_failure_mode() {
		// Point at a closed port.
		let unreachable = ExtAuthz {
			target: SimpleBackendReference::Inline(Target::Address(
				"127.0.0.1:1".parse().unwrap(),
			)),
			path: None,
			failure_mode: FailureMode::Allow,
			include_request_headers: vec![],
			allowed_upstream_headers: vec![],
		};
		let mut req = request();
		let out = unreachable.check(client(), &mut req).await.unwrap();
		assert!(out.direct_response.is_none());

		let deny = ExtAuthz {
			failure_mode: FailureMode::Deny,
			..unreachable
		};
		let mut req = request();
		assert!(deny.check(client(), &mut req).await.is_err());
	}
}
