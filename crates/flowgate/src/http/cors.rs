use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::http::{HeaderMap, HeaderValue, Method, PolicyResponse, Request, StatusCode, header};

/// Cross-origin resource sharing policy.
///
/// Preflight requests are answered directly and never dispatched; matching
/// non-preflight requests get the allow-origin headers staged onto the
/// response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cors {
	#[serde(default)]
	pub allow_origins: Vec<Strng>,
	#[serde(default)]
	pub allow_methods: Vec<Strng>,
	#[serde(default)]
	pub allow_headers: Vec<Strng>,
	#[serde(default)]
	pub expose_headers: Vec<Strng>,
	#[serde(default)]
	pub allow_credentials: bool,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub max_age: Option<std::time::Duration>,
}

impl Cors {
	pub fn apply(&self, req: &Request) -> PolicyResponse {
		let Some(origin) = req
			.headers()
			.get(header::ORIGIN)
			.and_then(|o| o.to_str().ok())
		else {
			return PolicyResponse::default();
		};
		let allowed_origin = self.match_origin(origin);

		let is_preflight = req.method() == Method::OPTIONS
			&& req
				.headers()
				.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

		if is_preflight {
			let mut resp = ::http::Response::builder()
				.status(StatusCode::OK)
				.body(crate::http::Body::empty())
				.expect("static response must build");
			if let Some(origin) = allowed_origin {
				let h = resp.headers_mut();
				insert(h, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
				insert_joined(h, header::ACCESS_CONTROL_ALLOW_METHODS, &self.allow_methods);
				insert_joined(h, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.allow_headers);
				if self.allow_credentials {
					insert(h, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
				}
				if let Some(age) = self.max_age {
					insert(h, header::ACCESS_CONTROL_MAX_AGE, &age.as_secs().to_string());
				}
			}
			return PolicyResponse::default().with_response(resp);
		}

		let Some(origin) = allowed_origin else {
			return PolicyResponse::default();
		};
		let mut headers = HeaderMap::new();
		insert(&mut headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
		insert_joined(
			&mut headers,
			header::ACCESS_CONTROL_EXPOSE_HEADERS,
			&self.expose_headers,
		);
		if self.allow_credentials {
			insert(
				&mut headers,
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				"true",
			);
		}
		PolicyResponse {
			direct_response: None,
			response_headers: Some(headers),
		}
	}

	fn match_origin<'a>(&self, origin: &'a str) -> Option<&'a str> {
		for allowed in &self.allow_origins {
			if allowed == "*" || allowed == origin {
				return Some(if allowed == "*" { "*" } else { origin });
			}
		}
		None
	}
}

fn insert(headers: &mut HeaderMap, name: ::http::HeaderName, value: &str) {
	if let Ok(v) = HeaderValue::from_str(value) {
		headers.insert(name, v);
	}
}

fn insert_joined(headers: &mut HeaderMap, name: ::http::HeaderName, values: &[Strng]) {
	if values.is_empty() {
		return;
	}
	let joined = values.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
	insert(headers, name, &joined);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn cors() -> Cors {
		Cors {
			allow_origins: vec!["https://app.example.com".into()],
			allow_methods: vec!["GET".into(), "POST".into()],
			allow_headers: vec!["content-type".into()],
			expose_headers: vec!["x-request-id".into()],
			allow_credentials: true,
			max_age: Some(std::time::Duration::from_secs(600)),
		}
	}

	#[test]
	fn preflight_short_circuits() {
		let req = ::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("http://example.com/")
			.header(header::ORIGIN, "https://app.example.com")
			.header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
			.body(Body::empty())
			.unwrap();
		let out = cors().apply(&req);
		let resp = out.direct_response.expect("preflight must short-circuit");
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"https://app.example.com"
		);
		assert_eq!(
			resp
				.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET, POST"
		);
	}

	#[test]
	fn disallowed_origin_gets_no_headers() {
		let req = ::http::Request::builder()
			.method(Method::GET)
			.uri("http://example.com/")
			.header(header::ORIGIN, "https://evil.example.com")
			.body(Body::empty())
			.unwrap();
		let out = cors().apply(&req);
		assert!(out.direct_response.is_none());
		assert!(out.response_headers.is_none());
	}

	#[test]
	fn actual_request_stages_headers() {
		let req = ::http::Request::builder()
			.method(Method::GET)
			.uri("http://example.com/")
			.header(header::ORIGIN, "https://app.example.com")
			.body(Body::empty())
			.unwrap();
		let out = cors().apply(&req);
		let headers = out.response_headers.expect("headers staged");
		assert_eq!(
			headers.get(header::ACCESS_CONTROL_EXPOSE_HEADERS).unwrap(),
			"x-request-id"
		);
	}
}
