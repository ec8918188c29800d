use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::http::{Method, PolicyResponse, Request, header};

/// Cross-site request forgery protection: state-changing requests must carry
/// an Origin (or Referer) matching the request host or an explicit extra
/// allowance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Csrf {
	#[serde(default)]
	pub additional_origins: Vec<Strng>,
}

#[derive(thiserror::Error, Debug)]
#[error("csrf validation failed")]
pub struct CsrfError;

impl Csrf {
	pub fn apply(&self, req: &Request) -> Result<PolicyResponse, CsrfError> {
		// Safe methods carry no state change.
		let method = req.method();
		if method == Method::GET
			|| method == Method::HEAD
			|| method == Method::OPTIONS
			|| method == Method::TRACE
		{
			return Ok(PolicyResponse::default());
		}
		let source = origin_host(req).or_else(|| referer_host(req));
		let Some(source) = source else {
			// No origin information at all; browsers always send one for
			// cross-site requests, so this is a non-browser client.
			return Ok(PolicyResponse::default());
		};
		let target = crate::http::get_host(req).map_err(|_| CsrfError)?;
		if source == target || self.additional_origins.iter().any(|o| o == &source) {
			Ok(PolicyResponse::default())
		} else {
			Err(CsrfError)
		}
	}
}

fn origin_host(req: &Request) -> Option<String> {
	let origin = req.headers().get(header::ORIGIN)?.to_str().ok()?;
	host_of(origin)
}

fn referer_host(req: &Request) -> Option<String> {
	let referer = req.headers().get(header::REFERER)?.to_str().ok()?;
	host_of(referer)
}

fn host_of(url: &str) -> Option<String> {
	url::Url::parse(url)
		.ok()
		.and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn post(origin: Option<&str>) -> Request {
		let mut b = ::http::Request::builder()
			.method(Method::POST)
			.uri("http://api.example.com/submit");
		if let Some(o) = origin {
			b = b.header(header::ORIGIN, o);
		}
		b.body(Body::empty()).unwrap()
	}

	#[test]
	fn same_origin_allowed() {
		let csrf = Csrf::default();
		assert!(csrf.apply(&post(Some("http://api.example.com"))).is_ok());
	}

	#[test]
	fn cross_origin_denied() {
		let csrf = Csrf::default();
		assert!(csrf.apply(&post(Some("http://evil.example.com"))).is_err());
	}

	#[test]
	fn cross_origin_allowed_when_configured() {
		let csrf = Csrf {
			additional_origins: vec!["trusted.example.com".into()],
		};
		assert!(csrf.apply(&post(Some("https://trusted.example.com"))).is_ok());
	}

	#[test]
	fn get_is_exempt() {
		let csrf = Csrf::default();
		let req = ::http::Request::builder()
			.method(Method::GET)
			.uri("http://api.example.com/read")
			.header(header::ORIGIN, "http://evil.example.com")
			.body(Body::empty())
			.unwrap();
		assert!(csrf.apply(&req).is_ok());
	}
}
