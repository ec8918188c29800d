pub mod apikey;
pub mod auth;
pub mod authorization;
pub mod backendtls;
pub mod basicauth;
pub mod cors;
pub mod csrf;
pub mod ext_authz;
pub mod filters;
pub mod jwt;
pub mod localratelimit;
mod peekbody;
pub mod remoteratelimit;
pub mod retry;
pub mod route;
pub mod timeout;
pub mod transformation;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};
use bytes::Bytes;

use crate::proxy::{ProxyError, ProxyResponse};
use crate::transport::BufferLimit;

pub mod x_headers {
	use http::HeaderName;

	pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
	pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
	pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
	pub const X_RETRY_ATTEMPT: HeaderName = HeaderName::from_static("x-retry-attempt");
}

pub fn modify_req(
	req: &mut Request,
	f: impl FnOnce(&mut ::http::request::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let taken = std::mem::take(req);
	let (mut head, body) = taken.into_parts();
	f(&mut head)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let taken = std::mem::take(req);
	let (mut head, body) = taken.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

pub fn modify_uri(
	head: &mut ::http::request::Parts,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let taken = std::mem::take(&mut head.uri);
	let mut parts = taken.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownContentTypes {
	Json,
	Sse,
	Unknown,
}

pub fn classify_content_type(h: &HeaderMap) -> WellKnownContentTypes {
	let Some(ct) = h.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
		return WellKnownContentTypes::Unknown;
	};
	let base = ct.split(';').next().unwrap_or_default().trim();
	match base {
		"application/json" => WellKnownContentTypes::Json,
		"text/event-stream" => WellKnownContentTypes::Sse,
		_ => WellKnownContentTypes::Unknown,
	}
}

pub fn get_host(req: &Request) -> Result<&str, ProxyError> {
	// Requests are normalized at ingest so the authority is always in the URI.
	let host = req.uri().host().ok_or(ProxyError::InvalidRequest)?;
	Ok(strip_port(host))
}

const DEFAULT_BUFFER_LIMIT: usize = 2_097_152;

pub fn buffer_limit(req: &Request) -> usize {
	req
		.extensions()
		.get::<BufferLimit>()
		.map(|b| b.0)
		.unwrap_or(DEFAULT_BUFFER_LIMIT)
}

pub fn response_buffer_limit(resp: &Response) -> usize {
	resp
		.extensions()
		.get::<BufferLimit>()
		.map(|b| b.0)
		.unwrap_or(DEFAULT_BUFFER_LIMIT)
}

pub async fn read_body(req: Request) -> Result<Bytes, Error> {
	let limit = buffer_limit(&req);
	read_body_with_limit(req.into_body(), limit).await
}

pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, Error> {
	use http_body_util::BodyExt;
	Ok(
		http_body_util::Limited::new(body, limit)
			.collect()
			.await
			.map_err(Error::new)?
			.to_bytes(),
	)
}

/// Buffer the body in place; the request remains usable.
pub async fn inspect_body(req: &mut Request) -> anyhow::Result<Bytes> {
	let limit = buffer_limit(req);
	peekbody::inspect_body(req.body_mut(), limit).await
}

pub async fn inspect_response_body(resp: &mut Response) -> anyhow::Result<Bytes> {
	let limit = response_buffer_limit(resp);
	peekbody::inspect_body(resp.body_mut(), limit).await
}

fn strip_port(authority: &str) -> &str {
	let host_port = authority
		.rsplit('@')
		.next()
		.expect("split always yields at least one item");
	if host_port.starts_with('[') {
		let end = host_port.find(']').unwrap_or(host_port.len() - 1);
		&host_port[..=end]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always yields at least one item")
	}
}

/// The outcome of a request-phase policy: optional response headers to stage,
/// or a direct response that short-circuits dispatch.
#[derive(Debug, Default)]
#[must_use]
pub struct PolicyResponse {
	pub direct_response: Option<Response>,
	pub response_headers: Option<HeaderMap>,
}

impl PolicyResponse {
	pub fn apply(self, staged: &mut HeaderMap) -> Result<(), ProxyResponse> {
		if let Some(mut dr) = self.direct_response {
			merge_in_headers(self.response_headers, dr.headers_mut());
			Err(ProxyResponse::DirectResponse(Box::new(dr)))
		} else {
			merge_in_headers(self.response_headers, staged);
			Ok(())
		}
	}

	pub fn with_response(self, resp: Response) -> Self {
		PolicyResponse {
			direct_response: Some(resp),
			response_headers: self.response_headers,
		}
	}
}

pub fn merge_in_headers(additional: Option<HeaderMap>, dest: &mut HeaderMap) {
	if let Some(headers) = additional {
		for (k, v) in headers.into_iter() {
			let Some(k) = k else { continue };
			dest.insert(k, v);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_port_variants() {
		assert_eq!(strip_port("example.com:8080"), "example.com");
		assert_eq!(strip_port("example.com"), "example.com");
		assert_eq!(strip_port("[::1]:443"), "[::1]");
		assert_eq!(strip_port("user@example.com:80"), "example.com");
	}

	#[test]
	fn content_type_classification() {
		let mut h = HeaderMap::new();
		h.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
		assert_eq!(classify_content_type(&h), WellKnownContentTypes::Json);
		h.insert(
			header::CONTENT_TYPE,
			"text/event-stream; charset=utf-8".parse().unwrap(),
		);
		assert_eq!(classify_content_type(&h), WellKnownContentTypes::Sse);
		h.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
		assert_eq!(classify_content_type(&h), WellKnownContentTypes::Unknown);
	}
}
