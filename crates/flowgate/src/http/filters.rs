//! Built-in request/response filters: header modification, redirect, URL
//! rewrite, mirroring, and direct responses.

use std::num::NonZeroU16;

use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::http::{
	HeaderMap, HeaderName, HeaderValue, PolicyResponse, Request, Response, StatusCode, Uri,
	modify_req_uri, uri,
};
use crate::types::agent::{PathMatch, SimpleBackendReference};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid header name: {0}")]
	HeaderName(#[from] ::http::header::InvalidHeaderName),
	#[error("invalid header value: {0}")]
	HeaderValue(#[from] ::http::header::InvalidHeaderValue),
	#[error("invalid uri: {0}")]
	Uri(#[from] ::http::uri::InvalidUri),
	#[error("invalid uri parts: {0}")]
	UriParts(#[from] ::http::uri::InvalidUriParts),
	#[error("processing: {0}")]
	Processing(#[from] anyhow::Error),
}

/// Marker: the Host header should be rewritten to the backend hostname.
/// Present by default; a URL rewrite with an explicit authority removes it.
#[derive(Debug, Clone, Copy)]
pub struct AutoHostname();

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeaderModifier {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub add: Vec<(Strng, Strng)>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub set: Vec<(Strng, Strng)>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub remove: Vec<Strng>,
}

impl HeaderModifier {
	pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), Error> {
		for (k, v) in &self.add {
			headers.append(
				HeaderName::try_from(k.as_str())?,
				HeaderValue::try_from(v.as_str())?,
			);
		}
		for (k, v) in &self.set {
			headers.insert(
				HeaderName::try_from(k.as_str())?,
				HeaderValue::try_from(v.as_str())?,
			);
		}
		for k in &self.remove {
			if let Ok(name) = HeaderName::try_from(k.as_str()) {
				headers.remove(name);
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum HostRedirect {
	Full(Strng),
	Host(Strng),
	Port(NonZeroU16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum PathRedirect {
	Full(Strng),
	Prefix(Strng),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestRedirect {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scheme: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub authority: Option<HostRedirect>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathRedirect>,
	#[serde(default = "default_redirect_status", with = "status_serde")]
	pub status: StatusCode,
}

fn default_redirect_status() -> StatusCode {
	StatusCode::FOUND
}

mod status_serde {
	use http::StatusCode;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(s: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_u16(s.as_u16())
	}
	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StatusCode, D::Error> {
		let v = u16::deserialize(de)?;
		StatusCode::from_u16(v).map_err(serde::de::Error::custom)
	}
}

impl RequestRedirect {
	pub fn apply(&self, req: &Request) -> Result<PolicyResponse, Error> {
		let location = rewrite_uri(
			req,
			self.scheme.as_ref(),
			self.authority.as_ref(),
			self.path.as_ref(),
		)?;
		let resp = ::http::Response::builder()
			.status(self.status)
			.header(::http::header::LOCATION, location.to_string())
			.body(crate::http::Body::empty())
			.expect("static response must build");
		Ok(PolicyResponse::default().with_response(resp))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlRewrite {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub authority: Option<HostRedirect>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathRedirect>,
}

impl UrlRewrite {
	pub fn apply(&self, req: &mut Request) -> Result<(), Error> {
		let new_uri = rewrite_uri(req, None, self.authority.as_ref(), self.path.as_ref())?;
		if self.authority.is_some() {
			// Explicit authority: stop auto host rewriting at dispatch.
			req.extensions_mut().remove::<AutoHostname>();
		}
		*req.uri_mut() = new_uri;
		Ok(())
	}
}

fn rewrite_uri(
	req: &Request,
	scheme: Option<&Strng>,
	authority: Option<&HostRedirect>,
	path: Option<&PathRedirect>,
) -> Result<Uri, Error> {
	let mut parts = req.uri().clone().into_parts();
	if let Some(s) = scheme {
		parts.scheme = Some(uri::Scheme::try_from(s.as_str())?);
	}
	match authority {
		Some(HostRedirect::Full(full)) => {
			parts.authority = Some(uri::Authority::try_from(full.as_str())?);
		},
		Some(HostRedirect::Host(host)) => {
			let port = parts.authority.as_ref().and_then(|a| a.port_u16());
			let new = match port {
				Some(p) => format!("{host}:{p}"),
				None => host.to_string(),
			};
			parts.authority = Some(uri::Authority::try_from(new.as_str())?);
		},
		Some(HostRedirect::Port(port)) => {
			let host = parts
				.authority
				.as_ref()
				.map(|a| a.host().to_string())
				.unwrap_or_default();
			parts.authority = Some(uri::Authority::try_from(format!("{host}:{port}").as_str())?);
		},
		None => {},
	}
	match path {
		Some(PathRedirect::Full(full)) => {
			parts.path_and_query = Some(uri::PathAndQuery::try_from(full.as_str())?);
		},
		Some(PathRedirect::Prefix(prefix)) => {
			let matched = req
				.extensions()
				.get::<PathMatch>()
				.and_then(|m| match m {
					PathMatch::PathPrefix(p) => Some(p.as_str()),
					_ => None,
				})
				.unwrap_or("/");
			let current = req.uri().path();
			let suffix = current.strip_prefix(matched).unwrap_or(current);
			let mut joined = prefix.trim_end_matches('/').to_string();
			if !suffix.is_empty() && !suffix.starts_with('/') {
				joined.push('/');
			}
			joined.push_str(suffix);
			if joined.is_empty() {
				joined.push('/');
			}
			if let Some(q) = req.uri().query() {
				joined.push('?');
				joined.push_str(q);
			}
			parts.path_and_query = Some(uri::PathAndQuery::try_from(joined.as_str())?);
		},
		None => {},
	}
	Ok(Uri::from_parts(parts)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestMirror {
	pub backend: SimpleBackendReference,
	/// 0.0..=1.0 fraction of requests to mirror.
	pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DirectResponse {
	#[serde(default)]
	pub body: Strng,
	#[serde(default = "default_direct_status", with = "status_serde")]
	pub status: StatusCode,
}

fn default_direct_status() -> StatusCode {
	StatusCode::OK
}

impl DirectResponse {
	pub fn apply(&self) -> Response {
		::http::Response::builder()
			.status(self.status)
			.body(crate::http::Body::from(self.body.to_string()))
			.expect("static response must build")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn req(path: &str) -> Request {
		::http::Request::builder()
			.uri(format!("http://example.com{path}"))
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn header_modifier() {
		let hm = HeaderModifier {
			add: vec![("x-a".into(), "1".into())],
			set: vec![("x-b".into(), "2".into())],
			remove: vec!["x-c".into()],
		};
		let mut headers = HeaderMap::new();
		headers.insert("x-c", "gone".parse().unwrap());
		hm.apply(&mut headers).unwrap();
		assert_eq!(headers.get("x-a").unwrap(), "1");
		assert_eq!(headers.get("x-b").unwrap(), "2");
		assert!(headers.get("x-c").is_none());
	}

	#[test]
	fn prefix_rewrite_replaces_matched_prefix() {
		let mut r = req("/api/v1/users?id=3");
		r.extensions_mut()
			.insert(PathMatch::PathPrefix("/api".into()));
		let rw = UrlRewrite {
			authority: None,
			path: Some(PathRedirect::Prefix("/internal".into())),
		};
		rw.apply(&mut r).unwrap();
		assert_eq!(r.uri().path_and_query().unwrap(), "/internal/v1/users?id=3");
	}

	#[test]
	fn redirect_builds_location() {
		let r = req("/old");
		let rr = RequestRedirect {
			scheme: Some("https".into()),
			authority: Some(HostRedirect::Host("new.example.com".into())),
			path: Some(PathRedirect::Full("/new".into())),
			status: StatusCode::MOVED_PERMANENTLY,
		};
		let out = rr.apply(&r).unwrap();
		let resp = out.direct_response.unwrap();
		assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
		assert_eq!(
			resp.headers().get(::http::header::LOCATION).unwrap(),
			"https://new.example.com/new"
		);
	}
}
