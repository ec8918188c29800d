pub mod gateway;
pub mod httpproxy;
pub mod tcpproxy;

use std::sync::Arc;

use crate::http::{Response, StatusCode};
use crate::store::Snapshot;
use crate::types::agent::{Backend, BackendReference, SimpleBackend, SimpleBackendReference};
use crate::ProxyInputs;

/// Everything that can go wrong handling a request, mapped onto HTTP per the
/// error taxonomy: auth problems are 4xx, dial problems 502/503, timeouts
/// 504, bugs 500.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("bind not found")]
	BindNotFound,
	#[error("listener not found")]
	ListenerNotFound,
	#[error("route not found")]
	RouteNotFound,
	#[error("no valid backends")]
	NoValidBackends,
	#[error("backend does not exist")]
	BackendDoesNotExist,
	#[error("invalid request")]
	InvalidRequest,
	#[error("authentication failure")]
	AuthenticationFailure(StatusCode),
	#[error("jwt authentication failure: {0}")]
	JwtAuthenticationFailure(#[from] crate::http::jwt::TokenError),
	#[error("authorization failed")]
	AuthorizationFailed,
	#[error("csrf validation failed")]
	CsrfValidationFailed,
	#[error("rate limit exceeded")]
	RateLimitExceeded,
	#[error("backend authentication failed: {0}")]
	BackendAuthenticationFailed(anyhow::Error),
	#[error("transformation failed: {0}")]
	TransformationFailed(#[from] crate::http::transformation::Error),
	#[error("dns resolution failed")]
	DnsResolution,
	#[error("dial failed: {0}")]
	DialFailed(String),
	#[error("upstream call failed: {0}")]
	UpstreamCallFailed(String),
	#[error("request timed out")]
	RequestTimeout,
	#[error("upgrade failed")]
	UpgradeFailed,
	#[error("processing failed: {0}")]
	Processing(#[source] anyhow::Error),
	#[error("processing failed: {0}")]
	ProcessingString(String),
}

impl From<crate::http::filters::Error> for ProxyError {
	fn from(value: crate::http::filters::Error) -> Self {
		ProxyError::Processing(value.into())
	}
}

impl From<crate::store::ResolveError> for ProxyError {
	fn from(_: crate::store::ResolveError) -> Self {
		ProxyError::BackendDoesNotExist
	}
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		use ProxyError::*;
		match self {
			RouteNotFound => StatusCode::NOT_FOUND,
			InvalidRequest => StatusCode::BAD_REQUEST,
			AuthenticationFailure(code) => *code,
			JwtAuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
			AuthorizationFailed | CsrfValidationFailed => StatusCode::FORBIDDEN,
			RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
			NoValidBackends | BackendDoesNotExist | DnsResolution | DialFailed(_) => {
				StatusCode::SERVICE_UNAVAILABLE
			},
			UpstreamCallFailed(_) | UpgradeFailed => StatusCode::BAD_GATEWAY,
			RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
			BindNotFound | ListenerNotFound | BackendAuthenticationFailed(_)
			| TransformationFailed(_) | Processing(_) | ProcessingString(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}

	/// Retry only failures that happened before the upstream could have
	/// observed side effects.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ProxyError::DialFailed(_)
				| ProxyError::DnsResolution
				| ProxyError::UpstreamCallFailed(_)
		)
	}

	pub fn as_reason(&self) -> ProxyResponseReason {
		use ProxyError::*;
		match self {
			RouteNotFound => ProxyResponseReason::RouteNotFound,
			AuthenticationFailure(_) | JwtAuthenticationFailure(_) => {
				ProxyResponseReason::AuthenticationFailure
			},
			AuthorizationFailed | CsrfValidationFailed => ProxyResponseReason::PolicyDenied,
			RateLimitExceeded => ProxyResponseReason::RateLimited,
			NoValidBackends | BackendDoesNotExist => ProxyResponseReason::NoBackend,
			DnsResolution | DialFailed(_) | UpstreamCallFailed(_) => {
				ProxyResponseReason::UpstreamFailure
			},
			RequestTimeout => ProxyResponseReason::Timeout,
			_ => ProxyResponseReason::Internal,
		}
	}

	pub fn into_response(self) -> Response {
		let status = self.status();
		::http::Response::builder()
			.status(status)
			.header(crate::http::header::CONTENT_TYPE, "text/plain")
			.body(crate::http::Body::from(format!("{self}\n")))
			.expect("static response must build")
	}
}

/// The classification of how a request concluded, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyResponseReason {
	Upstream,
	DirectResponse,
	RouteNotFound,
	AuthenticationFailure,
	PolicyDenied,
	RateLimited,
	NoBackend,
	UpstreamFailure,
	Timeout,
	Cancelled,
	Internal,
}

impl std::fmt::Display for ProxyResponseReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ProxyResponseReason::Upstream => "upstream",
			ProxyResponseReason::DirectResponse => "direct_response",
			ProxyResponseReason::RouteNotFound => "route_not_found",
			ProxyResponseReason::AuthenticationFailure => "authentication_failure",
			ProxyResponseReason::PolicyDenied => "policy_denied",
			ProxyResponseReason::RateLimited => "rate_limited",
			ProxyResponseReason::NoBackend => "no_backend",
			ProxyResponseReason::UpstreamFailure => "upstream_failure",
			ProxyResponseReason::Timeout => "timeout",
			ProxyResponseReason::Cancelled => "cancelled",
			ProxyResponseReason::Internal => "internal",
		};
		f.write_str(s)
	}
}

/// Either a synthesized error response or a deliberate direct response from a
/// policy; both end the request without dispatch.
#[derive(Debug)]
pub enum ProxyResponse {
	Error(ProxyError),
	DirectResponse(Box<Response>),
}

impl From<ProxyError> for ProxyResponse {
	fn from(e: ProxyError) -> Self {
		ProxyResponse::Error(e)
	}
}

impl ProxyResponse {
	pub fn as_reason(&self) -> ProxyResponseReason {
		match self {
			ProxyResponse::Error(e) => e.as_reason(),
			ProxyResponse::DirectResponse(_) => ProxyResponseReason::DirectResponse,
		}
	}

	pub fn into_response(self) -> Response {
		match self {
			ProxyResponse::Error(e) => e.into_response(),
			ProxyResponse::DirectResponse(r) => *r,
		}
	}
}

pub fn resolve_backend(
	reference: &BackendReference,
	snapshot: &Snapshot,
) -> Result<Backend, ProxyError> {
	Ok(snapshot.resolve_backend(reference)?)
}

pub fn resolve_simple_backend(
	reference: &SimpleBackendReference,
	snapshot: &Snapshot,
) -> Result<SimpleBackend, ProxyError> {
	Ok(snapshot.resolve_simple_backend(reference)?)
}

/// A client for calls made on behalf of policies (webhooks, check services,
/// rate limit services, mirrors). Targets resolve against the current
/// snapshot and reuse the shared upstream pool.
#[derive(Clone)]
pub struct PolicyClient {
	pub inputs: Arc<ProxyInputs>,
}

impl std::fmt::Debug for PolicyClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PolicyClient").finish_non_exhaustive()
	}
}

impl PolicyClient {
	pub async fn call_reference(
		&self,
		mut req: crate::http::Request,
		reference: &SimpleBackendReference,
	) -> Result<Response, ProxyError> {
		let snapshot = self.inputs.store.current();
		let backend = resolve_simple_backend(reference, &snapshot)?;
		crate::http::modify_req_uri(&mut req, |uri| {
			if uri.authority.is_none() {
				uri.authority = Some(crate::http::Authority::try_from(backend.hostport())?);
			}
			if uri.scheme.is_none() {
				uri.scheme = Some(crate::http::Scheme::HTTP);
			}
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
		self.call(req, backend).await
	}

	pub async fn call(
		&self,
		req: crate::http::Request,
		backend: SimpleBackend,
	) -> Result<Response, ProxyError> {
		let snapshot = self.inputs.store.current();
		let policies =
			snapshot.backend_policies(backend.name(), service_key(&backend), &[]);
		let (target, transport) = match &backend {
			SimpleBackend::Service(svc, port) => {
				let ip = svc
					.endpoints
					.first()
					.ok_or(ProxyError::NoValidBackends)?;
				let target_port = svc.ports.get(port).copied().unwrap_or(*port);
				(
					crate::types::agent::Target::Address(std::net::SocketAddr::from((
						*ip,
						target_port,
					))),
					policies.backend_tls.clone().into(),
				)
			},
			SimpleBackend::Opaque(_, target) => {
				(target.clone(), policies.backend_tls.clone().into())
			},
			SimpleBackend::Invalid => return Err(ProxyError::BackendDoesNotExist),
		};
		self
			.inputs
			.upstream
			.call(crate::client::Call {
				req,
				target,
				transport,
			})
			.await
	}

	pub async fn simple_call(&self, req: crate::http::Request) -> Result<Response, ProxyError> {
		self.inputs.upstream.simple_call(req).await
	}
}

fn service_key(backend: &SimpleBackend) -> Option<flowgate_core::strng::Strng> {
	match backend {
		SimpleBackend::Service(svc, _) => Some(svc.namespaced_name()),
		_ => None,
	}
}
