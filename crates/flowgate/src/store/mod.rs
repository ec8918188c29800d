//! The configuration snapshot store.
//!
//! The runtime holds exactly one current [`Snapshot`], swapped atomically on
//! update. In-flight requests keep `Arc`s into the snapshot they started
//! with; an old snapshot is freed when its last request completes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use flowgate_core::prelude::*;
use serde::Serialize;
use tokio::sync::watch;

use crate::http::{
	apikey, auth, authorization, backendtls, basicauth, cors, csrf, ext_authz, filters, jwt,
	localratelimit, remoteratelimit, retry, timeout, transformation,
};
use crate::llm;
use crate::mcp;
use crate::types::agent::{
	Backend, BackendName, BackendPolicy, BackendReference, Bind, BindName, FrontendPolicy,
	GatewayName, ListenerKey, PolicyTarget, PolicyType, RouteName, RouteRuleName, Service,
	SimpleBackend, SimpleBackendReference, TargetedPolicy, TrafficPolicy,
};
use crate::types::frontend;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
	pub generation: u64,
	pub binds: Vec<Arc<Bind>>,
	pub backends: HashMap<BackendName, Arc<Backend>>,
	/// Keyed by `namespace/hostname`.
	pub services: HashMap<Strng, Arc<Service>>,
	pub policies: Vec<Arc<TargetedPolicy>>,
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
	#[error("backend {0} does not exist")]
	BackendNotFound(BackendName),
	#[error("service {0} does not exist")]
	ServiceNotFound(Strng),
}

impl Snapshot {
	pub fn bind(&self, name: &BindName) -> Option<Arc<Bind>> {
		self.binds.iter().find(|b| &b.key == name).cloned()
	}

	pub fn resolve_backend(&self, reference: &BackendReference) -> Result<Backend, ResolveError> {
		match reference {
			BackendReference::Service { name, port } => {
				let svc = self
					.services
					.get(name)
					.ok_or_else(|| ResolveError::ServiceNotFound(name.clone()))?;
				Ok(Backend::Service(svc.clone(), *port))
			},
			BackendReference::Backend(name) => self
				.backends
				.get(name)
				.map(|b| b.as_ref().clone())
				.ok_or_else(|| ResolveError::BackendNotFound(name.clone())),
			BackendReference::Dynamic {} => Ok(Backend::Dynamic {}),
			BackendReference::Invalid => Ok(Backend::Invalid),
		}
	}

	pub fn resolve_simple_backend(
		&self,
		reference: &SimpleBackendReference,
	) -> Result<SimpleBackend, ResolveError> {
		match reference {
			SimpleBackendReference::Service { name, port } => {
				let svc = self
					.services
					.get(name)
					.ok_or_else(|| ResolveError::ServiceNotFound(name.clone()))?;
				Ok(SimpleBackend::Service(svc.clone(), *port))
			},
			SimpleBackendReference::Backend(name) => {
				match self.backends.get(name).map(|b| b.as_ref()) {
					Some(Backend::Opaque(n, t)) => Ok(SimpleBackend::Opaque(n.clone(), t.clone())),
					Some(Backend::Service(s, p)) => Ok(SimpleBackend::Service(s.clone(), *p)),
					Some(_) | None => Err(ResolveError::BackendNotFound(name.clone())),
				}
			},
			SimpleBackendReference::Inline(target) => Ok(SimpleBackend::Opaque(
				target.to_string().into(),
				target.clone(),
			)),
			SimpleBackendReference::Invalid => Ok(SimpleBackend::Invalid),
		}
	}

	fn traffic_policies_for(&self, target: &PolicyTarget) -> impl Iterator<Item = &TrafficPolicy> {
		self.policies.iter().filter_map(move |p| match &p.policy {
			PolicyType::Traffic(t) if &p.target == target => Some(t),
			_ => None,
		})
	}

	fn backend_policies_for(&self, target: &PolicyTarget) -> impl Iterator<Item = &BackendPolicy> {
		self.policies.iter().filter_map(move |p| match &p.policy {
			PolicyType::Backend(b) if &p.target == target => Some(b),
			_ => None,
		})
	}

	pub fn frontend_policies(&self, gateway: GatewayName) -> FrontendPolicies {
		let mut out = FrontendPolicies::default();
		for p in self.policies.iter() {
			if p.target != PolicyTarget::Gateway(gateway.clone()) {
				continue;
			}
			if let PolicyType::Frontend(f) = &p.policy {
				match f {
					FrontendPolicy::HTTP(h) => out.http = Some(h.clone()),
					FrontendPolicy::TLS(t) => out.tls = Some(t.clone()),
					FrontendPolicy::TCP(t) => out.tcp = Some(t.clone()),
					FrontendPolicy::AccessLog(l) => out.access_log = Some(l.clone()),
				}
			}
		}
		out
	}

	/// Policies from the Gateway and Listener phases, applied before route
	/// resolution finishes.
	pub fn gateway_policies(
		&self,
		listener: ListenerKey,
		gateway: GatewayName,
	) -> GatewayPolicies {
		let mut out = GatewayPolicies::default();
		// Gateway first so Listener overrides.
		for target in [
			PolicyTarget::Gateway(gateway),
			PolicyTarget::Listener(listener),
		] {
			for p in self.traffic_policies_for(&target) {
				match p {
					TrafficPolicy::JwtAuth(j) => out.jwt = Some(j.clone()),
					TrafficPolicy::BasicAuth(b) => out.basic_auth = Some(b.clone()),
					TrafficPolicy::APIKey(k) => out.api_key = Some(k.clone()),
					TrafficPolicy::ExtAuthz(x) => out.ext_authz = Some(x.clone()),
					TrafficPolicy::Transformation(t) => out.transformation = Some(t.clone()),
					_ => {},
				}
			}
		}
		out
	}

	/// The full route-phase policy set: Gateway < Listener < Route <
	/// RouteRule < inline, later phases overriding earlier ones field by
	/// field.
	pub fn route_policies(
		&self,
		path: RoutePath,
		inline: &[TrafficPolicy],
	) -> RoutePolicies {
		let mut out = RoutePolicies::default();
		let mut targets = vec![
			PolicyTarget::Gateway(path.gateway),
			PolicyTarget::Listener(path.listener),
			PolicyTarget::Route(path.route),
		];
		if let Some(rule) = path.route_rule {
			targets.push(PolicyTarget::RouteRule(rule));
		}
		for target in &targets {
			for p in self.traffic_policies_for(target) {
				out.absorb(p);
			}
		}
		for p in inline {
			out.absorb(p);
		}
		out
	}

	/// Backend-attached policies, merged with inline (backendRef) policies.
	/// Inline is most specific and wins.
	pub fn backend_policies(
		&self,
		backend: BackendName,
		service: Option<Strng>,
		inline: &[&[BackendPolicy]],
	) -> BackendPolicies {
		let mut out = BackendPolicies::default();
		if let Some(svc) = service {
			for p in self.backend_policies_for(&PolicyTarget::Backend(svc)) {
				out.absorb(p);
			}
		}
		for p in self.backend_policies_for(&PolicyTarget::Backend(backend)) {
			out.absorb(p);
		}
		for set in inline {
			for p in *set {
				out.absorb(p);
			}
		}
		out
	}

	/// Policies for a named sub-backend (`<backend>/<sub>`), e.g. a single
	/// provider within an AI backend.
	pub fn sub_backend_policies(
		&self,
		name: Strng,
		inline: Option<&[BackendPolicy]>,
	) -> BackendPolicies {
		let mut out = BackendPolicies::default();
		for p in self.backend_policies_for(&PolicyTarget::SubBackend(name)) {
			out.absorb(p);
		}
		if let Some(inline) = inline {
			for p in inline {
				out.absorb(p);
			}
		}
		out
	}
}

/// The identity of a selected route, used to look up attached policies.
#[derive(Debug, Clone)]
pub struct RoutePath {
	pub gateway: GatewayName,
	pub listener: ListenerKey,
	pub route: RouteName,
	pub route_rule: Option<RouteRuleName>,
}

#[derive(Debug, Default, Clone)]
pub struct FrontendPolicies {
	pub http: Option<frontend::HTTP>,
	pub tls: Option<frontend::TLS>,
	pub tcp: Option<frontend::TCP>,
	pub access_log: Option<frontend::LoggingPolicy>,
}

impl FrontendPolicies {
	pub fn register_cel_expressions(&self, ctx: &mut crate::cel::ContextBuilder) {
		if let Some(log) = &self.access_log {
			if let Some(f) = &log.filter {
				ctx.register_expression(f);
			}
			for e in log.add.values() {
				ctx.register_expression(e);
			}
		}
	}
}

#[derive(Debug, Default, Clone)]
pub struct GatewayPolicies {
	pub jwt: Option<jwt::Jwt>,
	pub basic_auth: Option<basicauth::BasicAuthentication>,
	pub api_key: Option<apikey::APIKeyAuthentication>,
	pub ext_authz: Option<ext_authz::ExtAuthz>,
	pub transformation: Option<transformation::Transformation>,
}

impl GatewayPolicies {
	pub fn register_cel_expressions(&self, ctx: &mut crate::cel::ContextBuilder) {
		if let Some(t) = &self.transformation {
			for e in t.iter_expressions() {
				ctx.register_expression(e);
			}
		}
	}
}

#[derive(Debug, Default, Clone)]
pub struct RoutePolicies {
	pub jwt: Option<jwt::Jwt>,
	pub basic_auth: Option<basicauth::BasicAuthentication>,
	pub api_key: Option<apikey::APIKeyAuthentication>,
	pub ext_authz: Option<ext_authz::ExtAuthz>,
	pub authorization: Option<authorization::RuleSet>,
	pub local_rate_limit: Vec<localratelimit::RateLimit>,
	pub remote_rate_limit: Option<remoteratelimit::RemoteRateLimit>,
	pub transformation: Option<transformation::Transformation>,
	pub csrf: Option<csrf::Csrf>,
	pub cors: Option<cors::Cors>,
	pub request_header_modifier: Option<filters::HeaderModifier>,
	pub response_header_modifier: Option<filters::HeaderModifier>,
	pub request_redirect: Option<filters::RequestRedirect>,
	pub url_rewrite: Option<filters::UrlRewrite>,
	pub request_mirror: Vec<filters::RequestMirror>,
	pub direct_response: Option<filters::DirectResponse>,
	pub timeout: Option<timeout::Policy>,
	pub retry: Option<retry::Policy>,
	pub llm: Option<Arc<llm::Policy>>,
}

impl RoutePolicies {
	fn absorb(&mut self, p: &TrafficPolicy) {
		match p {
			TrafficPolicy::Timeout(t) => self.timeout = Some(t.clone()),
			TrafficPolicy::Retry(r) => self.retry = Some(r.clone()),
			TrafficPolicy::AI(a) => self.llm = Some(a.clone()),
			TrafficPolicy::Authorization(a) => self.authorization = Some(a.clone()),
			TrafficPolicy::LocalRateLimit(l) => self.local_rate_limit.extend(l.iter().cloned()),
			TrafficPolicy::RemoteRateLimit(r) => self.remote_rate_limit = Some(r.clone()),
			TrafficPolicy::ExtAuthz(x) => self.ext_authz = Some(x.clone()),
			TrafficPolicy::JwtAuth(j) => self.jwt = Some(j.clone()),
			TrafficPolicy::BasicAuth(b) => self.basic_auth = Some(b.clone()),
			TrafficPolicy::APIKey(k) => self.api_key = Some(k.clone()),
			TrafficPolicy::Transformation(t) => self.transformation = Some(t.clone()),
			TrafficPolicy::Csrf(c) => self.csrf = Some(c.clone()),
			TrafficPolicy::CORS(c) => self.cors = Some(c.clone()),
			TrafficPolicy::RequestHeaderModifier(h) => {
				self.request_header_modifier = Some(h.clone())
			},
			TrafficPolicy::ResponseHeaderModifier(h) => {
				self.response_header_modifier = Some(h.clone())
			},
			TrafficPolicy::RequestRedirect(r) => self.request_redirect = Some(r.clone()),
			TrafficPolicy::UrlRewrite(u) => self.url_rewrite = Some(u.clone()),
			TrafficPolicy::RequestMirror(m) => self.request_mirror.extend(m.iter().cloned()),
			TrafficPolicy::DirectResponse(d) => self.direct_response = Some(d.clone()),
		}
	}

	pub fn register_cel_expressions(&self, ctx: &mut crate::cel::ContextBuilder) {
		if let Some(a) = &self.authorization {
			for e in a.iter_expressions() {
				ctx.register_expression(e);
			}
		}
		if let Some(r) = &self.remote_rate_limit {
			for e in r.iter_expressions() {
				ctx.register_expression(e);
			}
		}
		if let Some(t) = &self.transformation {
			for e in t.iter_expressions() {
				ctx.register_expression(e);
			}
		}
	}
}

impl From<RoutePolicies> for LLMRequestPolicies {
	fn from(r: RoutePolicies) -> Self {
		LLMRequestPolicies {
			local_rate_limit: r.local_rate_limit,
			remote_rate_limit: r.remote_rate_limit,
			llm: r.llm,
		}
	}
}

#[derive(Debug, Default, Clone)]
pub struct BackendPolicies {
	pub backend_tls: Option<backendtls::BackendTLS>,
	pub backend_auth: Option<auth::BackendAuth>,
	pub a2a: bool,
	pub llm: Option<Arc<llm::Policy>>,
	/// Set at dispatch when the backend is an AI backend.
	pub llm_provider: Option<Arc<llm::NamedAIProvider>>,
	pub mcp_authorization: Option<mcp::rbac::McpAuthorization>,
	pub mcp_authentication: Option<mcp::McpAuthentication>,
	pub request_header_modifier: Option<filters::HeaderModifier>,
	pub response_header_modifier: Option<filters::HeaderModifier>,
}

impl BackendPolicies {
	fn absorb(&mut self, p: &BackendPolicy) {
		match p {
			BackendPolicy::BackendTLS(t) => self.backend_tls = Some(t.clone()),
			BackendPolicy::BackendAuth(a) => self.backend_auth = Some(a.clone()),
			BackendPolicy::A2a {} => self.a2a = true,
			BackendPolicy::AI(a) => self.llm = Some(a.clone()),
			BackendPolicy::McpAuthorization(m) => self.mcp_authorization = Some(m.clone()),
			BackendPolicy::McpAuthentication(m) => self.mcp_authentication = Some(m.clone()),
			BackendPolicy::RequestHeaderModifier(h) => {
				self.request_header_modifier = Some(h.clone())
			},
			BackendPolicy::ResponseHeaderModifier(h) => {
				self.response_header_modifier = Some(h.clone())
			},
		}
	}

	/// Merge, with `other` (more specific) winning per field.
	pub fn merge(self, other: BackendPolicies) -> BackendPolicies {
		BackendPolicies {
			backend_tls: other.backend_tls.or(self.backend_tls),
			backend_auth: other.backend_auth.or(self.backend_auth),
			a2a: other.a2a || self.a2a,
			llm: other.llm.or(self.llm),
			llm_provider: other.llm_provider.or(self.llm_provider),
			mcp_authorization: other.mcp_authorization.or(self.mcp_authorization),
			mcp_authentication: other.mcp_authentication.or(self.mcp_authentication),
			request_header_modifier: other
				.request_header_modifier
				.or(self.request_header_modifier),
			response_header_modifier: other
				.response_header_modifier
				.or(self.response_header_modifier),
		}
	}
}

/// Rate limit and AI policies relevant to the LLM request path.
#[derive(Debug, Default, Clone)]
pub struct LLMRequestPolicies {
	pub local_rate_limit: Vec<localratelimit::RateLimit>,
	pub remote_rate_limit: Option<remoteratelimit::RemoteRateLimit>,
	pub llm: Option<Arc<llm::Policy>>,
}

impl LLMRequestPolicies {
	/// The backend-attached AI policy wins over the route one.
	pub fn merge_backend_policies(
		self: &Arc<Self>,
		backend_llm: Option<Arc<llm::Policy>>,
	) -> LLMRequestPolicies {
		LLMRequestPolicies {
			local_rate_limit: self.local_rate_limit.clone(),
			remote_rate_limit: self.remote_rate_limit.clone(),
			llm: backend_llm.or_else(|| self.llm.clone()),
		}
	}
}

/// What the LLM response path needs to true up accounting and guard output.
#[derive(Debug, Default)]
pub struct LLMResponsePolicies {
	pub local_rate_limit: Vec<localratelimit::RateLimit>,
	pub remote_rate_limit: Option<remoteratelimit::AmendHandle>,
	pub prompt_guard: Option<llm::policy::ResponseGuard>,
}

/// The store itself: one atomically swapped snapshot plus a change feed.
#[derive(Debug)]
pub struct Store {
	current: ArcSwap<Snapshot>,
	tx: watch::Sender<Arc<Snapshot>>,
}

impl Default for Store {
	fn default() -> Self {
		Self::new()
	}
}

impl Store {
	pub fn new() -> Store {
		let initial = Arc::new(Snapshot::default());
		let (tx, _) = watch::channel(initial.clone());
		Store {
			current: ArcSwap::new(initial),
			tx,
		}
	}

	/// Lock-free read of the current snapshot.
	pub fn current(&self) -> Arc<Snapshot> {
		self.current.load_full()
	}

	/// Whether any snapshot (beyond the empty boot state) was installed.
	pub fn ready(&self) -> bool {
		self.current.load().generation > 0
	}

	/// Validation happened at construction; replace is the atomic publish.
	pub fn replace(&self, mut snapshot: Snapshot) {
		snapshot.generation = self.current.load().generation + 1;
		let snapshot = Arc::new(snapshot);
		self.current.store(snapshot.clone());
		let _ = self.tx.send(snapshot);
	}

	pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
		self.tx.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::agent::Target;

	fn policy(name: &str, target: PolicyTarget, policy: PolicyType) -> Arc<TargetedPolicy> {
		Arc::new(TargetedPolicy {
			name: name.into(),
			target,
			policy,
		})
	}

	#[test]
	fn snapshot_swap_is_observed_by_new_reads_only() {
		let store = Store::new();
		let old = store.current();
		store.replace(Snapshot::default());
		let new = store.current();
		assert_eq!(old.generation, 0);
		assert_eq!(new.generation, 1);
		// The old snapshot is still usable by in-flight requests.
		assert!(old.binds.is_empty());
	}

	#[test]
	fn route_rule_overrides_route_policy() {
		let mk_timeout = |secs| {
			PolicyType::Traffic(TrafficPolicy::Timeout(timeout::Policy {
				request: Some(std::time::Duration::from_secs(secs)),
				backend_request: None,
			}))
		};
		let snap = Snapshot {
			policies: vec![
				policy("route", PolicyTarget::Route("r".into()), mk_timeout(10)),
				policy(
					"rule",
					PolicyTarget::RouteRule("r/rule".into()),
					mk_timeout(1),
				),
			],
			..Default::default()
		};
		let rp = snap.route_policies(
			RoutePath {
				gateway: "gw".into(),
				listener: "l".into(),
				route: "r".into(),
				route_rule: Some("r/rule".into()),
			},
			&[],
		);
		assert_eq!(
			rp.timeout.unwrap().request,
			Some(std::time::Duration::from_secs(1))
		);
	}

	#[test]
	fn backend_resolution() {
		let mut backends = HashMap::new();
		backends.insert(
			Strng::from("b1"),
			Arc::new(Backend::Opaque(
				"b1".into(),
				Target::try_from("example.com:80").unwrap(),
			)),
		);
		let snap = Snapshot {
			backends,
			..Default::default()
		};
		assert!(snap
			.resolve_backend(&BackendReference::Backend("b1".into()))
			.is_ok());
		assert!(matches!(
			snap.resolve_backend(&BackendReference::Backend("missing".into())),
			Err(ResolveError::BackendNotFound(_))
		));
	}
}
