//! The configuration document as users write it, and its conversion into a
//! validated [`Snapshot`]. Partial validity is not a thing: any error
//! rejects the whole document and the previous snapshot stays current.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use flowgate_core::prelude::*;
use serde::Deserialize;

use crate::http::{
	apikey, basicauth, cors, csrf, ext_authz, filters, jwt, localratelimit, remoteratelimit,
	retry, timeout, transformation,
};
use crate::llm;
use crate::mcp;
use crate::store::Snapshot;
use crate::types::agent::*;
use crate::types::frontend;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
	/// Runtime knobs; consumed at boot, not per snapshot.
	#[serde(default)]
	pub config: Option<crate::config::RawConfig>,
	#[serde(default)]
	pub binds: Vec<LocalBind>,
	#[serde(default)]
	pub backends: Vec<LocalNamedBackend>,
	#[serde(default)]
	pub services: Vec<LocalService>,
	#[serde(default)]
	pub policies: Vec<LocalTargetedPolicy>,
	#[serde(default)]
	pub frontend_policies: Vec<LocalFrontendPolicy>,
	/// Workload discovery is produced by the control plane; the engine
	/// accepts and ignores it here.
	#[serde(default)]
	pub workloads: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalBind {
	pub port: u16,
	#[serde(default)]
	pub address: Option<IpAddr>,
	pub listeners: Vec<LocalListener>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalListener {
	#[serde(default)]
	pub name: Option<Strng>,
	#[serde(default)]
	pub gateway_name: Option<Strng>,
	#[serde(default)]
	pub hostname: Option<Strng>,
	#[serde(default)]
	pub protocol: LocalListenerProtocol,
	#[serde(default)]
	pub tls: Option<LocalTLSServer>,
	#[serde(default)]
	pub routes: Vec<LocalRoute>,
	#[serde(default)]
	pub tcp_routes: Vec<LocalTCPRoute>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LocalListenerProtocol {
	#[default]
	HTTP,
	HTTPS,
	TLS,
	TCP,
	HBONE,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalTLSServer {
	pub cert: FileOrInline,
	pub key: FileOrInline,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum FileOrInline {
	File(std::path::PathBuf),
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> anyhow::Result<Vec<u8>> {
		match self {
			FileOrInline::File(path) => {
				std::fs::read(path).with_context(|| format!("reading {}", path.display()))
			},
			FileOrInline::Inline(data) => Ok(data.as_bytes().to_vec()),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRoute {
	#[serde(default)]
	pub name: Option<Strng>,
	#[serde(default)]
	pub rule_name: Option<Strng>,
	#[serde(default)]
	pub hostnames: Vec<Strng>,
	#[serde(default)]
	pub matches: Vec<LocalRouteMatch>,
	#[serde(default)]
	pub policies: Option<LocalPolicySet>,
	#[serde(default)]
	pub backends: Vec<LocalRouteBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalTCPRoute {
	#[serde(default)]
	pub name: Option<Strng>,
	#[serde(default)]
	pub hostnames: Vec<Strng>,
	pub backends: Vec<LocalTCPRouteBackend>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTCPRouteBackend {
	#[serde(default = "default_weight")]
	pub weight: usize,
	#[serde(flatten)]
	pub backend: LocalSimpleBackend,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRouteMatch {
	#[serde(default)]
	pub path: Option<LocalPathMatch>,
	#[serde(default)]
	pub method: Option<Strng>,
	#[serde(default)]
	pub headers: Vec<LocalKeyValueMatch>,
	#[serde(default)]
	pub query: Vec<LocalKeyValueMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalPathMatch {
	Exact(Strng),
	PathPrefix(Strng),
	Regex(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalKeyValueMatch {
	pub name: Strng,
	#[serde(flatten)]
	pub value: LocalValueMatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalValueMatch {
	Exact(Strng),
	Regex(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRouteBackend {
	#[serde(default = "default_weight")]
	pub weight: usize,
	#[serde(flatten)]
	pub backend: LocalBackendSpec,
	#[serde(default)]
	pub policies: Option<LocalPolicySet>,
}

fn default_weight() -> usize {
	1
}

/// The possible backend kinds in a route rule.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalBackendSpec {
	/// hostname:port or ip:port
	Host(Target),
	Service { name: Strng, port: u16 },
	/// A named top-level backend.
	Backend(Strng),
	Mcp(LocalMcpBackend),
	Ai(LocalAIBackend),
	Dynamic {},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalSimpleBackend {
	Host(Target),
	Service { name: Strng, port: u16 },
	Backend(Strng),
}

impl LocalSimpleBackend {
	fn to_reference(&self) -> SimpleBackendReference {
		match self {
			LocalSimpleBackend::Host(t) => SimpleBackendReference::Inline(t.clone()),
			LocalSimpleBackend::Service { name, port } => SimpleBackendReference::Service {
				name: name.clone(),
				port: *port,
			},
			LocalSimpleBackend::Backend(name) => SimpleBackendReference::Backend(name.clone()),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalMcpBackend {
	pub targets: Vec<LocalMcpTarget>,
	#[serde(default = "default_true")]
	pub stateful: bool,
	#[serde(default)]
	pub always_use_prefix: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMcpTarget {
	pub name: Strng,
	#[serde(flatten)]
	pub spec: LocalMcpTargetSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocalMcpTargetSpec {
	Sse {
		#[serde(flatten)]
		backend: LocalSimpleBackend,
		path: String,
	},
	Mcp {
		#[serde(flatten)]
		backend: LocalSimpleBackend,
		path: String,
	},
	Stdio {
		cmd: String,
		#[serde(default)]
		args: Vec<String>,
		#[serde(default)]
		env: HashMap<String, String>,
	},
	Openapi {
		#[serde(flatten)]
		backend: LocalSimpleBackend,
		schema: FileOrInline,
	},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalAIBackend {
	#[serde(default)]
	pub providers: Vec<llm::NamedAIProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNamedBackend {
	pub name: Strng,
	#[serde(flatten)]
	pub spec: LocalBackendSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalService {
	pub name: Strng,
	#[serde(default = "default_namespace")]
	pub namespace: Strng,
	pub hostname: Strng,
	#[serde(default)]
	pub ports: HashMap<u16, u16>,
	#[serde(default)]
	pub endpoints: Vec<IpAddr>,
}

fn default_namespace() -> Strng {
	strng::literal!("default")
}

/// Any policy, in config-file form. Which fields make sense depends on where
/// it attaches; conversion sorts them into traffic vs backend policies.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalPolicySet {
	#[serde(default)]
	pub timeout: Option<timeout::Policy>,
	#[serde(default)]
	pub retry: Option<retry::Policy>,
	#[serde(default)]
	pub cors: Option<cors::Cors>,
	#[serde(default)]
	pub csrf: Option<csrf::Csrf>,
	#[serde(default)]
	pub jwt_auth: Option<jwt::LocalJwtConfig>,
	#[serde(default)]
	pub basic_auth: Option<basicauth::BasicAuthentication>,
	#[serde(default)]
	pub api_key: Option<apikey::APIKeyAuthentication>,
	#[serde(default)]
	pub ext_authz: Option<ext_authz::ExtAuthz>,
	#[serde(default)]
	pub authorization: Option<crate::http::authorization::RuleSet>,
	#[serde(default)]
	pub local_rate_limit: Option<Vec<localratelimit::RateLimit>>,
	#[serde(default)]
	pub remote_rate_limit: Option<remoteratelimit::RemoteRateLimit>,
	#[serde(default)]
	pub transformations: Option<transformation::Transformation>,
	#[serde(default)]
	pub request_header_modifier: Option<filters::HeaderModifier>,
	#[serde(default)]
	pub response_header_modifier: Option<filters::HeaderModifier>,
	#[serde(default)]
	pub request_redirect: Option<filters::RequestRedirect>,
	#[serde(default)]
	pub url_rewrite: Option<filters::UrlRewrite>,
	#[serde(default)]
	pub request_mirror: Option<Vec<filters::RequestMirror>>,
	#[serde(default)]
	pub direct_response: Option<filters::DirectResponse>,
	#[serde(default)]
	pub ai: Option<llm::Policy>,
	#[serde(default)]
	pub a2a: Option<serde_json::Value>,
	#[serde(default)]
	pub backend_tls: Option<crate::http::backendtls::LocalBackendTLS>,
	#[serde(default)]
	pub backend_auth: Option<crate::http::auth::BackendAuth>,
	#[serde(default)]
	pub mcp_authorization: Option<mcp::rbac::McpAuthorization>,
	#[serde(default)]
	pub mcp_authentication: Option<mcp::McpAuthentication>,
}

impl LocalPolicySet {
	fn traffic_policies(&self) -> anyhow::Result<Vec<TrafficPolicy>> {
		let mut out = vec![];
		if let Some(p) = &self.timeout {
			out.push(TrafficPolicy::Timeout(p.clone()));
		}
		if let Some(p) = &self.retry {
			out.push(TrafficPolicy::Retry(p.clone()));
		}
		if let Some(p) = &self.cors {
			out.push(TrafficPolicy::CORS(p.clone()));
		}
		if let Some(p) = &self.csrf {
			out.push(TrafficPolicy::Csrf(p.clone()));
		}
		if let Some(p) = &self.jwt_auth {
			out.push(TrafficPolicy::JwtAuth(p.build()?));
		}
		if let Some(p) = &self.basic_auth {
			out.push(TrafficPolicy::BasicAuth(p.clone()));
		}
		if let Some(p) = &self.api_key {
			out.push(TrafficPolicy::APIKey(p.clone()));
		}
		if let Some(p) = &self.ext_authz {
			out.push(TrafficPolicy::ExtAuthz(p.clone()));
		}
		if let Some(p) = &self.authorization {
			out.push(TrafficPolicy::Authorization(p.clone()));
		}
		if let Some(p) = &self.local_rate_limit {
			out.push(TrafficPolicy::LocalRateLimit(p.clone()));
		}
		if let Some(p) = &self.remote_rate_limit {
			out.push(TrafficPolicy::RemoteRateLimit(p.clone()));
		}
		if let Some(p) = &self.transformations {
			out.push(TrafficPolicy::Transformation(p.clone()));
		}
		if let Some(p) = &self.request_header_modifier {
			out.push(TrafficPolicy::RequestHeaderModifier(p.clone()));
		}
		if let Some(p) = &self.response_header_modifier {
			out.push(TrafficPolicy::ResponseHeaderModifier(p.clone()));
		}
		if let Some(p) = &self.request_redirect {
			out.push(TrafficPolicy::RequestRedirect(p.clone()));
		}
		if let Some(p) = &self.url_rewrite {
			out.push(TrafficPolicy::UrlRewrite(p.clone()));
		}
		if let Some(p) = &self.request_mirror {
			out.push(TrafficPolicy::RequestMirror(p.clone()));
		}
		if let Some(p) = &self.direct_response {
			out.push(TrafficPolicy::DirectResponse(p.clone()));
		}
		if let Some(p) = &self.ai {
			out.push(TrafficPolicy::AI(Arc::new(p.clone())));
		}
		if let Some(m) = &self.mcp_authentication {
			// MCP authentication implies JWT verification against the
			// issuer; the discovery handshake lives in the MCP backend.
			out.push(TrafficPolicy::JwtAuth(m.as_jwt()?));
		}
		Ok(out)
	}

	fn backend_policies(&self) -> anyhow::Result<Vec<BackendPolicy>> {
		let mut out = vec![];
		if let Some(p) = &self.backend_tls {
			out.push(BackendPolicy::BackendTLS(p.build()?));
		}
		if let Some(p) = &self.backend_auth {
			out.push(BackendPolicy::BackendAuth(p.clone()));
		}
		if self.a2a.is_some() {
			out.push(BackendPolicy::A2a {});
		}
		if let Some(p) = &self.ai {
			out.push(BackendPolicy::AI(Arc::new(p.clone())));
		}
		if let Some(p) = &self.mcp_authorization {
			out.push(BackendPolicy::McpAuthorization(p.clone()));
		}
		if let Some(p) = &self.mcp_authentication {
			out.push(BackendPolicy::McpAuthentication(p.clone()));
		}
		if let Some(p) = &self.request_header_modifier {
			out.push(BackendPolicy::RequestHeaderModifier(p.clone()));
		}
		if let Some(p) = &self.response_header_modifier {
			out.push(BackendPolicy::ResponseHeaderModifier(p.clone()));
		}
		Ok(out)
	}

	fn has_short_circuit(&self) -> bool {
		self.direct_response.is_some() || self.request_redirect.is_some()
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTargetedPolicy {
	pub name: Strng,
	pub target: LocalPolicyTarget,
	#[serde(flatten)]
	pub policy: LocalPolicySet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum LocalPolicyTarget {
	Gateway(Strng),
	Listener(Strng),
	Route(Strng),
	RouteRule(Strng),
	Backend(Strng),
	SubBackend(Strng),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalFrontendPolicy {
	pub name: Strng,
	pub gateway: Strng,
	#[serde(default)]
	pub http: Option<frontend::HTTP>,
	#[serde(default)]
	pub tls: Option<frontend::TLS>,
	#[serde(default)]
	pub tcp: Option<frontend::TCP>,
	#[serde(default)]
	pub access_log: Option<frontend::LoggingPolicy>,
}

impl LocalConfig {
	pub fn parse(raw: &str) -> anyhow::Result<LocalConfig> {
		Ok(serde_yaml::from_str(raw)?)
	}

	/// Validate and convert the whole document. Every invariant violation is
	/// an error here, never a partial apply.
	pub fn to_snapshot(&self) -> anyhow::Result<Snapshot> {
		let mut services = HashMap::new();
		for s in &self.services {
			let svc = Arc::new(Service {
				name: s.name.clone(),
				namespace: s.namespace.clone(),
				hostname: s.hostname.clone(),
				ports: s.ports.clone(),
				endpoints: s.endpoints.clone(),
			});
			let key = svc.namespaced_name();
			if services.insert(key.clone(), svc).is_some() {
				bail!("duplicate service {key}");
			}
		}

		let mut backends: HashMap<BackendName, Arc<Backend>> = HashMap::new();
		for b in &self.backends {
			let backend = self.build_backend(&b.name, &b.spec, &services)?;
			if backends.insert(b.name.clone(), Arc::new(backend)).is_some() {
				bail!("duplicate backend {}", b.name);
			}
		}

		let mut policies: Vec<Arc<TargetedPolicy>> = vec![];
		let mut binds = vec![];
		let mut seen_addrs: std::collections::HashSet<SocketAddr> = Default::default();
		for (bind_idx, b) in self.binds.iter().enumerate() {
			let address = SocketAddr::new(
				b.address.unwrap_or(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
				b.port,
			);
			if !seen_addrs.insert(address) {
				bail!("duplicate bind address {address}");
			}
			let bind_name: BindName = strng::format!("bind/{}", b.port);
			let mut listeners = vec![];
			for (listener_idx, l) in b.listeners.iter().enumerate() {
				let listener = self.build_listener(
					&bind_name,
					bind_idx,
					listener_idx,
					l,
					&services,
					&mut backends,
					&mut policies,
				)?;
				listeners.push(listener);
			}
			validate_listener_protocols(&listeners)?;
			binds.push(Arc::new(Bind {
				key: bind_name,
				address,
				listeners: ListenerSet::from_list(listeners),
			}));
		}

		// Targeted policies resolve after the tree exists so invariants on
		// their targets can be checked.
		for p in &self.policies {
			let converted = self.convert_targeted(p, &binds, &backends)?;
			policies.push(Arc::new(converted));
		}
		for f in &self.frontend_policies {
			for (suffix, policy) in [
				("http", f.http.clone().map(FrontendPolicy::HTTP)),
				("tls", f.tls.clone().map(FrontendPolicy::TLS)),
				("tcp", f.tcp.clone().map(FrontendPolicy::TCP)),
				(
					"accessLog",
					f.access_log.clone().map(FrontendPolicy::AccessLog),
				),
			] {
				if let Some(policy) = policy {
					policies.push(Arc::new(TargetedPolicy {
						name: strng::format!("{}/{suffix}", f.name),
						target: PolicyTarget::Gateway(f.gateway.clone()),
						policy: PolicyType::Frontend(policy),
					}));
				}
			}
		}

		Ok(Snapshot {
			generation: 0,
			binds,
			backends,
			services,
			policies,
		})
	}

	#[allow(clippy::too_many_arguments)]
	fn build_listener(
		&self,
		bind_name: &BindName,
		bind_idx: usize,
		listener_idx: usize,
		l: &LocalListener,
		services: &HashMap<Strng, Arc<Service>>,
		backends: &mut HashMap<BackendName, Arc<Backend>>,
		policies: &mut Vec<Arc<TargetedPolicy>>,
	) -> anyhow::Result<Listener> {
		let name = l
			.name
			.clone()
			.unwrap_or_else(|| strng::format!("listener-{bind_idx}-{listener_idx}"));
		let key: ListenerKey = strng::format!("{bind_name}/{name}");
		let gateway_name = l.gateway_name.clone().unwrap_or(strng::literal!("gateway"));

		let tls = l
			.tls
			.as_ref()
			.map(|t| build_server_tls(t))
			.transpose()
			.with_context(|| format!("listener {name}"))?;
		let protocol = match l.protocol {
			LocalListenerProtocol::HTTP => ListenerProtocol::HTTP,
			LocalListenerProtocol::HTTPS => ListenerProtocol::HTTPS(
				tls.ok_or_else(|| anyhow!("HTTPS listener {name} requires tls cert/key"))?,
			),
			LocalListenerProtocol::TLS => ListenerProtocol::TLS(tls),
			LocalListenerProtocol::TCP => ListenerProtocol::TCP,
			LocalListenerProtocol::HBONE => ListenerProtocol::HBONE,
		};

		let mut routes = vec![];
		for (route_idx, r) in l.routes.iter().enumerate() {
			let route = self.build_route(&key, route_idx, r, services, backends, policies)?;
			routes.push(route);
		}
		let mut tcp_routes = vec![];
		for (idx, r) in l.tcp_routes.iter().enumerate() {
			let route_name = r
				.name
				.clone()
				.unwrap_or_else(|| strng::format!("tcp-{idx}"));
			for be in &r.backends {
				validate_simple_reference(&be.backend.to_reference(), services, backends)?;
			}
			tcp_routes.push(TCPRoute {
				key: strng::format!("{key}/{route_name}"),
				route_name,
				hostnames: r.hostnames.clone(),
				backends: r
					.backends
					.iter()
					.map(|b| {
						Ok(TCPRouteBackend {
							weight: b.weight,
							backend: b.backend.to_reference(),
						})
					})
					.collect::<anyhow::Result<Vec<_>>>()?,
			});
		}

		Ok(Listener {
			key,
			name,
			gateway_name,
			hostname: l.hostname.clone().unwrap_or_default(),
			protocol,
			routes: RouteSet::from_list(routes),
			tcp_routes,
		})
	}

	fn build_route(
		&self,
		listener_key: &ListenerKey,
		route_idx: usize,
		r: &LocalRoute,
		services: &HashMap<Strng, Arc<Service>>,
		backends: &mut HashMap<BackendName, Arc<Backend>>,
		policies: &mut Vec<Arc<TargetedPolicy>>,
	) -> anyhow::Result<Route> {
		let route_name = r
			.name
			.clone()
			.unwrap_or_else(|| strng::format!("route-{route_idx}"));
		let key: RouteKey = strng::format!("{listener_key}/{route_name}");

		let matches = r
			.matches
			.iter()
			.map(build_match)
			.collect::<anyhow::Result<Vec<_>>>()
			.with_context(|| format!("route {route_name}"))?;

		let inline_policies = match &r.policies {
			Some(p) => p.traffic_policies()?,
			None => vec![],
		};

		let mut refs = vec![];
		for (backend_idx, be) in r.backends.iter().enumerate() {
			let inline_backend_policies = match &be.policies {
				Some(p) => p.backend_policies()?,
				None => vec![],
			};
			let reference = match &be.backend {
				LocalBackendSpec::Host(t) => {
					let name: BackendName = t.to_string().into();
					backends
						.entry(name.clone())
						.or_insert_with(|| Arc::new(Backend::Opaque(name.clone(), t.clone())));
					BackendReference::Backend(name)
				},
				LocalBackendSpec::Service { name, port } => {
					let svc_key = service_key(name);
					if !services.contains_key(&svc_key) {
						bail!("route {route_name}: service {name} does not exist");
					}
					BackendReference::Service {
						name: svc_key,
						port: *port,
					}
				},
				LocalBackendSpec::Backend(name) => {
					if !backends.contains_key(name) {
						bail!("route {route_name}: backend {name} does not exist");
					}
					BackendReference::Backend(name.clone())
				},
				LocalBackendSpec::Dynamic {} => BackendReference::Dynamic {},
				spec @ (LocalBackendSpec::Mcp(_) | LocalBackendSpec::Ai(_)) => {
					// Inline agent backends get a synthesized name and become
					// regular named backends in the snapshot.
					let name: BackendName = strng::format!("{key}/backend-{backend_idx}");
					let backend = self.build_backend(&name, spec, services)?;
					backends.insert(name.clone(), Arc::new(backend));
					BackendReference::Backend(name)
				},
			};
			refs.push(RouteBackendReference {
				weight: be.weight,
				backend: reference,
				inline_policies: inline_backend_policies,
			});
		}

		if refs.is_empty() {
			let short_circuits = r
				.policies
				.as_ref()
				.map(|p| p.has_short_circuit())
				.unwrap_or(false);
			if !short_circuits {
				bail!(
					"route {route_name} has no backends and no direct response or redirect policy"
				);
			}
		}

		// Attachable policy names line up with what PolicyTarget expects.
		if let Some(p) = &r.policies {
			for bp in p.backend_policies()? {
				// Backend policies on a route apply to each referenced
				// backend.
				for be in &refs {
					policies.push(Arc::new(TargetedPolicy {
						name: strng::format!("{key}/inline"),
						target: PolicyTarget::Backend(be.backend.name()),
						policy: PolicyType::Backend(bp.clone()),
					}));
				}
			}
		}

		Ok(Route {
			key,
			route_name,
			rule_name: r.rule_name.clone(),
			hostnames: r.hostnames.clone(),
			matches,
			backends: refs,
			inline_policies,
		})
	}

	fn build_backend(
		&self,
		name: &BackendName,
		spec: &LocalBackendSpec,
		services: &HashMap<Strng, Arc<Service>>,
	) -> anyhow::Result<Backend> {
		Ok(match spec {
			LocalBackendSpec::Host(t) => Backend::Opaque(name.clone(), t.clone()),
			LocalBackendSpec::Service { name: svc, port } => {
				let key = service_key(svc);
				let svc = services
					.get(&key)
					.ok_or_else(|| anyhow!("service {key} does not exist"))?;
				Backend::Service(svc.clone(), *port)
			},
			LocalBackendSpec::Backend(other) => {
				bail!("backend {name} cannot reference another backend ({other})")
			},
			LocalBackendSpec::Dynamic {} => Backend::Dynamic {},
			LocalBackendSpec::Mcp(m) => {
				let targets = m
					.targets
					.iter()
					.map(|t| {
						let spec = match &t.spec {
							LocalMcpTargetSpec::Sse { backend, path } => McpTargetSpec::Sse {
								backend: backend.to_reference(),
								path: path.clone(),
							},
							LocalMcpTargetSpec::Mcp { backend, path } => {
								McpTargetSpec::Streamable {
									backend: backend.to_reference(),
									path: path.clone(),
								}
							},
							LocalMcpTargetSpec::Stdio { cmd, args, env } => {
								McpTargetSpec::Stdio {
									cmd: cmd.clone(),
									args: args.clone(),
									env: env.clone(),
								}
							},
							LocalMcpTargetSpec::Openapi { backend, schema } => {
								let raw = schema.load()?;
								let parsed: openapiv3::OpenAPI =
									serde_yaml::from_slice(&raw).with_context(|| {
										format!("openapi schema for target {}", t.name)
									})?;
								McpTargetSpec::OpenAPI {
									backend: backend.to_reference(),
									schema: Arc::new(parsed),
								}
							},
						};
						Ok(Arc::new(McpTarget {
							name: t.name.clone(),
							spec,
						}))
					})
					.collect::<anyhow::Result<Vec<_>>>()?;
				let mut seen = std::collections::HashSet::new();
				for t in &targets {
					if !seen.insert(t.name.clone()) {
						bail!("mcp backend {name}: duplicate target {}", t.name);
					}
				}
				Backend::MCP(
					name.clone(),
					McpBackend {
						targets,
						stateful: m.stateful,
						always_use_prefix: m.always_use_prefix,
					},
				)
			},
			LocalBackendSpec::Ai(a) => {
				if a.providers.is_empty() {
					bail!("ai backend {name} has no providers");
				}
				Backend::AI(
					name.clone(),
					llm::AIBackend {
						providers: a.providers.iter().cloned().map(Arc::new).collect(),
					},
				)
			},
		})
	}

	fn convert_targeted(
		&self,
		p: &LocalTargetedPolicy,
		binds: &[Arc<Bind>],
		backends: &HashMap<BackendName, Arc<Backend>>,
	) -> anyhow::Result<TargetedPolicy> {
		let target = match &p.target {
			LocalPolicyTarget::Gateway(g) => PolicyTarget::Gateway(g.clone()),
			LocalPolicyTarget::Listener(l) => {
				let found = binds
					.iter()
					.flat_map(|b| b.listeners.iter())
					.any(|ls| ls.key == *l || ls.name == *l);
				if !found {
					bail!("policy {}: listener {l} does not exist", p.name);
				}
				PolicyTarget::Listener(l.clone())
			},
			LocalPolicyTarget::Route(r) => {
				let found = binds
					.iter()
					.flat_map(|b| b.listeners.iter())
					.flat_map(|ls| ls.routes.iter())
					.any(|route| route.route_name == *r);
				if !found {
					bail!("policy {}: route {r} does not exist", p.name);
				}
				PolicyTarget::Route(r.clone())
			},
			LocalPolicyTarget::RouteRule(r) => PolicyTarget::RouteRule(r.clone()),
			LocalPolicyTarget::Backend(b) => {
				if !backends.contains_key(b) {
					bail!("policy {}: backend {b} does not exist", p.name);
				}
				PolicyTarget::Backend(b.clone())
			},
			LocalPolicyTarget::SubBackend(s) => PolicyTarget::SubBackend(s.clone()),
		};

		// A targeted policy entry holds exactly one policy.
		let mut traffic = p.policy.traffic_policies()?;
		let mut backend_pols = p.policy.backend_policies()?;
		let policy = match (traffic.len(), backend_pols.len()) {
			(1, 0) => PolicyType::Traffic(traffic.remove(0)),
			(0, 1) => PolicyType::Backend(backend_pols.remove(0)),
			// `ai` converts to both forms; attachment decides.
			(1, 1) if matches!(target, PolicyTarget::Backend(_) | PolicyTarget::SubBackend(_)) => {
				PolicyType::Backend(backend_pols.remove(0))
			},
			(1, 1) => PolicyType::Traffic(traffic.remove(0)),
			(0, 0) => bail!("policy {} is empty", p.name),
			_ => bail!("policy {} must contain exactly one policy", p.name),
		};
		Ok(TargetedPolicy {
			name: p.name.clone(),
			target,
			policy,
		})
	}
}

fn service_key(name: &Strng) -> Strng {
	if name.contains('/') {
		name.clone()
	} else {
		strng::format!("default/{name}")
	}
}

fn validate_simple_reference(
	reference: &SimpleBackendReference,
	services: &HashMap<Strng, Arc<Service>>,
	backends: &HashMap<BackendName, Arc<Backend>>,
) -> anyhow::Result<()> {
	match reference {
		SimpleBackendReference::Service { name, .. } => {
			if !services.contains_key(name) {
				bail!("service {name} does not exist");
			}
		},
		SimpleBackendReference::Backend(name) => {
			if !backends.contains_key(name) {
				bail!("backend {name} does not exist");
			}
		},
		SimpleBackendReference::Inline(_) | SimpleBackendReference::Invalid => {},
	}
	Ok(())
}

fn validate_listener_protocols(listeners: &[Listener]) -> anyhow::Result<()> {
	// A bind serves one wire protocol; listeners may differ only in ways the
	// demultiplexer can distinguish (SNI/Host).
	let has = |f: fn(&ListenerProtocol) -> bool| listeners.iter().any(|l| f(&l.protocol));
	let http = has(|p| matches!(p, ListenerProtocol::HTTP));
	let tcp = has(|p| matches!(p, ListenerProtocol::TCP));
	let tls_family = has(|p| {
		matches!(
			p,
			ListenerProtocol::HTTPS(_) | ListenerProtocol::TLS(_)
		)
	});
	if http && tcp {
		bail!("a bind cannot mix HTTP and TCP listeners");
	}
	if tcp && tls_family {
		bail!("a bind cannot mix TCP and TLS listeners");
	}
	Ok(())
}

fn build_match(m: &LocalRouteMatch) -> anyhow::Result<RouteMatch> {
	let path = match &m.path {
		None => PathMatch::PathPrefix(strng::literal!("/")),
		Some(LocalPathMatch::Exact(p)) => PathMatch::Exact(p.clone()),
		Some(LocalPathMatch::PathPrefix(p)) => PathMatch::PathPrefix(p.clone()),
		Some(LocalPathMatch::Regex(r)) => {
			PathMatch::Regex(regex::Regex::new(r)?, r.len())
		},
	};
	let value = |v: &LocalValueMatch| -> anyhow::Result<ValueMatch> {
		Ok(match v {
			LocalValueMatch::Exact(e) => ValueMatch::Exact(e.clone()),
			LocalValueMatch::Regex(r) => ValueMatch::Regex(regex::Regex::new(r)?),
		})
	};
	Ok(RouteMatch {
		path,
		method: m.method.clone(),
		headers: m
			.headers
			.iter()
			.map(|h| {
				Ok(HeaderMatch {
					name: h.name.clone(),
					value: value(&h.value)?,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?,
		query: m
			.query
			.iter()
			.map(|q| {
				Ok(QueryMatch {
					name: q.name.clone(),
					value: value(&q.value)?,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?,
	})
}

fn build_server_tls(t: &LocalTLSServer) -> anyhow::Result<ServerTLSConfig> {
	let certs = parse_cert(&t.cert.load()?)?;
	let key = parse_key(&t.key.load()?)?;
	if certs.is_empty() {
		bail!("tls cert bundle is empty");
	}
	let mut config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(ServerTLSConfig::new(Arc::new(config)))
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
