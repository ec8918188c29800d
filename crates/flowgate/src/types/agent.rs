//! The runtime configuration model. Built from the config document by
//! `types::local`, immutable once published in a snapshot.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Display;
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use flowgate_core::prelude::*;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize, Serializer};
use tracing::trace;

use crate::cel;
use crate::http::{auth::BackendAuth, authorization::RuleSet, filters, remoteratelimit, retry, timeout};
use crate::llm;
use crate::mcp::rbac::McpAuthorization;
use crate::mcp::McpAuthentication;
use crate::types::frontend;

pub type BindName = Strng;
pub type GatewayName = Strng;
pub type ListenerKey = Strng;
pub type ListenerName = Strng;
pub type RouteKey = Strng;
pub type RouteName = Strng;
pub type RouteRuleName = Strng;
pub type BackendName = Strng;
pub type PolicyName = Strng;
pub type McpTargetName = Strng;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
	pub key: BindName,
	pub address: SocketAddr,
	pub listeners: ListenerSet,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
	pub key: ListenerKey,
	pub name: ListenerName,
	pub gateway_name: GatewayName,
	/// May be empty or a wildcard.
	pub hostname: Strng,
	pub protocol: ListenerProtocol,
	pub routes: RouteSet,
	pub tcp_routes: Vec<TCPRoute>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ListenerProtocol {
	HTTP,
	/// Terminate TLS, then serve HTTP.
	HTTPS(ServerTLSConfig),
	/// TLS termination (Some) or SNI passthrough (None), then a TCP route.
	TLS(Option<ServerTLSConfig>),
	TCP,
	HBONE,
}

impl ListenerProtocol {
	pub fn tls(&self, alpn: Option<&[Vec<u8>]>) -> Option<Arc<ServerConfig>> {
		match self {
			ListenerProtocol::HTTPS(c) => Some(c.config_for(alpn)),
			ListenerProtocol::TLS(Some(c)) => Some(c.config_for(alpn)),
			_ => None,
		}
	}
}

/// Protocol of an entire bind, used as a metric label. All listeners on a
/// bind share a wire protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, prometheus_client::encoding::EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum BindProtocol {
	http,
	https,
	tls,
	tcp,
	hbone,
}

#[derive(Debug, Clone)]
pub struct ServerTLSConfig {
	base: Arc<ServerConfig>,
	per_alpn: Arc<std::sync::RwLock<HashMap<Vec<Vec<u8>>, Arc<ServerConfig>>>>,
}

impl ServerTLSConfig {
	pub fn new(base: Arc<ServerConfig>) -> Self {
		ServerTLSConfig {
			base,
			per_alpn: Arc::new(Default::default()),
		}
	}

	/// The server config with the given ALPN list applied, cached per list.
	pub fn config_for(&self, alpn: Option<&[Vec<u8>]>) -> Arc<ServerConfig> {
		let Some(alpn) = alpn else {
			return self.base.clone();
		};
		if let Some(cached) = self.per_alpn.read().expect("alpn cache").get(alpn) {
			return cached.clone();
		}
		let mut writer = self.per_alpn.write().expect("alpn cache");
		if let Some(cached) = writer.get(alpn) {
			return cached.clone();
		}
		let mut cfg = self.base.as_ref().clone();
		cfg.alpn_protocols = alpn.to_vec();
		let cfg = Arc::new(cfg);
		writer.insert(alpn.to_vec(), cfg.clone());
		cfg
	}
}

impl Serialize for ServerTLSConfig {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_none()
	}
}

pub fn parse_cert(mut cert: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
	let parsed: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
	parsed?
		.into_iter()
		.map(|item| match item {
			Item::X509Certificate(der) => Ok(der),
			_ => Err(anyhow!("expected a certificate")),
		})
		.collect()
}

pub fn parse_key(mut key: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
	match rustls_pemfile::read_one(&mut reader)?.ok_or_else(|| anyhow!("no key found"))? {
		Item::Pkcs8Key(k) => Ok(PrivateKeyDer::Pkcs8(k)),
		Item::Pkcs1Key(k) => Ok(PrivateKeyDer::Pkcs1(k)),
		Item::Sec1Key(k) => Ok(PrivateKeyDer::Sec1(k)),
		_ => Err(anyhow!("unsupported key type")),
	}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerSet {
	inner: Vec<Arc<Listener>>,
}

impl ListenerSet {
	pub fn from_list(listeners: Vec<Listener>) -> ListenerSet {
		ListenerSet {
			inner: listeners.into_iter().map(Arc::new).collect(),
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Listener>> {
		self.inner.iter()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn get_exactly_one(&self) -> anyhow::Result<Arc<Listener>> {
		if self.inner.len() != 1 {
			anyhow::bail!("expected exactly one listener, found {}", self.inner.len());
		}
		Ok(self.inner[0].clone())
	}

	/// Select the listener for a connection: exact hostname first, then the
	/// longest matching wildcard, then an empty hostname. Snapshot order
	/// breaks ties.
	pub fn best_match(&self, host: &str) -> Option<Arc<Listener>> {
		if let Some(exact) = self.inner.iter().find(|l| l.hostname == host) {
			trace!("listener match for {host} (exact)");
			return Some(exact.clone());
		}
		let mut wildcards: Vec<&Arc<Listener>> = self
			.inner
			.iter()
			.filter(|l| {
				l.hostname.starts_with("*.")
					&& host.ends_with(&l.hostname.as_str()[1..])
			})
			.collect();
		wildcards.sort_by_key(|l| std::cmp::Reverse(l.hostname.len()));
		if let Some(wild) = wildcards.first() {
			trace!("listener match for {host} (wildcard {})", wild.hostname);
			return Some((*wild).clone());
		}
		self.inner.iter().find(|l| l.hostname.is_empty()).cloned()
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
	pub key: RouteKey,
	pub route_name: RouteName,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rule_name: Option<RouteRuleName>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub hostnames: Vec<Strng>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub matches: Vec<RouteMatch>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub backends: Vec<RouteBackendReference>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub inline_policies: Vec<TrafficPolicy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TCPRoute {
	pub key: RouteKey,
	pub route_name: RouteName,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub hostnames: Vec<Strng>,
	pub backends: Vec<TCPRouteBackend>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TCPRouteBackend {
	pub weight: usize,
	pub backend: SimpleBackendReference,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
	pub path: PathMatch,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub method: Option<Strng>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<HeaderMatch>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub query: Vec<QueryMatch>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PathMatch {
	Exact(Strng),
	PathPrefix(Strng),
	Regex(
		#[serde(with = "serde_regex")] regex::Regex,
		/// Pattern length, used for precedence ordering.
		usize,
	),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
	pub name: Strng,
	pub value: ValueMatch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMatch {
	pub name: Strng,
	pub value: ValueMatch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueMatch {
	Exact(Strng),
	Regex(#[serde(with = "serde_regex")] regex::Regex),
}

impl ValueMatch {
	pub fn matches(&self, value: &str) -> bool {
		match self {
			ValueMatch::Exact(want) => want == value,
			ValueMatch::Regex(re) => re.is_match(value),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBackendReference {
	pub weight: usize,
	#[serde(flatten)]
	pub backend: BackendReference,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub inline_policies: Vec<BackendPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendReference {
	/// A service from the discovery section, by namespace/hostname and port.
	Service { name: Strng, port: u16 },
	/// A named top-level backend.
	Backend(BackendName),
	/// Resolve the target from the request Host at dispatch time.
	Dynamic {},
	Invalid,
}

impl BackendReference {
	pub fn name(&self) -> BackendName {
		match self {
			BackendReference::Service { name, port } => strng::format!("service/{name}:{port}"),
			BackendReference::Backend(name) => name.clone(),
			BackendReference::Dynamic {} => strng::literal!("dynamic"),
			BackendReference::Invalid => strng::literal!("invalid"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SimpleBackendReference {
	Service { name: Strng, port: u16 },
	Backend(BackendName),
	/// host:port given inline.
	Inline(Target),
	Invalid,
}

impl SimpleBackendReference {
	pub fn name(&self) -> BackendName {
		match self {
			SimpleBackendReference::Service { name, port } => {
				strng::format!("service/{name}:{port}")
			},
			SimpleBackendReference::Backend(name) => name.clone(),
			SimpleBackendReference::Inline(t) => t.to_string().into(),
			SimpleBackendReference::Invalid => strng::literal!("invalid"),
		}
	}
}

/// A fully resolved backend: dispatch is a match over this.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
	Service(Arc<Service>, u16),
	#[serde(rename = "host")]
	Opaque(BackendName, Target),
	#[serde(rename = "mcp")]
	MCP(BackendName, McpBackend),
	#[serde(rename = "ai")]
	AI(BackendName, llm::AIBackend),
	Dynamic {},
	Invalid,
}

/// The subset of backends that auxiliary calls (mirrors, webhooks, rate limit
/// services) can target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SimpleBackend {
	Service(Arc<Service>, u16),
	#[serde(rename = "host")]
	Opaque(BackendName, Target),
	Invalid,
}

impl SimpleBackend {
	pub fn name(&self) -> BackendName {
		match self {
			SimpleBackend::Service(svc, port) => {
				strng::format!("service/{}/{}:{port}", svc.namespace, svc.hostname)
			},
			SimpleBackend::Opaque(name, _) => name.clone(),
			SimpleBackend::Invalid => strng::literal!("invalid"),
		}
	}

	pub fn hostport(&self) -> String {
		match self {
			SimpleBackend::Service(svc, port) => format!("{}:{port}", svc.hostname),
			SimpleBackend::Opaque(_, target) => target.to_string(),
			SimpleBackend::Invalid => "invalid".to_string(),
		}
	}
}

impl From<SimpleBackend> for Backend {
	fn from(value: SimpleBackend) -> Self {
		match value {
			SimpleBackend::Service(svc, port) => Backend::Service(svc, port),
			SimpleBackend::Opaque(name, target) => Backend::Opaque(name, target),
			SimpleBackend::Invalid => Backend::Invalid,
		}
	}
}

impl Backend {
	pub fn name(&self) -> BackendName {
		match self {
			Backend::Service(svc, port) => {
				strng::format!("service/{}/{}:{port}", svc.namespace, svc.hostname)
			},
			Backend::Opaque(name, _) => name.clone(),
			Backend::MCP(name, _) => name.clone(),
			Backend::AI(name, _) => name.clone(),
			Backend::Dynamic {} => strng::literal!("dynamic"),
			Backend::Invalid => strng::literal!("invalid"),
		}
	}

	pub fn backend_type(&self) -> cel::BackendType {
		match self {
			Backend::Service(_, _) => cel::BackendType::Service,
			Backend::Opaque(_, _) => cel::BackendType::Static,
			Backend::MCP(_, _) => cel::BackendType::MCP,
			Backend::AI(_, _) => cel::BackendType::AI,
			Backend::Dynamic {} => cel::BackendType::Dynamic,
			Backend::Invalid => cel::BackendType::Unknown,
		}
	}

	pub fn backend_protocol(&self) -> Option<cel::BackendProtocol> {
		match self {
			Backend::MCP(_, _) => Some(cel::BackendProtocol::mcp),
			Backend::AI(_, _) => Some(cel::BackendProtocol::llm),
			_ => None,
		}
	}

	pub fn backend_info(&self) -> BackendInfo {
		BackendInfo {
			backend_type: self.backend_type(),
			backend_name: self.name(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
	pub backend_type: cel::BackendType,
	pub backend_name: BackendName,
}

/// A service from the `services` discovery section: a stable hostname with a
/// set of endpoint addresses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
	pub name: Strng,
	pub namespace: Strng,
	pub hostname: Strng,
	/// service port -> target port
	pub ports: HashMap<u16, u16>,
	pub endpoints: Vec<IpAddr>,
}

impl Service {
	pub fn namespaced_name(&self) -> Strng {
		strng::format!("{}/{}", self.namespace, self.hostname)
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpBackend {
	pub targets: Vec<Arc<McpTarget>>,
	pub stateful: bool,
	/// Prefix tool names even with a single target.
	pub always_use_prefix: bool,
}

impl McpBackend {
	pub fn find(&self, name: &str) -> Option<Arc<McpTarget>> {
		self
			.targets
			.iter()
			.find(|t| t.name.as_str() == name)
			.cloned()
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTarget {
	pub name: McpTargetName,
	#[serde(flatten)]
	pub spec: McpTargetSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum McpTargetSpec {
	#[serde(rename = "sse")]
	Sse { backend: SimpleBackendReference, path: String },
	#[serde(rename = "mcp")]
	Streamable { backend: SimpleBackendReference, path: String },
	#[serde(rename = "stdio")]
	Stdio {
		cmd: String,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		args: Vec<String>,
		#[serde(skip_serializing_if = "HashMap::is_empty")]
		env: HashMap<String, String>,
	},
	#[serde(rename = "openapi")]
	OpenAPI {
		backend: SimpleBackendReference,
		#[serde(skip)]
		schema: Arc<openapiv3::OpenAPI>,
	},
}

impl McpTargetSpec {
	pub fn backend(&self) -> Option<&SimpleBackendReference> {
		match self {
			McpTargetSpec::Sse { backend, .. } => Some(backend),
			McpTargetSpec::Streamable { backend, .. } => Some(backend),
			McpTargetSpec::OpenAPI { backend, .. } => Some(backend),
			McpTargetSpec::Stdio { .. } => None,
		}
	}
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Target {
	Address(SocketAddr),
	Hostname(Strng, u16),
}

impl Target {
	pub fn port(&self) -> u16 {
		match self {
			Target::Address(a) => a.port(),
			Target::Hostname(_, p) => *p,
		}
	}
}

impl TryFrom<(&str, u16)> for Target {
	type Error = anyhow::Error;

	fn try_from((host, port): (&str, u16)) -> anyhow::Result<Self> {
		match host.parse::<IpAddr>() {
			Ok(ip) => Ok(Target::Address(SocketAddr::new(ip, port))),
			Err(_) => {
				if host.is_empty() {
					anyhow::bail!("empty hostname");
				}
				Ok(Target::Hostname(host.into(), port))
			},
		}
	}
}

impl TryFrom<&str> for Target {
	type Error = anyhow::Error;

	fn try_from(hostport: &str) -> anyhow::Result<Self> {
		// Try a raw socket address first so IPv6 literals work.
		if let Ok(addr) = hostport.parse::<SocketAddr>() {
			return Ok(Target::Address(addr));
		}
		let (host, port) = hostport
			.rsplit_once(':')
			.ok_or_else(|| anyhow!("invalid host:port: {hostport}"))?;
		let port: u16 = port.parse()?;
		(host, port).try_into()
	}
}

impl Display for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Target::Address(addr) => write!(f, "{addr}"),
			Target::Hostname(host, port) => write!(f, "{host}:{port}"),
		}
	}
}

impl Serialize for Target {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> serde::Deserialize<'de> for Target {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		crate::serdes::de_parse(deserializer)
	}
}

impl std::str::FromStr for Target {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Target::try_from(s)
	}
}

/// A policy attached to some part of the config tree. Precedence on overlap:
/// SubBackend > RouteRule > Route > Listener > Gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedPolicy {
	pub name: PolicyName,
	pub target: PolicyTarget,
	pub policy: PolicyType,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyTarget {
	Gateway(GatewayName),
	Listener(ListenerKey),
	Route(RouteName),
	RouteRule(RouteRuleName),
	Backend(BackendName),
	/// `<backend>/<sub-backend>`, e.g. one provider of an AI backend.
	SubBackend(Strng),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyType {
	Frontend(FrontendPolicy),
	Traffic(TrafficPolicy),
	Backend(BackendPolicy),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FrontendPolicy {
	#[serde(rename = "http")]
	HTTP(frontend::HTTP),
	#[serde(rename = "tls")]
	TLS(frontend::TLS),
	#[serde(rename = "tcp")]
	TCP(frontend::TCP),
	AccessLog(frontend::LoggingPolicy),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrafficPolicy {
	Timeout(timeout::Policy),
	Retry(retry::Policy),
	#[serde(rename = "ai")]
	AI(Arc<llm::Policy>),
	Authorization(RuleSet),
	LocalRateLimit(Vec<crate::http::localratelimit::RateLimit>),
	RemoteRateLimit(remoteratelimit::RemoteRateLimit),
	ExtAuthz(crate::http::ext_authz::ExtAuthz),
	JwtAuth(crate::http::jwt::Jwt),
	BasicAuth(crate::http::basicauth::BasicAuthentication),
	#[serde(rename = "apiKey")]
	APIKey(crate::http::apikey::APIKeyAuthentication),
	Transformation(crate::http::transformation::Transformation),
	Csrf(crate::http::csrf::Csrf),
	#[serde(rename = "cors")]
	CORS(crate::http::cors::Cors),
	RequestHeaderModifier(filters::HeaderModifier),
	ResponseHeaderModifier(filters::HeaderModifier),
	RequestRedirect(filters::RequestRedirect),
	UrlRewrite(filters::UrlRewrite),
	RequestMirror(Vec<filters::RequestMirror>),
	DirectResponse(filters::DirectResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendPolicy {
	#[serde(rename = "backendTLS")]
	BackendTLS(crate::http::backendtls::BackendTLS),
	BackendAuth(BackendAuth),
	A2a {},
	#[serde(rename = "ai")]
	AI(Arc<llm::Policy>),
	McpAuthorization(McpAuthorization),
	McpAuthentication(McpAuthentication),
	RequestHeaderModifier(filters::HeaderModifier),
	ResponseHeaderModifier(filters::HeaderModifier),
}

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub enum HostnameMatch {
	Exact(Strng),
	/// `*.example.com` stored as `Wildcard("example.com")`.
	Wildcard(Strng),
	None,
}

impl From<Strng> for HostnameMatch {
	fn from(s: Strng) -> Self {
		match s.strip_prefix("*.") {
			Some(rest) => HostnameMatch::Wildcard(strng::new(rest)),
			None => HostnameMatch::Exact(s),
		}
	}
}

impl HostnameMatch {
	/// All matchers a request host satisfies, most specific first, ending in
	/// the catch-all.
	pub fn all_matches(hostname: &str) -> Vec<HostnameMatch> {
		let mut out = Vec::new();
		if !hostname.starts_with("*.") && !hostname.is_empty() {
			out.push(HostnameMatch::Exact(hostname.into()));
		}
		let parts: Vec<&str> = hostname.split('.').skip(1).collect();
		for i in 0..parts.len() {
			out.push(HostnameMatch::Wildcard(parts[i..].join(".").into()));
		}
		out.push(HostnameMatch::None);
		out
	}
}

#[derive(Debug, Clone)]
struct SortedMatch {
	key: RouteKey,
	index: usize,
}

/// Routes indexed by hostname matcher, each bucket pre-sorted by Gateway API
/// match precedence so resolution is a linear scan.
#[derive(Debug, Clone, Default)]
pub struct RouteSet {
	buckets: HashMap<HostnameMatch, Vec<SortedMatch>>,
	all: HashMap<RouteKey, Arc<Route>>,
}

impl Serialize for RouteSet {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.all.serialize(serializer)
	}
}

impl RouteSet {
	pub fn from_list(routes: Vec<Route>) -> RouteSet {
		let mut set = RouteSet::default();
		for r in routes {
			set.insert(r);
		}
		set
	}

	pub fn is_empty(&self) -> bool {
		self.all.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
		self.all.values()
	}

	pub fn insert(&mut self, route: Route) {
		// A route with no matches matches everything.
		let route = if route.matches.is_empty() {
			Route {
				matches: vec![RouteMatch {
					path: PathMatch::PathPrefix(strng::literal!("/")),
					method: None,
					headers: vec![],
					query: vec![],
				}],
				..route
			}
		} else {
			route
		};
		let route = Arc::new(route);
		self.all.insert(route.key.clone(), route.clone());

		let matchers: Vec<HostnameMatch> = if route.hostnames.is_empty() {
			vec![HostnameMatch::None]
		} else {
			route
				.hostnames
				.iter()
				.map(|h| HostnameMatch::from(h.clone()))
				.collect()
		};
		for hm in matchers {
			let bucket = self.buckets.entry(hm).or_default();
			for (index, m) in route.matches.iter().enumerate() {
				let slot = bucket
					.binary_search_by(|existing| {
						let have = self.all.get(&existing.key).expect("route must exist");
						let have_match = have.matches.get(existing.index).expect("match must exist");
						compare_matches((have_match, &existing.key), (m, &route.key))
					})
					.unwrap_or_else(|pos| pos);
				bucket.insert(
					slot,
					SortedMatch {
						key: route.key.clone(),
						index,
					},
				);
			}
		}
	}

	pub fn get_hostname(
		&self,
		hm: &HostnameMatch,
	) -> impl Iterator<Item = (Arc<Route>, &RouteMatch)> {
		self.buckets.get(hm).into_iter().flatten().filter_map(|sm| {
			self.all.get(&sm.key).map(|r| {
				let m = r.matches.get(sm.index).expect("match must exist");
				(r.clone(), m)
			})
		})
	}
}

/// Gateway API route match precedence: exact path > longer path > method
/// presence > header count > query count, then route key order.
fn compare_matches(a: (&RouteMatch, &RouteKey), b: (&RouteMatch, &RouteKey)) -> Ordering {
	let (a, a_key) = a;
	let (b, b_key) = b;
	let rank = |p: &PathMatch| match p {
		PathMatch::Exact(_) => 2,
		PathMatch::PathPrefix(_) | PathMatch::Regex(_, _) => 1,
	};
	let len = |p: &PathMatch| match p {
		PathMatch::Exact(s) => s.len(),
		PathMatch::PathPrefix(s) => s.len(),
		PathMatch::Regex(_, l) => *l,
	};
	rank(&b.path)
		.cmp(&rank(&a.path))
		.then_with(|| len(&b.path).cmp(&len(&a.path)))
		.then_with(|| b.method.is_some().cmp(&a.method.is_some()))
		.then_with(|| b.headers.len().cmp(&a.headers.len()))
		.then_with(|| b.query.len().cmp(&a.query.len()))
		.then_with(|| a_key.cmp(b_key))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn listener(key: &str, hostname: &str) -> Listener {
		Listener {
			key: key.into(),
			name: key.into(),
			gateway_name: "gw".into(),
			hostname: hostname.into(),
			protocol: ListenerProtocol::HTTP,
			routes: RouteSet::default(),
			tcp_routes: vec![],
		}
	}

	#[test]
	fn listener_selection_specificity() {
		let set = ListenerSet::from_list(vec![
			listener("any", ""),
			listener("wild", "*.example.com"),
			listener("exact", "a.example.com"),
		]);
		assert_eq!(set.best_match("a.example.com").unwrap().key, "exact");
		assert_eq!(set.best_match("b.example.com").unwrap().key, "wild");
		assert_eq!(set.best_match("a.b.example.com").unwrap().key, "wild");
		assert_eq!(set.best_match("other.com").unwrap().key, "any");
	}

	#[test]
	fn wildcard_does_not_match_apex() {
		let set = ListenerSet::from_list(vec![listener("wild", "*.example.com")]);
		assert!(set.best_match("example.com").is_none());
	}

	#[test]
	fn hostname_match_expansion() {
		let matches = HostnameMatch::all_matches("a.b.example.com");
		assert_eq!(
			matches,
			vec![
				HostnameMatch::Exact("a.b.example.com".into()),
				HostnameMatch::Wildcard("b.example.com".into()),
				HostnameMatch::Wildcard("example.com".into()),
				HostnameMatch::Wildcard("com".into()),
				HostnameMatch::None,
			]
		);
	}

	#[test]
	fn target_parsing() {
		assert_eq!(
			Target::try_from("127.0.0.1:8080").unwrap(),
			Target::Address("127.0.0.1:8080".parse().unwrap())
		);
		assert_eq!(
			Target::try_from("example.com:443").unwrap(),
			Target::Hostname("example.com".into(), 443)
		);
		assert!(Target::try_from("no-port").is_err());
	}

	#[test]
	fn route_precedence_exact_before_prefix() {
		let mk = |key: &str, path: PathMatch| Route {
			key: key.into(),
			route_name: key.into(),
			rule_name: None,
			hostnames: vec![],
			matches: vec![RouteMatch {
				path,
				method: None,
				headers: vec![],
				query: vec![],
			}],
			backends: vec![],
			inline_policies: vec![],
		};
		let set = RouteSet::from_list(vec![
			mk("prefix", PathMatch::PathPrefix("/a".into())),
			mk("exact", PathMatch::Exact("/a/b".into())),
			mk("long-prefix", PathMatch::PathPrefix("/a/b".into())),
		]);
		let order: Vec<_> = set
			.get_hostname(&HostnameMatch::None)
			.map(|(r, _)| r.key.clone())
			.collect();
		assert_eq!(order, vec!["exact", "long-prefix", "prefix"]);
	}
}
