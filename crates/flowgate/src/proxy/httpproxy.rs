//! The HTTP request pipeline: listener selection, route resolution, the
//! policy pipeline in its fixed order, dispatch to the typed backend, and
//! response-phase policies.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::{debug, trace, warn};

use crate::http::filters::AutoHostname;
use crate::http::{
	self, Body, HeaderMap, HeaderName, HeaderValue, PolicyResponse, Request, Response, StatusCode,
	header, retry,
};
use crate::llm::{self, RequestResult, RouteType};
use crate::proxy::{PolicyClient, ProxyError, ProxyResponse, ProxyResponseReason};
use crate::store::{
	BackendPolicies, FrontendPolicies, LLMRequestPolicies, LLMResponsePolicies, RoutePath,
	RoutePolicies, Snapshot,
};
use crate::telemetry::log::{DropOnLog, LogBody, RequestLog};
use crate::telemetry::trc::TraceParent;
use crate::transport::stream::{Extension, TCPConnectionInfo, TLSConnectionInfo};
use crate::types::agent::{
	Backend, BackendPolicy, BindName, Listener, Route, RouteBackendReference, Target,
};
use crate::ProxyInputs;

const MAX_BUFFERED_RETRY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct HTTPProxy {
	pub bind_name: BindName,
	pub inputs: Arc<ProxyInputs>,
	pub selected_listener: Option<Arc<Listener>>,
	pub target_address: SocketAddr,
}

impl HTTPProxy {
	pub async fn proxy(
		&self,
		connection: Arc<Extension>,
		policies: &FrontendPolicies,
		req: ::http::Request<Incoming>,
	) -> Response {
		let start = Instant::now();
		let start_time = flowgate_core::telemetry::render_current_time();
		let mut req = req.map(Body::new);

		connection.copy::<TCPConnectionInfo>(req.extensions_mut());
		connection.copy::<TLSConnectionInfo>(req.extensions_mut());
		let tcp = connection
			.get::<TCPConnectionInfo>()
			.expect("tcp info is set at accept");

		let mut log = RequestLog::new(
			crate::telemetry::log::CelLogging::new(self.inputs.cfg.logging.clone()),
			self.inputs.metrics.clone(),
			start,
			start_time,
			tcp,
		);
		policies.register_cel_expressions(log.cel.ctx());
		if let Some(lp) = &policies.access_log {
			if lp.filter.is_some() {
				log.cel.filter = lp.filter.clone();
			}
			if !lp.add.is_empty() {
				for (k, e) in &lp.add {
					log.cel.fields.add.insert(k.clone(), e.clone());
				}
			}
			if !lp.remove.is_empty() {
				log.cel.fields.remove.extend(lp.remove.iter().cloned());
			}
		}
		let mut log: DropOnLog = log.into();

		// Response policies live outside proxy_internal so they run even for
		// errors and direct responses.
		let mut response_policies = ResponsePolicies::default();
		let ret = self
			.proxy_internal(
				&connection,
				req,
				log.as_mut().expect("log is set"),
				&mut response_policies,
			)
			.await;

		log.with(|l| {
			l.error = ret.as_ref().err().and_then(|e| match e {
				ProxyResponse::Error(err) => Some(err.to_string()),
				_ => None,
			});
		});
		let reason = match &ret {
			Ok(_) => ProxyResponseReason::Upstream,
			Err(e) => e.as_reason(),
		};
		let mut resp = ret.unwrap_or_else(|e| e.into_response());

		if let Some(l) = log.as_mut() {
			let needs_body = l.cel.ctx().with_response(&resp);
			if needs_body && let Ok(body) = http::inspect_response_body(&mut resp).await {
				l.cel.ctx().with_response_body(body);
			}
		}
		if let Err(e) = response_policies
			.apply(&mut resp, log.as_mut().expect("log is set"))
			.await
		{
			resp = e.into_response();
		}

		log.with(|l| {
			l.status = Some(resp.status());
			l.reason = Some(reason);
		});
		resp.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn proxy_internal(
		&self,
		connection: &Arc<Extension>,
		mut req: Request,
		log: &mut RequestLog,
		response_policies: &mut ResponsePolicies,
	) -> Result<Response, ProxyResponse> {
		// The snapshot is pinned here; a concurrent config swap does not
		// affect this request.
		let snapshot = self.inputs.store.current();
		log.tls_info = connection.get::<TLSConnectionInfo>();
		log.backend_protocol = Some(crate::cel::BackendProtocol::http);

		let bind = snapshot
			.bind(&self.bind_name)
			.ok_or(ProxyError::BindNotFound)?;

		sensitive_headers(&mut req);
		normalize_uri(connection, &mut req).map_err(|_| ProxyError::InvalidRequest)?;
		let mut req_upgrade = hop_by_hop_headers(&mut req);

		let host = http::get_host(&req)?.to_string();
		log.host = Some(host.clone());
		log.method = Some(req.method().clone());
		log.path = Some(
			req.uri()
				.path_and_query()
				.map(|pq| pq.to_string())
				.unwrap_or_else(|| req.uri().path().to_string()),
		);
		log.version = Some(req.version());
		apply_request_to_cel(log, &mut req).await;

		// Trace context: join an incoming trace or start a new one.
		log.tracer = self.inputs.tracer.clone();
		let incoming_trace = TraceParent::from_request(&req);
		if log.trace_sampled(incoming_trace.as_ref()) {
			let span = match &incoming_trace {
				Some(tp) => tp.new_span(),
				None => {
					let mut tp = TraceParent::new();
					tp.flags = 1;
					tp
				},
			};
			span.insert_header(&mut req);
			log.incoming_span = incoming_trace;
			log.outgoing_span = Some(span);
		} else {
			log.tracer = None;
		}

		let listener = match &self.selected_listener {
			Some(l) => l.clone(),
			None => bind
				.listeners
				.best_match(&host)
				.ok_or(ProxyError::ListenerNotFound)?,
		};
		log.bind_name = Some(self.bind_name.clone());
		log.gateway_name = Some(listener.gateway_name.clone());
		log.listener_name = Some(listener.name.clone());
		debug!(bind = %self.bind_name, listener = %listener.key, "selected listener");

		let gateway_policies =
			snapshot.gateway_policies(listener.key.clone(), listener.gateway_name.clone());
		gateway_policies.register_cel_expressions(log.cel.ctx());
		apply_request_to_cel(log, &mut req).await;
		self
			.apply_gateway_policies(&gateway_policies, log, &mut req, response_policies)
			.await?;

		let (route, path_match) = http::route::select_best_route(&listener, &host, &req)
			.ok_or(ProxyError::RouteNotFound)?;
		log.route_name = Some(route.route_name.clone());
		log.route_rule_name = route.rule_name.clone();
		req.extensions_mut().insert(path_match);
		debug!(route = %route.key, "selected route");

		let route_path = RoutePath {
			gateway: listener.gateway_name.clone(),
			listener: listener.key.clone(),
			route: route.route_name.clone(),
			route_rule: route.rule_name.clone(),
		};
		let route_policies = snapshot.route_policies(route_path, &route.inline_policies);
		route_policies.register_cel_expressions(log.cel.ctx());
		apply_request_to_cel(log, &mut req).await;

		response_policies.route_response_header =
			route_policies.response_header_modifier.clone();
		response_policies.transformation = route_policies.transformation.clone();
		response_policies.gateway_transformation = gateway_policies.transformation.clone();
		response_policies.timeout = route_policies.timeout.clone();
		response_policies.cel_needed =
			response_policies.transformation.is_some()
				|| response_policies.gateway_transformation.is_some();

		self
			.apply_request_policies(&route_policies, log, &mut req, response_policies)
			.await?;

		let selected = select_backend(&route).ok_or(ProxyError::NoValidBackends)?;
		let backend = super::resolve_backend(&selected.backend, &snapshot)?;
		let backend_policies = backend_policies_for(
			&snapshot,
			&backend,
			&selected.inline_policies,
		);
		log.backend_info = Some(backend.backend_info());
		if let Some(bp) = backend.backend_protocol() {
			log.backend_protocol = Some(bp);
		}

		// Mirrors fork here: the sampled fraction is cloned (headers only)
		// and dispatched out of band. A mirror can never fail the primary.
		let (head, body) = req.into_parts();
		for mirror in &route_policies.request_mirror {
			if !rand::rng().random_bool(mirror.percentage.clamp(0.0, 1.0)) {
				trace!("mirror not sampled");
				continue;
			}
			let mirror_req = Request::from_parts(head.clone(), Body::empty());
			let client = self.policy_client();
			let mirror = mirror.clone();
			tokio::task::spawn(async move {
				let mut mirror_req = mirror_req;
				mirror_req.headers_mut().remove(header::CONTENT_LENGTH);
				if let Err(e) = client.call_reference(mirror_req, &mirror.backend).await {
					debug!("mirror request failed: {e}");
				}
			});
		}

		let retries = route_policies.retry.clone();
		let llm_policies: Arc<LLMRequestPolicies> = Arc::new(route_policies.into());
		// `attempts` counts total tries against the upstream, not retries.
		let attempts = retries.as_ref().map(|r| r.attempts.get()).unwrap_or(1);

		let replay = if attempts > 1 {
			retry::ReplayBody::try_new(body, MAX_BUFFERED_RETRY_BYTES)
		} else {
			Err(body)
		};
		let mut next = match replay {
			Ok(replay) => Some(replay),
			Err(body) => {
				// No retries; stream the body straight through.
				let req = Request::from_parts(head, body);
				return self
					.attempt_upstream(
						log,
						&mut req_upgrade,
						&snapshot,
						llm_policies,
						&backend,
						backend_policies,
						response_policies,
						req,
					)
					.await;
			},
		};

		let mut last: Option<Result<Response, ProxyResponse>> = None;
		for n in 0..attempts {
			let is_last = n == attempts - 1;
			let this = next.take().expect("replay body present");
			if matches!(this.is_capped(), Some(true)) {
				debug!("request body too large to replay; returning previous attempt");
				return last.expect("capped implies a previous attempt");
			}
			if !is_last {
				next = Some(this.clone());
			}
			let mut head = head.clone();
			if n > 0 {
				log.retry_attempt = Some(n);
				head.headers.insert(
					http::x_headers::X_RETRY_ATTEMPT,
					HeaderValue::try_from(n.to_string())
						.map_err(|e| ProxyError::ProcessingString(e.to_string()))?,
				);
				if let Some(backoff) = retries.as_ref().and_then(|r| r.backoff) {
					tokio::time::sleep(backoff).await;
				}
			}
			let req = Request::from_parts(head, Body::new(this));
			let res = self
				.attempt_upstream(
					log,
					&mut req_upgrade,
					&snapshot,
					llm_policies.clone(),
					&backend,
					backend_policies.clone(),
					response_policies,
					req,
				)
				.await;
			let retryable = match (&res, retries.as_ref()) {
				(_, None) => false,
				(Ok(resp), Some(pol)) => pol.should_retry_status(resp.status()),
				(Err(ProxyResponse::Error(e)), Some(_)) => e.is_retryable(),
				(Err(ProxyResponse::DirectResponse(_)), _) => false,
			};
			if is_last || !retryable {
				return res;
			}
			debug!("retrying request, attempt {} was not successful", n + 1);
			last = Some(res);
		}
		unreachable!("retry loop always returns")
	}

	async fn apply_gateway_policies(
		&self,
		policies: &crate::store::GatewayPolicies,
		log: &mut RequestLog,
		req: &mut Request,
		response_policies: &mut ResponsePolicies,
	) -> Result<(), ProxyResponse> {
		if let Some(j) = &policies.jwt {
			j.apply(log, req)
				.await
				.map_err(|e| ProxyResponse::from(ProxyError::JwtAuthenticationFailure(e)))?;
		}
		if let Some(b) = &policies.basic_auth {
			b.apply(log, req).await?;
		}
		if let Some(k) = &policies.api_key {
			k.apply(log, req).await?;
		}
		if let Some(x) = &policies.ext_authz {
			x.check(self.policy_client(), req)
				.await?
				.apply(response_policies.headers())?;
		}
		if let Some(t) = &policies.transformation {
			let exec = log
				.cel
				.cel_context
				.build()
				.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
			t.apply_request(req, &exec).map_err(ProxyError::from)?;
		}
		Ok(())
	}

	/// The request-phase pipeline, in its fixed order.
	async fn apply_request_policies(
		&self,
		policies: &RoutePolicies,
		log: &mut RequestLog,
		req: &mut Request,
		response_policies: &mut ResponsePolicies,
	) -> Result<(), ProxyResponse> {
		// 1. CORS: preflights short-circuit, actual requests stage headers.
		if let Some(c) = &policies.cors {
			c.apply(req).apply(response_policies.headers())?;
		}
		// 2. CSRF.
		if let Some(c) = &policies.csrf {
			c.apply(req)
				.map_err(|_| ProxyError::CsrfValidationFailed)?
				.apply(response_policies.headers())?;
		}
		// 3. Authentication; the first denial wins.
		if let Some(j) = &policies.jwt {
			j.apply(log, req)
				.await
				.map_err(|e| ProxyResponse::from(ProxyError::JwtAuthenticationFailure(e)))?;
		}
		if let Some(b) = &policies.basic_auth {
			b.apply(log, req).await?;
		}
		if let Some(k) = &policies.api_key {
			k.apply(log, req).await?;
		}
		if let Some(x) = &policies.ext_authz {
			x.check(self.policy_client(), req)
				.await?
				.apply(response_policies.headers())?;
		}
		// 4. Authorization over the accumulated identity.
		if let Some(a) = &policies.authorization {
			let exec = log
				.cel
				.cel_context
				.build()
				.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
			a.apply(&exec)
				.map_err(|_| ProxyResponse::from(ProxyError::AuthorizationFailed))?;
		}
		// 5. (MCP authentication/authorization happens inside the MCP
		//    backend.)
		// 6. Rate limits: local, then remote.
		for lrl in &policies.local_rate_limit {
			lrl.check_request()?;
		}
		if let Some(rrl) = &policies.remote_rate_limit {
			let exec = log
				.cel
				.cel_context
				.build()
				.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
			rrl
				.check(self.policy_client(), req, &exec)
				.await?
				.apply(response_policies.headers())?;
		}
		// 7. (The AI prompt guard runs in the LLM layer, where the parsed
		//    request is available.)
		// 8. Transformations.
		if let Some(t) = &policies.transformation {
			let exec = log
				.cel
				.cel_context
				.build()
				.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
			t.apply_request(req, &exec).map_err(ProxyError::from)?;
		}
		if let Some(h) = &policies.request_header_modifier {
			h.apply(req.headers_mut()).map_err(ProxyError::from)?;
		}
		// 9. URL rewrite, then redirect; a redirect observes the rewrite.
		req.extensions_mut().insert(AutoHostname());
		if let Some(rw) = &policies.url_rewrite {
			rw.apply(req).map_err(ProxyError::from)?;
		}
		if let Some(rr) = &policies.request_redirect {
			rr.apply(req)
				.map_err(ProxyError::from)?
				.apply(response_policies.headers())?;
		}
		// 10. (Mirrors fork in the caller, after policies settle the
		//     request.)
		// 11. Direct response.
		if let Some(dr) = &policies.direct_response {
			PolicyResponse::default()
				.with_response(dr.apply())
				.apply(response_policies.headers())?;
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn attempt_upstream(
		&self,
		log: &mut RequestLog,
		req_upgrade: &mut Option<RequestUpgrade>,
		snapshot: &Arc<Snapshot>,
		llm_policies: Arc<LLMRequestPolicies>,
		backend: &Backend,
		backend_policies: BackendPolicies,
		response_policies: &mut ResponsePolicies,
		req: Request,
	) -> Result<Response, ProxyResponse> {
		let call = make_backend_call(
			self.inputs.clone(),
			snapshot.clone(),
			llm_policies,
			backend,
			backend_policies,
			req,
			&mut Some(log),
			response_policies,
		)
		.await?;

		let timeout = response_policies
			.timeout
			.as_ref()
			.and_then(|t| t.effective_timeout());
		let result = match timeout {
			Some(timeout) => {
				let deadline = tokio::time::Instant::from_std(log.start + timeout);
				match tokio::time::timeout_at(deadline, call).await {
					Ok(r) => r,
					Err(_) => return Err(ProxyError::RequestTimeout.into()),
				}
			},
			None => call.await,
		};
		let resp = result.map_err(ProxyResponse::from)?;

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			return handle_upgrade(req_upgrade, resp).await.map_err(Into::into);
		}
		maybe_set_grpc_status(log, resp.headers());
		Ok(resp)
	}

	fn policy_client(&self) -> PolicyClient {
		PolicyClient {
			inputs: self.inputs.clone(),
		}
	}
}

fn select_backend(route: &Route) -> Option<RouteBackendReference> {
	route
		.backends
		.choose_weighted(&mut rand::rng(), |b| b.weight)
		.ok()
		.cloned()
}

fn backend_policies_for(
	snapshot: &Snapshot,
	backend: &Backend,
	inline: &[BackendPolicy],
) -> BackendPolicies {
	let service = match backend {
		Backend::Service(svc, _) => Some(svc.namespaced_name()),
		_ => None,
	};
	snapshot.backend_policies(backend.name(), service, &[inline])
}

/// Build the dispatch future for the selected backend. The future performs
/// the upstream call; everything before it mutates the request.
#[allow(clippy::too_many_arguments)]
async fn make_backend_call(
	inputs: Arc<ProxyInputs>,
	snapshot: Arc<Snapshot>,
	llm_policies: Arc<LLMRequestPolicies>,
	backend: &Backend,
	backend_policies: BackendPolicies,
	mut req: Request,
	log: &mut Option<&mut RequestLog>,
	response_policies: &mut ResponsePolicies,
) -> Result<Pin<Box<dyn Future<Output = Result<Response, ProxyError>> + Send>>, ProxyResponse> {
	let client = PolicyClient {
		inputs: inputs.clone(),
	};

	let (target, effective_policies) = match backend {
		Backend::MCP(name, mcp_backend) => {
			// MCP aggregates its own backends; hand off wholesale.
			let name = name.clone();
			let mcp_backend = mcp_backend.clone();
			let mcp_log = log
				.as_ref()
				.map(|l| l.mcp_status.clone())
				.unwrap_or_default();
			if let Some(l) = log.as_mut() {
				set_backend_cel_context(l);
			}
			let state = inputs.mcp_state.clone();
			return Ok(Box::pin(async move {
				Ok(
					state
						.serve(client, name, mcp_backend, backend_policies, req, mcp_log)
						.await,
				)
			}));
		},
		Backend::AI(name, ai) => {
			let provider = ai.select_provider().ok_or(ProxyError::NoValidBackends)?;
			let sub_name = flowgate_core::strng::format!("{}/{}", name, provider.name);
			let sub_policies = snapshot.sub_backend_policies(sub_name, None);
			let (target, provider_defaults) = match &provider.host_override {
				Some(target) => (
					target.clone(),
					BackendPolicies {
						llm_provider: Some(provider.clone()),
						..Default::default()
					},
				),
				None => {
					let (target, mut defaults) = provider.provider.default_connector();
					defaults.llm_provider = Some(provider.clone());
					(target, defaults)
				},
			};
			if let Some(path) = &provider.path_override {
				http::modify_req_uri(&mut req, |uri| {
					uri.path_and_query =
						Some(http::uri::PathAndQuery::try_from(path.as_str())?);
					Ok(())
				})
				.map_err(ProxyError::Processing)?;
			}
			(
				target,
				provider_defaults.merge(backend_policies).merge(sub_policies),
			)
		},
		Backend::Service(svc, port) => {
			let ip = svc
				.endpoints
				.choose(&mut rand::rng())
				.ok_or(ProxyError::NoValidBackends)?;
			let target_port = svc.ports.get(port).copied().unwrap_or(*port);
			(
				Target::Address(SocketAddr::from((*ip, target_port))),
				backend_policies,
			)
		},
		Backend::Opaque(_, target) => (target.clone(), backend_policies),
		Backend::Dynamic {} => {
			let port = req
				.extensions()
				.get::<TCPConnectionInfo>()
				.map(|t| t.local_addr.port())
				.unwrap_or(80);
			let host = http::get_host(&req)?;
			let target =
				Target::try_from((host, port)).map_err(|_| ProxyError::InvalidRequest)?;
			(target, backend_policies)
		},
		Backend::Invalid => return Err(ProxyError::BackendDoesNotExist.into()),
	};

	// Backend header policies and auth come before provider translation so
	// providers can assume a standardized Authorization header.
	if let Some(h) = &effective_policies.request_header_modifier {
		h.apply(req.headers_mut()).map_err(ProxyError::from)?;
	}
	response_policies.backend_response_header =
		effective_policies.response_header_modifier.clone();
	if let Some(auth) = &effective_policies.backend_auth {
		crate::http::auth::apply_backend_auth(&client, auth, &mut req).await?;
	}

	// A2A is passthrough with telemetry: observe the JSON-RPC method.
	if effective_policies.a2a
		&& let Some(l) = log.as_mut()
	{
		crate::a2a::observe_request(&mut req, l).await;
	}

	if let Some(l) = log.as_mut() {
		l.endpoint = Some(target.clone());
		set_backend_cel_context(l);
	}

	let llm_policies = llm_policies.merge_backend_policies(effective_policies.llm.clone());
	let (req, llm_response_policies, llm_request) = match &effective_policies.llm_provider {
		Some(provider) => {
			match prepare_llm_request(
				&client,
				provider,
				&llm_policies,
				req,
				log,
				response_policies,
			)
			.await?
			{
				LLMPrepared::Forward(req, pol, info) => (req, pol, info),
				LLMPrepared::Direct(resp) => {
					return Ok(Box::pin(async move { Ok(resp) }));
				},
			}
		},
		None => (req, LLMResponsePolicies::default(), None),
	};

	// AWS signing covers the final bytes; it must be the last mutation.
	let mut req = req;
	crate::http::auth::apply_late_backend_auth(
		effective_policies.backend_auth.as_ref(),
		&mut req,
	)
	.await?;

	// Host header follows the backend unless a rewrite pinned it.
	if req.extensions().get::<AutoHostname>().is_some()
		&& let Target::Hostname(h, port) = &target
	{
		let authority = if *port == 80 || *port == 443 {
			h.to_string()
		} else {
			format!("{h}:{port}")
		};
		http::modify_req_uri(&mut req, |uri| {
			uri.authority = Some(http::Authority::try_from(authority.as_str())?);
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
	}

	let transport = crate::client::Transport::from(effective_policies.backend_tls.clone());
	let upstream = inputs.upstream.clone();
	let llm_log = log
		.as_ref()
		.map(|l| l.llm_response.clone())
		.unwrap_or_default();
	let include_completion = log
		.as_ref()
		.map(|l| l.cel.cel_context.needs_llm_completion())
		.unwrap_or_default();
	let provider = effective_policies.llm_provider.clone();
	let a2a = effective_policies.a2a;

	if let (Some(l), Some(info)) = (log.as_mut(), &llm_request) {
		l.llm_request = Some(info.clone());
	}

	Ok(Box::pin(async move {
		let resp = upstream
			.call(crate::client::Call {
				req,
				target,
				transport,
			})
			.await?;
		let mut resp = match (provider, llm_request) {
			(Some(provider), Some(llm_request)) => provider
				.provider
				.process_response(
					&client,
					llm_request,
					llm_response_policies,
					llm_log,
					include_completion,
					resp,
				)
				.await
				.map_err(|e| ProxyError::Processing(e.into()))?,
			_ => resp,
		};
		if a2a {
			crate::a2a::observe_response(&mut resp);
		}
		Ok(resp)
	}))
}

enum LLMPrepared {
	Forward(Request, LLMResponsePolicies, Option<llm::LLMRequest>),
	Direct(Response),
}

async fn prepare_llm_request(
	client: &PolicyClient,
	provider: &Arc<llm::NamedAIProvider>,
	policies: &LLMRequestPolicies,
	req: Request,
	log: &mut Option<&mut RequestLog>,
	response_policies: &mut ResponsePolicies,
) -> Result<LLMPrepared, ProxyResponse> {
	let route_type = provider.resolve_route(req.uri().path());
	trace!("llm: route {} as {route_type:?}", req.uri().path());
	match route_type {
		RouteType::Models => Ok(LLMPrepared::Direct(llm::models_response(std::slice::from_ref(
			provider,
		)))),
		RouteType::Passthrough | RouteType::Embeddings => {
			let mut req = req;
			provider
				.provider
				.setup_request(&mut req, route_type, None)
				.map_err(ProxyError::Processing)?;
			Ok(LLMPrepared::Forward(req, LLMResponsePolicies::default(), None))
		},
		RouteType::Completions | RouteType::Messages => {
			let result = match route_type {
				RouteType::Completions => {
					provider
						.provider
						.process_completions_request(
							client,
							policies.llm.as_deref(),
							req,
							provider.tokenize,
							log,
						)
						.await
				},
				_ => {
					provider
						.provider
						.process_messages_request(
							policies.llm.as_deref(),
							req,
							provider.tokenize,
							log,
						)
						.await
				},
			}
			.map_err(|e| ProxyError::Processing(e.into()))?;
			let (mut req, llm_request) = match result {
				RequestResult::Success(req, info) => (req, info),
				RequestResult::Rejected(resp) => return Ok(LLMPrepared::Direct(resp)),
			};
			provider
				.provider
				.setup_request(&mut req, route_type, Some(&llm_request))
				.map_err(ProxyError::Processing)?;

			// Rate limits charge the estimated cost now and true up later.
			for lrl in &policies.local_rate_limit {
				lrl.check_llm_request(&llm_request)?;
			}
			let remote_handle = match (&policies.remote_rate_limit, log.as_mut()) {
				(Some(rrl), Some(log)) => {
					let exec = log
						.cel
						.cel_context
						.build()
						.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
					let (resp, handle) = rrl
						.check_llm(
							client.clone(),
							&req,
							&exec,
							llm_request.input_tokens.unwrap_or_default(),
						)
						.await?;
					resp.apply(response_policies.headers())?;
					handle
				},
				_ => None,
			};
			Ok(LLMPrepared::Forward(
				req,
				LLMResponsePolicies {
					local_rate_limit: policies.local_rate_limit.clone(),
					remote_rate_limit: remote_handle,
					prompt_guard: policies
						.llm
						.as_deref()
						.and_then(|p| p.prompt_guard.as_ref())
						.and_then(|g| g.response.clone()),
				},
				Some(llm_request),
			))
		},
	}
}

fn set_backend_cel_context(log: &mut RequestLog) {
	if let (Some(protocol), Some(info)) = (log.backend_protocol, log.backend_info.clone()) {
		log.cel.ctx().with_backend(&info, protocol);
	}
}

async fn apply_request_to_cel(log: &mut RequestLog, req: &mut Request) {
	let tcp = log.tcp_info.clone();
	let tls = log.tls_info.clone();
	let start_time = log.start_time.clone();
	log.cel.ctx().with_source(&tcp, tls.as_ref());
	let needs_body = log.cel.ctx().with_request(req, start_time);
	if needs_body && let Ok(body) = http::inspect_body(req).await {
		log.cel.ctx().with_request_body(body);
	}
	if let Some(claims) = req.extensions().get::<crate::http::jwt::Claims>() {
		let claims = claims.clone();
		log.cel.ctx().with_jwt(&claims);
	}
}

fn maybe_set_grpc_status(log: &mut RequestLog, headers: &HeaderMap) {
	if let Some(s) = headers.get("grpc-status") {
		let parsed = s.to_str().ok().and_then(|s| s.parse::<u8>().ok());
		log.grpc_status.store(parsed);
	}
}

async fn handle_upgrade(
	req_upgrade: &mut Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade { upgrade, .. }) = std::mem::take(req_upgrade) else {
		return Err(ProxyError::UpgradeFailed);
	};
	let upstream_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or(ProxyError::UpgradeFailed)?;
	tokio::task::spawn(async move {
		let (upstream, downstream) = match tokio::join!(upstream_upgraded, upgrade) {
			(Ok(u), Ok(d)) => (u, d),
			(u, d) => {
				warn!("upgrade failed: up={:?} down={:?}", u.err(), d.err());
				return;
			},
		};
		let mut upstream = hyper_util::rt::TokioIo::new(upstream);
		let mut downstream = hyper_util::rt::TokioIo::new(downstream);
		let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
	});
	Ok(resp)
}

/// Hop-by-hop headers are stripped before dispatch (RFC 7230 §6.1).
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

struct RequestUpgrade {
	#[allow(dead_code)]
	upgrade_type: HeaderValue,
	upgrade: OnUpgrade,
}

fn hop_by_hop_headers(req: &mut Request) -> Option<RequestUpgrade> {
	let te_trailers = req
		.headers()
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade_type = upgrade_type(req.headers());
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	if te_trailers {
		req
			.headers_mut()
			.insert(header::TE, HeaderValue::from_static("trailers"));
	}
	// Re-add what protocol upgrades (websockets) need.
	if let Some(t) = upgrade_type.clone() {
		req
			.headers_mut()
			.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
		req.headers_mut().insert(header::UPGRADE, t);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	match (upgrade_type, on_upgrade) {
		(Some(upgrade_type), Some(upgrade)) => Some(RequestUpgrade {
			upgrade_type,
			upgrade,
		}),
		_ => None,
	}
}

fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	let is_upgrade = headers
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false);
	if is_upgrade {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

fn sensitive_headers(req: &mut Request) {
	for (name, value) in req.headers_mut() {
		if name == header::AUTHORIZATION {
			value.set_sensitive(true);
		}
	}
}

/// HTTP/1.1 requests carry the authority in the Host header; fold it into
/// the URI so the rest of the engine sees one form.
fn normalize_uri(connection: &Extension, req: &mut Request) -> anyhow::Result<()> {
	if matches!(req.version(), ::http::Version::HTTP_10 | ::http::Version::HTTP_11)
		&& req.uri().authority().is_none()
	{
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<http::Authority>().ok())
			.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
		req.headers_mut().remove(header::HOST);
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		parts.authority = Some(host);
		if parts.path_and_query.is_some() {
			parts.scheme = Some(if connection.get::<TLSConnectionInfo>().is_some() {
				http::Scheme::HTTPS
			} else {
				http::Scheme::HTTP
			});
		}
		*req.uri_mut() = http::Uri::from_parts(parts)?;
	}
	Ok(())
}

/// Response-phase policies, applied to every response including errors and
/// direct responses.
#[derive(Debug, Default)]
pub struct ResponsePolicies {
	pub timeout: Option<crate::http::timeout::Policy>,
	pub route_response_header: Option<crate::http::filters::HeaderModifier>,
	pub backend_response_header: Option<crate::http::filters::HeaderModifier>,
	pub transformation: Option<crate::http::transformation::Transformation>,
	pub gateway_transformation: Option<crate::http::transformation::Transformation>,
	pub response_headers: HeaderMap,
	pub cel_needed: bool,
}

impl ResponsePolicies {
	pub fn headers(&mut self) -> &mut HeaderMap {
		&mut self.response_headers
	}

	pub async fn apply(
		&mut self,
		resp: &mut Response,
		log: &mut RequestLog,
	) -> Result<(), ProxyResponse> {
		if let Some(h) = &self.route_response_header {
			h.apply(resp.headers_mut()).map_err(ProxyError::from)?;
		}
		if let Some(h) = &self.backend_response_header {
			h.apply(resp.headers_mut()).map_err(ProxyError::from)?;
		}
		if self.cel_needed {
			let exec = log
				.cel
				.cel_context
				.build()
				.map_err(|e| ProxyError::ProcessingString(e.to_string()))?;
			if let Some(t) = &self.transformation {
				t.apply_response(resp, &exec).map_err(ProxyError::from)?;
			}
			if let Some(t) = &self.gateway_transformation {
				t.apply_response(resp, &exec).map_err(ProxyError::from)?;
			}
		}
		// Headers staged by request-phase policies (CORS, rate limit info).
		http::merge_in_headers(Some(self.response_headers.clone()), resp.headers_mut());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::agent::{BackendReference, PathMatch, RouteMatch};

	fn route_with_weights(weights: &[usize]) -> Route {
		Route {
			key: "r".into(),
			route_name: "r".into(),
			rule_name: None,
			hostnames: vec![],
			matches: vec![RouteMatch {
				path: PathMatch::PathPrefix("/".into()),
				method: None,
				headers: vec![],
				query: vec![],
			}],
			backends: weights
				.iter()
				.enumerate()
				.map(|(i, w)| RouteBackendReference {
					weight: *w,
					backend: BackendReference::Backend(
						flowgate_core::strng::format!("b{i}"),
					),
					inline_policies: vec![],
				})
				.collect(),
			inline_policies: vec![],
		}
	}

	#[test]
	fn weight_selection_deterministic_with_single_nonzero() {
		let route = route_with_weights(&[1, 0, 0]);
		for _ in 0..100 {
			let selected = select_backend(&route).unwrap();
			assert_eq!(selected.backend.name(), "b0");
		}
	}

	#[test]
	fn all_zero_weights_select_nothing() {
		let route = route_with_weights(&[0, 0]);
		assert!(select_backend(&route).is_none());
		let route = route_with_weights(&[]);
		assert!(select_backend(&route).is_none());
	}

	#[test]
	fn normalize_uri_folds_host_header() {
		let connection = Extension::new();
		let mut req = ::http::Request::builder()
			.method("GET")
			.uri("/path?q=1")
			.header(header::HOST, "example.com:8080")
			.body(Body::empty())
			.unwrap();
		normalize_uri(&connection, &mut req).unwrap();
		assert_eq!(req.uri().host(), Some("example.com"));
		assert_eq!(req.uri().port_u16(), Some(8080));
		assert_eq!(req.uri().scheme_str(), Some("http"));
		assert!(req.headers().get(header::HOST).is_none());
	}

	#[test]
	fn normalize_uri_requires_some_authority() {
		let connection = Extension::new();
		let mut req = ::http::Request::builder()
			.method("GET")
			.uri("/path")
			.body(Body::empty())
			.unwrap();
		assert!(normalize_uri(&connection, &mut req).is_err());
	}

	#[test]
	fn hop_by_hop_headers_stripped() {
		let mut req = ::http::Request::builder()
			.uri("http://example.com/")
			.header(header::CONNECTION, "keep-alive")
			.header("keep-alive", "timeout=5")
			.header(header::TE, "trailers")
			.header(header::TRANSFER_ENCODING, "chunked")
			.body(Body::empty())
			.unwrap();
		let upgrade = hop_by_hop_headers(&mut req);
		assert!(upgrade.is_none());
		assert!(req.headers().get(header::CONNECTION).is_none());
		assert!(req.headers().get("keep-alive").is_none());
		assert!(req.headers().get(header::TRANSFER_ENCODING).is_none());
		// TE: trailers is re-added for gRPC.
		assert_eq!(req.headers().get(header::TE).unwrap(), "trailers");
	}

	#[test]
	fn upgrade_headers_preserved() {
		let mut req = ::http::Request::builder()
			.uri("http://example.com/")
			.header(header::CONNECTION, "Upgrade")
			.header(header::UPGRADE, "websocket")
			.body(Body::empty())
			.unwrap();
		let _ = hop_by_hop_headers(&mut req);
		assert_eq!(req.headers().get(header::UPGRADE).unwrap(), "websocket");
		assert_eq!(req.headers().get(header::CONNECTION).unwrap(), "upgrade");
	}
}
