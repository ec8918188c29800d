//! Raw TCP routes: pick a backend by hostname (SNI for TLS listeners) and
//! weight, then splice bytes.

use std::sync::Arc;

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::ProxyInputs;
use crate::client::TCPCall;
use crate::transport::stream::{Socket, TLSConnectionInfo};
use crate::types::agent::{HostnameMatch, Listener, TCPRoute};

pub async fn proxy(pi: Arc<ProxyInputs>, listener: Arc<Listener>, stream: Socket) {
	let snapshot = pi.store.current();
	let sni = stream
		.ext::<TLSConnectionInfo>()
		.and_then(|t| t.server_name);
	let Some(route) = select_route(&listener, sni.as_deref()) else {
		debug!(listener = %listener.key, "no TCP route for connection");
		return;
	};

	let Some(backend_ref) = route
		.backends
		.choose_weighted(&mut rand::rng(), |b| b.weight)
		.ok()
	else {
		debug!(route = %route.key, "no valid TCP backends");
		return;
	};
	let backend = match snapshot.resolve_simple_backend(&backend_ref.backend) {
		Ok(b) => b,
		Err(e) => {
			warn!(route = %route.key, "failed to resolve backend: {e}");
			return;
		},
	};
	let policies = snapshot.backend_policies(backend.name(), None, &[]);
	let (target, transport) = match &backend {
		crate::types::agent::SimpleBackend::Service(svc, port) => {
			let Some(ip) = svc.endpoints.first() else {
				warn!(route = %route.key, "service has no endpoints");
				return;
			};
			let target_port = svc.ports.get(port).copied().unwrap_or(*port);
			(
				crate::types::agent::Target::Address(std::net::SocketAddr::from((
					*ip,
					target_port,
				))),
				policies.backend_tls.clone().into(),
			)
		},
		crate::types::agent::SimpleBackend::Opaque(_, target) => {
			(target.clone(), policies.backend_tls.clone().into())
		},
		crate::types::agent::SimpleBackend::Invalid => return,
	};

	if let Err(e) = pi
		.upstream
		.call_tcp(TCPCall {
			source: stream,
			target,
			transport,
		})
		.await
	{
		debug!(route = %route.key, "tcp proxy ended: {e}");
	}
}

fn select_route<'a>(listener: &'a Listener, sni: Option<&str>) -> Option<&'a TCPRoute> {
	match sni {
		Some(host) => {
			for hm in HostnameMatch::all_matches(host) {
				if let Some(r) = listener.tcp_routes.iter().find(|r| {
					if r.hostnames.is_empty() {
						hm == HostnameMatch::None
					} else {
						r.hostnames.iter().any(|h| HostnameMatch::from(h.clone()) == hm)
					}
				}) {
					return Some(r);
				}
			}
			None
		},
		None => listener.tcp_routes.first(),
	}
}
