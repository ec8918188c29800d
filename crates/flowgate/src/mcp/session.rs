use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::Rng;
use serde_json::Value;

use crate::http::{Response, StatusCode, header};
use crate::mcp::relay::Relay;
use crate::mcp::{MCPInfo, upstream};
use crate::telemetry::log::AsyncLog;

const SHARDS: usize = 16;

/// One client session: the relay that owns its upstream connections.
#[derive(Clone, Debug)]
pub struct Session {
	pub id: Arc<str>,
	pub created_at: Instant,
	relay: Arc<Relay>,
}

impl Session {
	pub async fn handle(
		&self,
		parts: &::http::request::Parts,
		message: Value,
		log: &AsyncLog<MCPInfo>,
	) -> Result<Response, upstream::UpstreamError> {
		self.relay.handle(parts, message, log).await
	}

	/// The standing GET stream for server-initiated messages. We emit
	/// keep-alive comments; upstream pushes are forwarded when transports
	/// support them.
	pub async fn serve_stream(&self) -> Response {
		let stream = futures_util::stream::unfold((), |()| async {
			tokio::time::sleep(std::time::Duration::from_secs(15)).await;
			Some((
				Ok::<_, std::convert::Infallible>(bytes::Bytes::from_static(b": keep-alive\n\n")),
				(),
			))
		});
		::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/event-stream")
			.header(header::CACHE_CONTROL, "no-cache")
			.body(crate::http::Body::from_stream(stream))
			.expect("static response must build")
	}

	pub async fn shutdown(&self) {
		self.relay.shutdown().await;
	}
}

/// The session registry: a sharded map keyed by session id.
#[derive(Debug, Default)]
pub struct SessionManager {
	shards: [RwLock<HashMap<String, Session>>; SHARDS],
}

impl SessionManager {
	fn shard(&self, id: &str) -> &RwLock<HashMap<String, Session>> {
		let mut hash = 0usize;
		for b in id.as_bytes() {
			hash = hash.wrapping_mul(31).wrapping_add(*b as usize);
		}
		&self.shards[hash % SHARDS]
	}

	pub fn get(&self, id: &str) -> Option<Session> {
		self.shard(id).read().expect("session shard").get(id).cloned()
	}

	pub fn create(&self, relay: Relay) -> Session {
		let id = new_session_id();
		let session = Session {
			id: id.clone().into(),
			created_at: Instant::now(),
			relay: Arc::new(relay),
		};
		self
			.shard(&id)
			.write()
			.expect("session shard")
			.insert(id, session.clone());
		session
	}

	pub async fn remove(&self, id: &str) -> Option<Session> {
		let session = self.shard(id).write().expect("session shard").remove(id)?;
		session.shutdown().await;
		Some(session)
	}
}

fn new_session_id() -> String {
	let mut rng = rand::rng();
	let bytes: [u8; 16] = rng.random();
	hex::encode(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_ids_are_unique() {
		let a = new_session_id();
		let b = new_session_id();
		assert_ne!(a, b);
		assert_eq!(a.len(), 32);
	}
}
