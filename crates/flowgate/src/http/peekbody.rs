use bytes::Bytes;

use crate::http::Body;

/// Buffer a body up to `limit` bytes and put the bytes back, so callers can
/// look at the payload without consuming the stream.
pub async fn inspect_body(body: &mut Body, limit: usize) -> anyhow::Result<Bytes> {
	let taken = std::mem::take(body);
	let bytes = crate::http::read_body_with_limit(taken, limit)
		.await
		.map_err(|e| anyhow::anyhow!("body read: {e}"))?;
	*body = Body::from(bytes.clone());
	Ok(bytes)
}
