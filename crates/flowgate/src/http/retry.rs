use std::num::NonZeroU8;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use serde::{Deserialize, Serialize};

use crate::http::{Body, HeaderMap, StatusCode};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
	/// Total attempts against the upstream, including the first.
	pub attempts: NonZeroU8,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub backoff: Option<Duration>,
	#[serde(with = "codes_serde")]
	pub codes: Vec<StatusCode>,
}

impl Policy {
	pub fn should_retry_status(&self, status: StatusCode) -> bool {
		self.codes.contains(&status)
	}
}

mod codes_serde {
	use http::StatusCode;
	use serde::{Deserialize, Deserializer, Serializer};
	use serde::ser::SerializeSeq;

	pub fn serialize<S: Serializer>(codes: &[StatusCode], ser: S) -> Result<S::Ok, S::Error> {
		let mut seq = ser.serialize_seq(Some(codes.len()))?;
		for c in codes {
			seq.serialize_element(&c.as_u16())?;
		}
		seq.end()
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<StatusCode>, D::Error> {
		let raw = Vec::<u16>::deserialize(de)?;
		raw
			.into_iter()
			.map(|c| StatusCode::from_u16(c).map_err(serde::de::Error::custom))
			.collect()
	}
}

/// A request body that records the frames it yields so a retry can replay
/// them. Recording stops at `cap` bytes; a capped body refuses further
/// replays (the caller must give up on retries rather than send a truncated
/// request upstream).
///
/// Clones share state. Attempts run sequentially, so at most one instance
/// polls the inner body at a time.
pub struct ReplayBody {
	shared: Arc<Mutex<Shared>>,
	/// Index of the next recorded frame this instance will yield.
	cursor: usize,
}

struct Shared {
	inner: Option<Body>,
	recorded: Vec<RecordedFrame>,
	recorded_bytes: usize,
	cap: usize,
	capped: bool,
	finished: bool,
}

enum RecordedFrame {
	Data(Bytes),
	Trailers(HeaderMap),
}

impl ReplayBody {
	/// Fails (returning the body) when we already know the body cannot be
	/// buffered within `cap`.
	pub fn try_new(body: Body, cap: usize) -> Result<ReplayBody, Body> {
		if let Some(len) = body.size_hint().exact()
			&& len as usize > cap
		{
			return Err(body);
		}
		Ok(ReplayBody {
			shared: Arc::new(Mutex::new(Shared {
				inner: Some(body),
				recorded: Vec::new(),
				recorded_bytes: 0,
				cap,
				capped: false,
				finished: false,
			})),
			cursor: 0,
		})
	}

	/// Whether the recording exceeded the cap. `None` when the body has not
	/// been fully read yet (a retry may still be possible).
	pub fn is_capped(&self) -> Option<bool> {
		let s = self.shared.lock().expect("replay lock");
		if s.capped {
			Some(true)
		} else if s.finished {
			Some(false)
		} else {
			None
		}
	}
}

impl Clone for ReplayBody {
	fn clone(&self) -> Self {
		ReplayBody {
			shared: self.shared.clone(),
			cursor: 0,
		}
	}
}

impl HttpBody for ReplayBody {
	type Data = Bytes;
	type Error = axum_core::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = &mut *self;
		let mut s = this.shared.lock().expect("replay lock");

		// Replay anything already recorded.
		if this.cursor < s.recorded.len() {
			let frame = match &s.recorded[this.cursor] {
				RecordedFrame::Data(d) => Frame::data(d.clone()),
				RecordedFrame::Trailers(t) => Frame::trailers(t.clone()),
			};
			this.cursor += 1;
			return Poll::Ready(Some(Ok(frame)));
		}
		if s.finished {
			return Poll::Ready(None);
		}

		let Some(inner) = s.inner.as_mut() else {
			return Poll::Ready(None);
		};
		match ready!(Pin::new(inner).poll_frame(cx)) {
			None => {
				s.finished = true;
				s.inner = None;
				Poll::Ready(None)
			},
			Some(Err(e)) => Poll::Ready(Some(Err(e))),
			Some(Ok(frame)) => {
				let frame = match frame.into_data() {
					Ok(data) => {
						s.recorded_bytes += data.len();
						if s.recorded_bytes > s.cap {
							// Too large to replay; pass through without recording.
							s.capped = true;
							s.recorded.clear();
						} else if !s.capped {
							s.recorded.push(RecordedFrame::Data(data.clone()));
							this.cursor = s.recorded.len();
						}
						Frame::data(data)
					},
					Err(frame) => match frame.into_trailers() {
						Ok(trailers) => {
							if !s.capped {
								s.recorded.push(RecordedFrame::Trailers(trailers.clone()));
								this.cursor = s.recorded.len();
							}
							Frame::trailers(trailers)
						},
						Err(other) => other,
					},
				};
				Poll::Ready(Some(Ok(frame)))
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		let s = self.shared.lock().expect("replay lock");
		s.finished && self.cursor >= s.recorded.len()
	}

	fn size_hint(&self) -> SizeHint {
		let s = self.shared.lock().expect("replay lock");
		match s.inner.as_ref() {
			Some(inner) => inner.size_hint(),
			None => SizeHint::with_exact(
				s.recorded
					.iter()
					.map(|f| match f {
						RecordedFrame::Data(d) => d.len() as u64,
						RecordedFrame::Trailers(_) => 0,
					})
					.sum(),
			),
		}
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	async fn collect(b: impl HttpBody<Data = Bytes, Error = axum_core::Error>) -> Bytes {
		b.collect().await.unwrap().to_bytes()
	}

	#[tokio::test]
	async fn replays_identical_bytes() {
		let original = Body::from("hello world");
		let first = ReplayBody::try_new(original, 1024).unwrap();
		let second = first.clone();
		assert_eq!(collect(first).await, Bytes::from("hello world"));
		assert_eq!(collect(second).await, Bytes::from("hello world"));
	}

	#[tokio::test]
	async fn oversized_known_length_rejected_upfront() {
		let body = Body::from(vec![0u8; 100]);
		assert!(ReplayBody::try_new(body, 10).is_err());
	}

	#[tokio::test]
	async fn capped_after_streaming_too_much() {
		// Streamed body with no content-length.
		let stream = futures_util::stream::iter(vec![
			Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 40])),
			Ok(Bytes::from(vec![0u8; 40])),
		]);
		let body = Body::from_stream(stream);
		let first = ReplayBody::try_new(body, 50).unwrap();
		let clone = first.clone();
		let _ = collect(first).await;
		assert_eq!(clone.is_capped(), Some(true));
	}

	#[test]
	fn retry_policy_codes() {
		let p = Policy {
			attempts: NonZeroU8::new(2).unwrap(),
			backoff: None,
			codes: vec![StatusCode::BAD_GATEWAY],
		};
		assert!(p.should_retry_status(StatusCode::BAD_GATEWAY));
		assert!(!p.should_retry_status(StatusCode::OK));
	}
}
