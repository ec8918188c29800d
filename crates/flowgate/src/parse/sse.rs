//! Incremental server-sent-events parsing.
//!
//! The passthrough body re-emits upstream bytes unchanged while feeding each
//! complete `data:` payload to an observer. Used by the LLM layer to keep a
//! rolling token count without buffering the stream.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use serde::de::DeserializeOwned;

use crate::http::Body;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub event: Option<String>,
	pub data: String,
}

/// Incremental parser: push bytes, get complete events.
#[derive(Debug)]
pub struct Parser {
	buf: BytesMut,
	overflowed: bool,
	limit: usize,
}

impl Parser {
	pub fn new(limit: usize) -> Parser {
		Parser {
			buf: BytesMut::new(),
			overflowed: false,
			limit,
		}
	}

	pub fn push(&mut self, bytes: &[u8]) -> Vec<Event> {
		if self.overflowed {
			return vec![];
		}
		if self.buf.len() + bytes.len() > self.limit {
			// An event larger than the buffer limit; stop observing rather
			// than stall the stream.
			self.overflowed = true;
			self.buf.clear();
			return vec![];
		}
		self.buf.extend_from_slice(bytes);
		let mut events = vec![];
		// Events are terminated by a blank line.
		while let Some(end) = find_event_end(&self.buf) {
			let raw = self.buf.split_to(end.index + end.len);
			if let Some(event) = parse_event(&raw[..end.index]) {
				events.push(event);
			}
		}
		events
	}
}

struct EventEnd {
	index: usize,
	len: usize,
}

fn find_event_end(buf: &[u8]) -> Option<EventEnd> {
	for i in 0..buf.len() {
		if buf[i..].starts_with(b"\n\n") {
			return Some(EventEnd { index: i, len: 2 });
		}
		if buf[i..].starts_with(b"\r\n\r\n") {
			return Some(EventEnd { index: i, len: 4 });
		}
	}
	None
}

fn parse_event(raw: &[u8]) -> Option<Event> {
	let text = std::str::from_utf8(raw).ok()?;
	let mut event = None;
	let mut data_lines = vec![];
	for line in text.lines() {
		if let Some(rest) = line.strip_prefix("data:") {
			data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
		} else if let Some(rest) = line.strip_prefix("event:") {
			event = Some(rest.trim().to_string());
		}
		// Comments (`:`) and ids are ignored.
	}
	if data_lines.is_empty() && event.is_none() {
		return None;
	}
	Some(Event {
		event,
		data: data_lines.join("\n"),
	})
}

/// Encode an event for the wire.
pub fn encode_event(event: &Event) -> Bytes {
	let mut out = String::new();
	if let Some(e) = &event.event {
		out.push_str("event: ");
		out.push_str(e);
		out.push('\n');
	}
	for line in event.data.split('\n') {
		out.push_str("data: ");
		out.push_str(line);
		out.push('\n');
	}
	out.push('\n');
	Bytes::from(out)
}

/// Pass the body through unchanged, feeding each JSON `data:` payload to the
/// observer. `[DONE]` markers are skipped; the observer is called with `None`
/// once at end of stream.
pub fn json_passthrough<T: DeserializeOwned>(
	body: Body,
	limit: usize,
	observer: impl FnMut(Option<Result<T, serde_json::Error>>) + Send + 'static,
) -> Body {
	Body::new(JsonPassthrough {
		inner: body,
		parser: Parser::new(limit),
		observer: Box::new(observer),
		done: false,
		_marker: std::marker::PhantomData::<fn() -> T>,
	})
}

/// Rewrite an SSE stream: each parsed event maps to zero or more output
/// chunks; `None` marks end of stream and may emit a final chunk (e.g. a
/// trailing `[DONE]`).
pub fn transform(
	body: Body,
	limit: usize,
	f: impl FnMut(Option<Event>) -> Vec<Bytes> + Send + 'static,
) -> Body {
	Body::new(Transform {
		inner: body,
		parser: Parser::new(limit),
		f: Box::new(f),
		pending: std::collections::VecDeque::new(),
		done: false,
	})
}

struct Transform {
	inner: Body,
	parser: Parser,
	f: Box<dyn FnMut(Option<Event>) -> Vec<Bytes> + Send>,
	pending: std::collections::VecDeque<Bytes>,
	done: bool,
}

impl HttpBody for Transform {
	type Data = Bytes;
	type Error = axum_core::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = &mut *self;
		loop {
			if let Some(chunk) = this.pending.pop_front() {
				return Poll::Ready(Some(Ok(Frame::data(chunk))));
			}
			if this.done {
				return Poll::Ready(None);
			}
			match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
				Some(Ok(frame)) => {
					if let Some(data) = frame.data_ref() {
						for event in this.parser.push(data) {
							this.pending.extend((this.f)(Some(event)));
						}
					}
				},
				Some(Err(e)) => return Poll::Ready(Some(Err(e))),
				None => {
					this.done = true;
					this.pending.extend((this.f)(None));
				},
			}
		}
	}

	fn is_end_stream(&self) -> bool {
		self.done && self.pending.is_empty()
	}

	fn size_hint(&self) -> SizeHint {
		SizeHint::default()
	}
}

struct JsonPassthrough<T> {
	inner: Body,
	parser: Parser,
	observer: Box<dyn FnMut(Option<Result<T, serde_json::Error>>) + Send>,
	done: bool,
	_marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> HttpBody for JsonPassthrough<T> {
	type Data = Bytes;
	type Error = axum_core::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = &mut *self;
		let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
		match frame {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					for event in this.parser.push(data) {
						if event.data.trim() == "[DONE]" {
							continue;
						}
						(this.observer)(Some(serde_json::from_str::<T>(&event.data)));
					}
				}
				Poll::Ready(Some(Ok(frame)))
			},
			Some(Err(e)) => Poll::Ready(Some(Err(e))),
			None => {
				if !this.done {
					this.done = true;
					(this.observer)(None);
				}
				Poll::Ready(None)
			},
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_split_events() {
		let mut p = Parser::new(1024);
		assert!(p.push(b"data: {\"a\":").is_empty());
		let events = p.push(b"1}\n\ndata: [DONE]\n\n");
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].data, "{\"a\":1}");
		assert_eq!(events[1].data, "[DONE]");
	}

	#[test]
	fn multiline_data_joined() {
		let mut p = Parser::new(1024);
		let events = p.push(b"data: line1\ndata: line2\n\n");
		assert_eq!(events[0].data, "line1\nline2");
	}

	#[test]
	fn named_events() {
		let mut p = Parser::new(1024);
		let events = p.push(b"event: message_start\ndata: {}\n\n");
		assert_eq!(events[0].event.as_deref(), Some("message_start"));
	}

	#[test]
	fn crlf_events() {
		let mut p = Parser::new(1024);
		let events = p.push(b"data: x\r\n\r\n");
		assert_eq!(events[0].data, "x");
	}

	#[test]
	fn encode_round_trips() {
		let e = Event {
			event: Some("delta".to_string()),
			data: "{\"x\":1}".to_string(),
		};
		let encoded = encode_event(&e);
		let mut p = Parser::new(1024);
		let parsed = p.push(&encoded);
		assert_eq!(parsed, vec![e]);
	}

	#[tokio::test]
	async fn json_passthrough_preserves_bytes() {
		use http_body_util::BodyExt;
		let input = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n";
		let body = Body::from(input);
		let seen = std::sync::Arc::new(std::sync::Mutex::new(vec![]));
		let seen2 = seen.clone();
		let wrapped = json_passthrough::<serde_json::Value>(body, 1024, move |v| {
			if let Some(Ok(v)) = v {
				seen2.lock().unwrap().push(v["n"].as_i64().unwrap());
			}
		});
		let out = wrapped.collect().await.unwrap().to_bytes();
		assert_eq!(out, Bytes::from(input));
		assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
	}
}
