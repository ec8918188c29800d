//! AWS event stream (`application/vnd.amazon.eventstream`) framing, used by
//! Bedrock streaming responses.
//!
//! Frame layout: total length (u32), headers length (u32), prelude CRC
//! (u32), headers, payload, message CRC (u32). Header values we care about
//! are `:event-type` / `:exception-type` strings.

use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub event_type: Option<String>,
	pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("frame too short")]
	Truncated,
	#[error("prelude crc mismatch")]
	PreludeCrc,
	#[error("message crc mismatch")]
	MessageCrc,
	#[error("malformed header block")]
	Headers,
}

#[derive(Default, Debug)]
pub struct Decoder {
	buf: BytesMut,
}

impl Decoder {
	pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Message>, Error> {
		self.buf.extend_from_slice(bytes);
		let mut out = vec![];
		loop {
			if self.buf.len() < 12 {
				return Ok(out);
			}
			let total_len = u32::from_be_bytes(self.buf[0..4].try_into().expect("4 bytes")) as usize;
			if total_len < 16 {
				return Err(Error::Truncated);
			}
			if self.buf.len() < total_len {
				return Ok(out);
			}
			let frame = self.buf.split_to(total_len);
			out.push(decode_frame(&frame)?);
		}
	}
}

fn decode_frame(frame: &[u8]) -> Result<Message, Error> {
	let headers_len = u32::from_be_bytes(frame[4..8].try_into().expect("4 bytes")) as usize;
	let prelude_crc = u32::from_be_bytes(frame[8..12].try_into().expect("4 bytes"));
	if crc32fast::hash(&frame[0..8]) != prelude_crc {
		return Err(Error::PreludeCrc);
	}
	let total_len = frame.len();
	if 12 + headers_len + 4 > total_len {
		return Err(Error::Truncated);
	}
	let message_crc =
		u32::from_be_bytes(frame[total_len - 4..].try_into().expect("4 bytes"));
	if crc32fast::hash(&frame[..total_len - 4]) != message_crc {
		return Err(Error::MessageCrc);
	}
	let headers = &frame[12..12 + headers_len];
	let payload = &frame[12 + headers_len..total_len - 4];
	let event_type = parse_headers(headers)?;
	Ok(Message {
		event_type,
		payload: payload.to_vec(),
	})
}

fn parse_headers(mut headers: &[u8]) -> Result<Option<String>, Error> {
	let mut event_type = None;
	while !headers.is_empty() {
		let name_len = headers[0] as usize;
		headers = &headers[1..];
		if headers.len() < name_len + 1 {
			return Err(Error::Headers);
		}
		let name = std::str::from_utf8(&headers[..name_len]).map_err(|_| Error::Headers)?;
		let name = name.to_string();
		headers = &headers[name_len..];
		let value_type = headers[0];
		headers = &headers[1..];
		match value_type {
			// string
			7 => {
				if headers.len() < 2 {
					return Err(Error::Headers);
				}
				let len = u16::from_be_bytes(headers[..2].try_into().expect("2 bytes")) as usize;
				headers = &headers[2..];
				if headers.len() < len {
					return Err(Error::Headers);
				}
				let value =
					std::str::from_utf8(&headers[..len]).map_err(|_| Error::Headers)?;
				if name == ":event-type" || name == ":exception-type" {
					event_type = Some(value.to_string());
				}
				headers = &headers[len..];
			},
			// bool true / bool false
			0 | 1 => {},
			// byte, i16, i32, i64, timestamp
			2 => headers = headers.get(1..).ok_or(Error::Headers)?,
			3 => headers = headers.get(2..).ok_or(Error::Headers)?,
			4 => headers = headers.get(4..).ok_or(Error::Headers)?,
			5 | 8 => headers = headers.get(8..).ok_or(Error::Headers)?,
			// byte array / uuid
			6 => {
				if headers.len() < 2 {
					return Err(Error::Headers);
				}
				let len = u16::from_be_bytes(headers[..2].try_into().expect("2 bytes")) as usize;
				headers = headers.get(2 + len..).ok_or(Error::Headers)?;
			},
			9 => headers = headers.get(16..).ok_or(Error::Headers)?,
			_ => return Err(Error::Headers),
		}
	}
	Ok(event_type)
}

/// Encode a message (used by tests and the tool that replays captures).
pub fn encode(event_type: &str, payload: &[u8]) -> Vec<u8> {
	let mut headers = vec![];
	let name = b":event-type";
	headers.push(name.len() as u8);
	headers.extend_from_slice(name);
	headers.push(7u8);
	headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
	headers.extend_from_slice(event_type.as_bytes());

	let total_len = 12 + headers.len() + payload.len() + 4;
	let mut out = Vec::with_capacity(total_len);
	out.extend_from_slice(&(total_len as u32).to_be_bytes());
	out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
	out.extend_from_slice(&crc32fast::hash(&out[0..8]).to_be_bytes());
	out.extend_from_slice(&headers);
	out.extend_from_slice(payload);
	out.extend_from_slice(&crc32fast::hash(&out).to_be_bytes());
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let encoded = encode("contentBlockDelta", b"{\"delta\":{\"text\":\"hi\"}}");
		let mut d = Decoder::default();
		let messages = d.push(&encoded).unwrap();
		assert_eq!(messages.len(), 1);
		assert_eq!(messages[0].event_type.as_deref(), Some("contentBlockDelta"));
		assert_eq!(messages[0].payload, b"{\"delta\":{\"text\":\"hi\"}}");
	}

	#[test]
	fn partial_frames_buffer() {
		let encoded = encode("messageStop", b"{}");
		let mut d = Decoder::default();
		let (a, b) = encoded.split_at(7);
		assert!(d.push(a).unwrap().is_empty());
		let messages = d.push(b).unwrap();
		assert_eq!(messages.len(), 1);
	}

	#[test]
	fn corrupt_crc_rejected() {
		let mut encoded = encode("messageStop", b"{}");
		let last = encoded.len() - 1;
		encoded[last] ^= 0xff;
		let mut d = Decoder::default();
		assert!(matches!(d.push(&encoded), Err(Error::MessageCrc)));
	}
}
