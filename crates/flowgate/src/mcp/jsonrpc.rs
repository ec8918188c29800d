//! A thin JSON-RPC 2.0 layer.
//!
//! The gateway multiplexes MCP traffic rather than consuming it, so messages
//! are kept as JSON values: only the envelope and the specific fields being
//! rewritten (ids, tool names) are interpreted. Unknown fields always pass
//! through untouched.

use serde_json::{Value, json};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
	Request,
	Notification,
	Response,
}

pub fn classify(message: &Value) -> MessageKind {
	if message.get("method").is_some() {
		if message.get("id").is_some() {
			MessageKind::Request
		} else {
			MessageKind::Notification
		}
	} else {
		MessageKind::Response
	}
}

pub fn request(id: Value, method: &str, params: Value) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id,
		"method": method,
		"params": params,
	})
}

pub fn notification(method: &str, params: Value) -> Value {
	json!({
		"jsonrpc": "2.0",
		"method": method,
		"params": params,
	})
}

pub fn response(id: Option<Value>, result: Value) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id.unwrap_or(Value::Null),
		"result": result,
	})
}

pub fn error_object(id: Option<Value>, code: i64, message: String) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id.unwrap_or(Value::Null),
		"error": {
			"code": code,
			"message": message,
		},
	})
}

pub fn is_error(message: &Value) -> bool {
	message.get("error").is_some()
}

pub fn result_of(message: &Value) -> Option<&Value> {
	message.get("result")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classification() {
		assert_eq!(
			classify(&request(json!(1), "tools/list", json!({}))),
			MessageKind::Request
		);
		assert_eq!(
			classify(&notification("notifications/initialized", json!({}))),
			MessageKind::Notification
		);
		assert_eq!(
			classify(&response(Some(json!(1)), json!({}))),
			MessageKind::Response
		);
	}
}
