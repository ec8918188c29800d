use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cel::{Executor, Expression};
use crate::http::{HeaderName, Request, Response, header};

/// CEL-driven request/response transformation: header add/set/remove and
/// whole-body replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Transformation {
	#[serde(default)]
	pub request: Option<Transform>,
	#[serde(default)]
	pub response: Option<Transform>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Transform {
	#[serde(default)]
	pub add: Vec<(String, Arc<Expression>)>,
	#[serde(default)]
	pub set: Vec<(String, Arc<Expression>)>,
	#[serde(default)]
	pub remove: Vec<String>,
	#[serde(default)]
	pub body: Option<Arc<Expression>>,
}

#[derive(thiserror::Error, Debug)]
#[error("transformation failed: {0}")]
pub struct Error(String);

impl Transformation {
	pub fn iter_expressions(&self) -> impl Iterator<Item = &Expression> {
		self
			.request
			.iter()
			.chain(self.response.iter())
			.flat_map(|t| {
				t.add
					.iter()
					.map(|(_, e)| e.as_ref())
					.chain(t.set.iter().map(|(_, e)| e.as_ref()))
					.chain(t.body.iter().map(|e| e.as_ref()))
			})
	}

	pub fn apply_request(&self, req: &mut Request, exec: &Executor) -> Result<(), Error> {
		let Some(t) = &self.request else {
			return Ok(());
		};
		t.apply_headers(req.headers_mut(), exec)?;
		if let Some(body_expr) = &t.body {
			let rendered = render_body(body_expr, exec)?;
			req.headers_mut().remove(header::CONTENT_LENGTH);
			*req.body_mut() = crate::http::Body::from(rendered);
		}
		Ok(())
	}

	pub fn apply_response(&self, resp: &mut Response, exec: &Executor) -> Result<(), Error> {
		let Some(t) = &self.response else {
			return Ok(());
		};
		t.apply_headers(resp.headers_mut(), exec)?;
		if let Some(body_expr) = &t.body {
			let rendered = render_body(body_expr, exec)?;
			resp.headers_mut().remove(header::CONTENT_LENGTH);
			*resp.body_mut() = crate::http::Body::from(rendered);
		}
		Ok(())
	}
}

impl Transform {
	fn apply_headers(
		&self,
		headers: &mut crate::http::HeaderMap,
		exec: &Executor,
	) -> Result<(), Error> {
		for (name, expr) in &self.add {
			let name = HeaderName::try_from(name.as_str()).map_err(|e| Error(e.to_string()))?;
			if let Some(v) = eval_header(expr, exec)? {
				headers.append(name, v);
			}
		}
		for (name, expr) in &self.set {
			let name = HeaderName::try_from(name.as_str()).map_err(|e| Error(e.to_string()))?;
			match eval_header(expr, exec)? {
				Some(v) => {
					headers.insert(name, v);
				},
				None => {
					headers.remove(name);
				},
			}
		}
		for name in &self.remove {
			if let Ok(name) = HeaderName::try_from(name.as_str()) {
				headers.remove(name);
			}
		}
		Ok(())
	}
}

fn eval_header(
	expr: &Expression,
	exec: &Executor,
) -> Result<Option<crate::http::HeaderValue>, Error> {
	let v = exec.eval(expr).map_err(|e| Error(e.to_string()))?;
	if matches!(v, crate::cel::Value::Null) {
		return Ok(None);
	}
	Ok(crate::cel::value_as_header_value(&v))
}

fn render_body(expr: &Expression, exec: &Executor) -> Result<String, Error> {
	let v = exec.eval(expr).map_err(|e| Error(e.to_string()))?;
	if let Some(s) = crate::cel::value_as_string(&v) {
		return Ok(s);
	}
	crate::cel::value_as_json(&v)
		.map(|j| j.to_string())
		.ok_or_else(|| Error("body expression produced an unrenderable value".to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cel::ContextBuilder;
	use crate::http::Body;

	#[test]
	fn header_set_from_request_attribute() {
		let t = Transformation {
			request: Some(Transform {
				set: vec![(
					"x-method".to_string(),
					Arc::new(Expression::new_strict("request.method").unwrap()),
				)],
				..Default::default()
			}),
			response: None,
		};
		let mut cb = ContextBuilder::new();
		for e in t.iter_expressions() {
			cb.register_expression(e);
		}
		let mut req = ::http::Request::builder()
			.method("POST")
			.uri("http://example.com/")
			.body(Body::empty())
			.unwrap();
		cb.with_request(&req, "t".to_string());
		let exec = cb.build().unwrap();
		t.apply_request(&mut req, &exec).unwrap();
		assert_eq!(req.headers().get("x-method").unwrap(), "POST");
	}

	#[test]
	fn body_render_error_is_surfaced() {
		let t = Transformation {
			request: Some(Transform {
				body: Some(Arc::new(Expression::new_strict("request.missing_thing").unwrap())),
				..Default::default()
			}),
			response: None,
		};
		let mut cb = ContextBuilder::new();
		for e in t.iter_expressions() {
			cb.register_expression(e);
		}
		let mut req = ::http::Request::builder()
			.uri("http://example.com/")
			.body(Body::empty())
			.unwrap();
		cb.with_request(&req, "t".to_string());
		let exec = cb.build().unwrap();
		assert!(t.apply_request(&mut req, &exec).is_err());
	}
}
