use super::*;
use crate::http::Body;

fn request() -> crate::http::Request {
	::http::Request::builder()
		.method("GET")
		.uri("http://example.com/path?x=1")
		.header("x-user", "alice")
		.body(Body::empty())
		.unwrap()
}

fn eval_against_request(expr: &str) -> Value {
	let e = Expression::new_strict(expr).unwrap();
	let mut cb = ContextBuilder::new();
	cb.register_expression(&e);
	cb.with_request(&request(), "2025-01-01T00:00:00Z".to_string());
	let exec = cb.build().unwrap();
	exec.eval(&e).unwrap()
}

#[test]
fn request_attributes() {
	assert_eq!(
		eval_against_request("request.method"),
		Value::String("GET".to_string().into())
	);
	assert_eq!(
		eval_against_request("request.path"),
		Value::String("/path".to_string().into())
	);
	assert_eq!(
		eval_against_request(r#"request.headers["x-user"]"#),
		Value::String("alice".to_string().into())
	);
}

#[test]
fn body_access_requires_buffering() {
	let plain = Expression::new_strict("request.method == 'GET'").unwrap();
	assert!(!plain.attributes().contains(REQUEST_BODY_ATTRIBUTE));

	let body = Expression::new_strict("request.body.contains('x')").unwrap();
	assert!(body.attributes().contains(REQUEST_BODY_ATTRIBUTE));

	let mut cb = ContextBuilder::new();
	cb.register_expression(&body);
	let needs_body = cb.with_request(&request(), "t".to_string());
	assert!(needs_body);
}

#[test]
fn absent_attribute_is_false_in_bool_position() {
	let e = Expression::new_strict("jwt.sub == 'admin'").unwrap();
	let mut cb = ContextBuilder::new();
	cb.register_expression(&e);
	cb.with_request(&request(), "t".to_string());
	let exec = cb.build().unwrap();
	assert!(!exec.eval_bool(&e));
}

#[test]
fn jwt_claims_visible_after_auth() {
	let e = Expression::new_strict("jwt.sub == 'admin'").unwrap();
	let mut cb = ContextBuilder::new();
	cb.register_expression(&e);
	let claims = jwt::Claims::from_map(
		serde_json::json!({"sub": "admin", "iss": "test"})
			.as_object()
			.unwrap()
			.clone(),
	);
	cb.with_jwt(&claims);
	let exec = cb.build().unwrap();
	assert!(exec.eval_bool(&e));
}

#[test]
fn invalid_expression_strict_vs_permissive() {
	assert!(Expression::new_strict("request.method ==").is_err());
	let p = Expression::new_permissive("request.method ==");
	let cb = ContextBuilder::new();
	let exec = cb.build().unwrap();
	assert!(!exec.eval_bool(&p));
}

#[test]
fn unregistered_attribute_not_materialized() {
	let e = Expression::new_strict("request.method").unwrap();
	let mut cb = ContextBuilder::new();
	// Intentionally not registered: the request should not be captured.
	let needs_body = cb.with_request(&request(), "t".to_string());
	assert!(!needs_body);
	assert!(cb.context.request.is_none());
	let _ = e;
}
