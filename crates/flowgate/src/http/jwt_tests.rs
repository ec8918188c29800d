use base64::Engine;
use jsonwebtoken::{EncodingKey, Header};

use super::*;
use crate::http::Body;

const SECRET: &[u8] = b"test-secret-test-secret-test-1234";

fn jwks_json() -> String {
	let k = base64::prelude::BASE64_URL_SAFE_NO_PAD.encode(SECRET);
	serde_json::json!({
		"keys": [{
			"kty": "oct",
			"kid": "k1",
			"alg": "HS256",
			"k": k,
		}]
	})
	.to_string()
}

fn policy(mode: Mode) -> Jwt {
	LocalJwtConfig {
		mode,
		issuer: "https://issuer.test".to_string(),
		audiences: Some(vec!["gateway".to_string()]),
		jwks: JwksSource::Inline(jwks_json()),
	}
	.build()
	.unwrap()
}

fn token(iss: &str, aud: &str) -> String {
	let exp = chrono::Utc::now().timestamp() + 600;
	let claims = serde_json::json!({
		"iss": iss,
		"aud": aud,
		"sub": "alice",
		"exp": exp,
	});
	let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
	header.kid = Some("k1".to_string());
	jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn request(token: Option<&str>) -> Request {
	let mut b = ::http::Request::builder().uri("http://example.com/");
	if let Some(t) = token {
		b = b.header(header::AUTHORIZATION, format!("Bearer {t}"));
	}
	b.body(Body::empty()).unwrap()
}

#[test]
fn valid_token_yields_claims() {
	let jwt = policy(Mode::Strict);
	let req = request(Some(&token("https://issuer.test", "gateway")));
	let claims = jwt.validate(&req).unwrap();
	assert_eq!(claims.sub(), Some("alice"));
}

#[test]
fn wrong_issuer_rejected() {
	let jwt = policy(Mode::Strict);
	let req = request(Some(&token("https://other.test", "gateway")));
	assert!(matches!(jwt.validate(&req), Err(TokenError::Invalid(_))));
}

#[test]
fn wrong_audience_rejected() {
	let jwt = policy(Mode::Strict);
	let req = request(Some(&token("https://issuer.test", "someone-else")));
	assert!(matches!(jwt.validate(&req), Err(TokenError::Invalid(_))));
}

#[test]
fn missing_token() {
	let jwt = policy(Mode::Strict);
	assert!(matches!(
		jwt.validate(&request(None)),
		Err(TokenError::MissingToken)
	));
}

#[test]
fn malformed_authorization_header() {
	let jwt = policy(Mode::Strict);
	let req = ::http::Request::builder()
		.uri("http://example.com/")
		.header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
		.body(Body::empty())
		.unwrap();
	assert!(matches!(
		jwt.validate(&req),
		Err(TokenError::MalformedToken)
	));
}
