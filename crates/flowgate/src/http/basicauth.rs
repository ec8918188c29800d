use base64::Engine;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::http::{Request, StatusCode, header};
use crate::proxy::{ProxyError, ProxyResponse};
use crate::telemetry::log::RequestLog;

/// Basic authentication against an htpasswd-format credential list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BasicAuthentication {
	/// htpasswd file contents (bcrypt or md5-crypt entries).
	pub users: Strng,
	#[serde(default)]
	pub realm: Option<Strng>,
}

/// Exposed to CEL as the `basicAuth` attribute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
	pub username: String,
}

impl BasicAuthentication {
	pub async fn apply(
		&self,
		log: &mut RequestLog,
		req: &mut Request,
	) -> Result<(), ProxyResponse> {
		match self.verify(req) {
			Some(username) => {
				let claims = Claims { username };
				log.cel.ctx().with_basic_auth(&claims);
				req.extensions_mut().insert(claims);
				// Credentials are consumed at the gateway.
				req.headers_mut().remove(header::AUTHORIZATION);
				Ok(())
			},
			None => {
				let realm = self.realm.as_deref().unwrap_or("restricted");
				let resp = ::http::Response::builder()
					.status(StatusCode::UNAUTHORIZED)
					.header(
						header::WWW_AUTHENTICATE,
						format!("Basic realm=\"{realm}\""),
					)
					.body(crate::http::Body::empty())
					.map_err(|e| ProxyError::Processing(e.into()))?;
				Err(ProxyResponse::DirectResponse(Box::new(resp)))
			},
		}
	}

	fn verify(&self, req: &Request) -> Option<String> {
		let auth = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
		let encoded = auth.strip_prefix("Basic ")?;
		let decoded = base64::prelude::BASE64_STANDARD.decode(encoded).ok()?;
		let decoded = String::from_utf8(decoded).ok()?;
		let (user, pass) = decoded.split_once(':')?;
		let htpasswd = htpasswd_verify::Htpasswd::from(self.users.as_str());
		htpasswd.check(user, pass).then(|| user.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	// user: test, password: password (md5-crypt htpasswd entry)
	const HTPASSWD: &str = "test:$apr1$DMx2UDwc$gjzGzAMqlxNun6M2AJHAI/";

	fn req(user_pass: Option<&str>) -> Request {
		let mut b = ::http::Request::builder().uri("http://example.com/");
		if let Some(up) = user_pass {
			let enc = base64::prelude::BASE64_STANDARD.encode(up);
			b = b.header(header::AUTHORIZATION, format!("Basic {enc}"));
		}
		b.body(Body::empty()).unwrap()
	}

	#[test]
	fn valid_credentials() {
		let ba = BasicAuthentication {
			users: HTPASSWD.into(),
			realm: None,
		};
		assert_eq!(ba.verify(&req(Some("test:password"))), Some("test".into()));
	}

	#[test]
	fn wrong_password() {
		let ba = BasicAuthentication {
			users: HTPASSWD.into(),
			realm: None,
		};
		assert_eq!(ba.verify(&req(Some("test:nope"))), None);
		assert_eq!(ba.verify(&req(None)), None);
	}
}
