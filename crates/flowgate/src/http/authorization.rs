use serde::{Deserialize, Serialize};

use crate::cel::{Executor, Expression};

/// CEL-based authorization. Rules are evaluated in order: an explicit deny
/// wins over any allow; at least one allow must match if any allow rules
/// exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleSet {
	#[serde(default)]
	pub allow: Vec<std::sync::Arc<Expression>>,
	#[serde(default)]
	pub deny: Vec<std::sync::Arc<Expression>>,
}

#[derive(thiserror::Error, Debug)]
#[error("authorization denied")]
pub struct Denied;

impl RuleSet {
	pub fn iter_expressions(&self) -> impl Iterator<Item = &Expression> {
		self
			.allow
			.iter()
			.chain(self.deny.iter())
			.map(|e| e.as_ref())
	}

	pub fn validate(&self, exec: &Executor) -> bool {
		if self.deny.iter().any(|rule| exec.eval_bool(rule)) {
			return false;
		}
		if self.allow.is_empty() {
			return true;
		}
		self.allow.iter().any(|rule| exec.eval_bool(rule))
	}

	pub fn apply(&self, exec: &Executor) -> Result<(), Denied> {
		if self.validate(exec) { Ok(()) } else { Err(Denied) }
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::cel::ContextBuilder;
	use crate::http::Body;

	fn exec_for(cb: &ContextBuilder) -> Executor<'static> {
		cb.build().unwrap()
	}

	fn rules(allow: &[&str], deny: &[&str]) -> RuleSet {
		RuleSet {
			allow: allow
				.iter()
				.map(|s| Arc::new(Expression::new_strict(*s).unwrap()))
				.collect(),
			deny: deny
				.iter()
				.map(|s| Arc::new(Expression::new_strict(*s).unwrap()))
				.collect(),
		}
	}

	fn context_with_get() -> ContextBuilder {
		let mut cb = ContextBuilder::new();
		let rs = rules(&["request.method == 'GET'"], &[]);
		for e in rs.iter_expressions() {
			cb.register_expression(e);
		}
		let req = ::http::Request::builder()
			.method("GET")
			.uri("http://example.com/")
			.body(Body::empty())
			.unwrap();
		cb.with_request(&req, "t".to_string());
		cb
	}

	#[test]
	fn allow_matches() {
		let cb = context_with_get();
		let rs = rules(&["request.method == 'GET'"], &[]);
		assert!(rs.validate(&exec_for(&cb)));
	}

	#[test]
	fn deny_wins_over_allow() {
		let cb = context_with_get();
		let rs = rules(&["request.method == 'GET'"], &["request.method == 'GET'"]);
		assert!(!rs.validate(&exec_for(&cb)));
	}

	#[test]
	fn empty_allow_list_permits() {
		let cb = context_with_get();
		let rs = rules(&[], &["request.method == 'DELETE'"]);
		assert!(rs.validate(&exec_for(&cb)));
	}

	#[test]
	fn no_allow_match_denies() {
		let cb = context_with_get();
		let rs = rules(&["request.method == 'POST'"], &[]);
		assert!(!rs.validate(&exec_for(&cb)));
	}
}
