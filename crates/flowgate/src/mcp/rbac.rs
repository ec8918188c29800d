use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cel::{ContextBuilder, Expression};

/// Per-resource authorization rules evaluated with the `mcp` CEL attribute
/// populated. A deny rejects the JSON-RPC call; the HTTP status stays 200.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McpAuthorization {
	#[serde(default)]
	pub allow: Vec<Arc<Expression>>,
	#[serde(default)]
	pub deny: Vec<Arc<Expression>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
	pub target: String,
	pub name: String,
}

impl ResourceId {
	pub fn new(target: String, name: String) -> ResourceId {
		ResourceId { target, name }
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
	Tool(ResourceId),
	Prompt(ResourceId),
	Resource(ResourceId),
}

impl McpAuthorization {
	pub fn iter_expressions(&self) -> impl Iterator<Item = &Expression> {
		self
			.allow
			.iter()
			.chain(self.deny.iter())
			.map(|e| e.as_ref())
	}

	pub fn validate(&self, resource: &ResourceType, ctx: &ContextBuilder) -> bool {
		let Ok(exec) = ctx.build_with_mcp(Some(resource)) else {
			return false;
		};
		if self.deny.iter().any(|rule| exec.eval_bool(rule)) {
			return false;
		}
		if self.allow.is_empty() {
			return true;
		}
		self.allow.iter().any(|rule| exec.eval_bool(rule))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rules(allow: &[&str]) -> McpAuthorization {
		McpAuthorization {
			allow: allow
				.iter()
				.map(|s| Arc::new(Expression::new_strict(*s).unwrap()))
				.collect(),
			deny: vec![],
		}
	}

	#[test]
	fn tool_name_rule() {
		let authz = rules(&["mcp.tool.name == 'echo'"]);
		let mut ctx = ContextBuilder::new();
		for e in authz.iter_expressions() {
			ctx.register_expression(e);
		}
		let allowed = ResourceType::Tool(ResourceId::new("a".to_string(), "echo".to_string()));
		let denied = ResourceType::Tool(ResourceId::new("a".to_string(), "drop".to_string()));
		assert!(authz.validate(&allowed, &ctx));
		assert!(!authz.validate(&denied, &ctx));
	}

	#[test]
	fn empty_rules_allow() {
		let authz = McpAuthorization::default();
		let ctx = ContextBuilder::new();
		let res = ResourceType::Tool(ResourceId::new("a".to_string(), "x".to_string()));
		assert!(authz.validate(&res, &ctx));
	}
}
