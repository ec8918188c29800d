use serde_json::json;

use super::*;

fn openai_provider() -> AIProvider {
	AIProvider::OpenAI(openai::Provider { model: None })
}

fn named(provider: AIProvider, weight: usize) -> Arc<NamedAIProvider> {
	Arc::new(NamedAIProvider {
		name: "p".into(),
		provider,
		weight,
		host_override: None,
		path_override: None,
		tokenize: false,
		routes: Default::default(),
	})
}

#[test]
fn route_resolution() {
	let p = named(openai_provider(), 1);
	assert_eq!(p.resolve_route("/v1/chat/completions"), RouteType::Completions);
	assert_eq!(p.resolve_route("/v1/models"), RouteType::Models);
	assert_eq!(p.resolve_route("/v1/embeddings"), RouteType::Embeddings);
	assert_eq!(p.resolve_route("/v1/messages"), RouteType::Messages);
	assert_eq!(p.resolve_route("/anything"), RouteType::Completions);
}

#[test]
fn route_resolution_explicit_wildcard() {
	let mut routes = IndexMap::new();
	routes.insert(Strng::from("*"), RouteType::Passthrough);
	let p = Arc::new(NamedAIProvider {
		routes,
		..(*named(openai_provider(), 1)).clone()
	});
	assert_eq!(p.resolve_route("/v1/chat/completions"), RouteType::Passthrough);
}

#[test]
fn weighted_selection_always_picks_nonzero() {
	let backend = AIBackend {
		providers: vec![
			named(openai_provider(), 1),
			named(
				AIProvider::Anthropic(anthropic::Provider::default()),
				0,
			),
		],
	};
	for _ in 0..50 {
		let chosen = backend.select_provider().unwrap();
		assert_eq!(chosen.provider.provider(), openai::Provider::NAME);
	}
}

#[test]
fn llm_request_token_invariant() {
	// When all three token counts are present, input + output == total.
	let usage = universal::Usage {
		prompt_tokens: 7,
		completion_tokens: 3,
		total_tokens: 10,
		rest: Default::default(),
	};
	assert_eq!(usage.prompt_tokens + usage.completion_tokens, usage.total_tokens);
}

#[tokio::test]
async fn completions_request_builds_llm_request() {
	let provider = openai_provider();
	let body = json!({
		"model": "gpt-5-nano",
		"messages": [{"role": "user", "content": "hi"}],
		"temperature": 0.1,
	});
	let req = ::http::Request::builder()
		.method("POST")
		.uri("http://gw/v1/chat/completions")
		.body(Body::from(serde_json::to_vec(&body).unwrap()))
		.unwrap();
	let client = test_client();
	let result = provider
		.process_completions_request(&client, None, req, false, &mut None)
		.await
		.unwrap();
	let RequestResult::Success(req, llm) = result else {
		panic!("expected success");
	};
	assert_eq!(llm.request_model, "gpt-5-nano");
	assert!(!llm.streaming);
	assert_eq!(llm.params.temperature, Some(0.1));
	// Passthrough: the upstream body is byte-equivalent JSON.
	let bytes = crate::http::read_body_with_limit(req.into_body(), 1 << 20)
		.await
		.unwrap();
	let round: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(round, body);
}

#[tokio::test]
async fn streaming_request_forces_usage() {
	let provider = openai_provider();
	let body = json!({
		"model": "gpt-5-nano",
		"stream": true,
		"messages": [{"role": "user", "content": "hi"}],
	});
	let req = ::http::Request::builder()
		.method("POST")
		.uri("http://gw/v1/chat/completions")
		.body(Body::from(serde_json::to_vec(&body).unwrap()))
		.unwrap();
	let client = test_client();
	let RequestResult::Success(req, llm) = provider
		.process_completions_request(&client, None, req, false, &mut None)
		.await
		.unwrap()
	else {
		panic!("expected success");
	};
	assert!(llm.streaming);
	let bytes = crate::http::read_body_with_limit(req.into_body(), 1 << 20)
		.await
		.unwrap();
	let round: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
	assert_eq!(round["stream_options"]["include_usage"], json!(true));
}

#[tokio::test]
async fn guard_rejects_before_upstream() {
	let provider = openai_provider();
	let policy = Policy {
		prompt_guard: Some(policy::PromptGuard {
			request: Some(policy::RequestGuard {
				regex: Some(policy::RegexGuard {
					rules: vec![policy::RegexRule {
						pattern: regex::Regex::new("SSN").unwrap(),
						name: None,
					}],
					action: policy::GuardAction::Reject,
				}),
				webhook: None,
				moderation: None,
				rejection: policy::Rejection {
					status: 400,
					body: "blocked".to_string(),
				},
			}),
			response: None,
		}),
		..Default::default()
	};
	let body = json!({
		"model": "gpt-5-nano",
		"messages": [{"role": "user", "content": "my SSN is 123"}],
	});
	let req = ::http::Request::builder()
		.method("POST")
		.uri("http://gw/v1/chat/completions")
		.body(Body::from(serde_json::to_vec(&body).unwrap()))
		.unwrap();
	let client = test_client();
	let result = provider
		.process_completions_request(&client, Some(&policy), req, false, &mut None)
		.await
		.unwrap();
	let RequestResult::Rejected(resp) = result else {
		panic!("expected rejection");
	};
	assert_eq!(resp.status(), crate::http::StatusCode::BAD_REQUEST);
	let bytes = crate::http::read_body_with_limit(resp.into_body(), 1 << 20)
		.await
		.unwrap();
	assert_eq!(&bytes[..], b"blocked");
}

#[tokio::test]
async fn model_alias_applied() {
	let provider = openai_provider();
	let policy = Policy {
		model_aliases: std::collections::HashMap::from([(
			"fast".to_string(),
			"gpt-5-nano".to_string(),
		)]),
		..Default::default()
	};
	let body = json!({
		"model": "fast",
		"messages": [{"role": "user", "content": "hi"}],
	});
	let req = ::http::Request::builder()
		.method("POST")
		.uri("http://gw/v1/chat/completions")
		.body(Body::from(serde_json::to_vec(&body).unwrap()))
		.unwrap();
	let client = test_client();
	let RequestResult::Success(_, llm) = provider
		.process_completions_request(&client, Some(&policy), req, false, &mut None)
		.await
		.unwrap()
	else {
		panic!("expected success");
	};
	assert_eq!(llm.request_model, "gpt-5-nano");
}

fn test_client() -> crate::proxy::PolicyClient {
	crate::proxy::PolicyClient {
		inputs: crate::ProxyInputs::test_default(),
	}
}
