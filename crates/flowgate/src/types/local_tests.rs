use super::*;

fn snapshot(yaml: &str) -> anyhow::Result<Snapshot> {
	LocalConfig::parse(yaml)?.to_snapshot()
}

#[test]
fn minimal_http_bind() {
	let snap = snapshot(
		r#"
binds:
- port: 8080
  listeners:
  - routes:
    - backends:
      - host: example.com:80
"#,
	)
	.unwrap();
	assert_eq!(snap.binds.len(), 1);
	assert_eq!(snap.binds[0].address.port(), 8080);
	let listener = snap.binds[0].listeners.get_exactly_one().unwrap();
	assert!(!listener.routes.is_empty());
	// The inline host backend was registered as a named backend.
	assert!(snap.backends.contains_key("example.com:80"));
}

#[test]
fn duplicate_bind_rejected() {
	let err = snapshot(
		r#"
binds:
- port: 8080
  listeners: []
- port: 8080
  listeners: []
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("duplicate bind"));
}

#[test]
fn route_without_backend_needs_short_circuit() {
	let err = snapshot(
		r#"
binds:
- port: 8080
  listeners:
  - routes:
    - matches:
      - path:
          exact: /x
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("no backends"));

	// The same route is fine with a direct response.
	snapshot(
		r#"
binds:
- port: 8080
  listeners:
  - routes:
    - matches:
      - path:
          exact: /x
      policies:
        directResponse:
          status: 204
"#,
	)
	.unwrap();
}

#[test]
fn unresolvable_backend_reference_rejected() {
	let err = snapshot(
		r#"
binds:
- port: 8080
  listeners:
  - routes:
    - backends:
      - backend: nonexistent
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("does not exist"));
}

#[test]
fn https_listener_requires_tls() {
	let err = snapshot(
		r#"
binds:
- port: 8443
  listeners:
  - protocol: HTTPS
    routes:
    - backends:
      - host: example.com:80
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("requires tls"));
}

#[test]
fn policy_target_must_exist() {
	let err = snapshot(
		r#"
binds:
- port: 8080
  listeners:
  - routes:
    - name: real
      backends:
      - host: example.com:80
policies:
- name: t
  target:
    route: ghost
  timeout:
    request: 5s
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("route ghost does not exist"));
}

#[test]
fn ai_backend_parses() {
	let snap = snapshot(
		r#"
binds:
- port: 3000
  listeners:
  - routes:
    - name: llm
      backends:
      - ai:
          providers:
          - name: primary
            openAI:
              model: gpt-5-nano
"#,
	)
	.unwrap();
	let ai = snap
		.backends
		.values()
		.find(|b| matches!(b.as_ref(), Backend::AI(_, _)))
		.expect("ai backend registered");
	let Backend::AI(_, backend) = ai.as_ref() else {
		unreachable!()
	};
	assert_eq!(backend.providers.len(), 1);
	assert_eq!(backend.providers[0].name, "primary");
}

#[test]
fn mcp_backend_duplicate_targets_rejected() {
	let err = snapshot(
		r#"
binds:
- port: 3000
  listeners:
  - routes:
    - backends:
      - mcp:
          targets:
          - name: a
            stdio:
              cmd: server
          - name: a
            stdio:
              cmd: server2
"#,
	)
	.unwrap_err();
	assert!(err.to_string().contains("duplicate target"));
}

#[test]
fn service_reference_resolves() {
	let snap = snapshot(
		r#"
services:
- name: api
  hostname: api.default.svc
  endpoints: [10.0.0.1]
  ports:
    80: 8080
binds:
- port: 8080
  listeners:
  - routes:
    - backends:
      - service:
          name: api
          port: 80
"#,
	)
	.unwrap();
	assert!(snap.services.contains_key("default/api"));
}
