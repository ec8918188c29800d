//! Application assembly: wire the store, client, telemetry, admin server,
//! and gateway together, then run until shutdown.

use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tracing::{error, info};

use crate::types::local::LocalConfig;
use crate::{Config, ProxyInputs};

pub async fn run(cfg: Config, local: LocalConfig) -> anyhow::Result<()> {
	let cfg = Arc::new(cfg);

	// Process-wide singletons come up before any listener.
	let mut registry = Registry::with_prefix("flowgate");
	let metrics = crate::telemetry::metrics::Metrics::new(&mut registry);
	let registry = Arc::new(std::sync::Mutex::new(registry));
	let store = Arc::new(crate::store::Store::new());

	let hbone_identity = match &cfg.hbone_identity {
		Some(id) => {
			let cert = std::fs::read(&id.cert).context("hbone cert")?;
			let key = std::fs::read(&id.key).context("hbone key")?;
			let roots = std::fs::read(&id.roots).context("hbone roots")?;
			Some(crate::client::hbone::Identity::from_pem(&cert, &key, &roots)?)
		},
		None => None,
	};
	let upstream = crate::client::Client::new(
		cfg.backend.clone(),
		hbone_identity,
		Some(metrics.clone()),
	);
	let tracer = crate::telemetry::trc::Tracer::new(&cfg.tracing)?;

	let inputs = Arc::new(ProxyInputs {
		cfg: cfg.clone(),
		store: store.clone(),
		upstream,
		metrics: metrics.clone(),
		tracer: tracer.clone(),
		mcp_state: crate::mcp::App::new(),
	});

	// Install the initial snapshot; a bad boot config is fatal.
	let snapshot = local.to_snapshot().context("invalid configuration")?;
	store.replace(snapshot);
	metrics
		.config_generation
		.set(store.current().generation as i64);
	info!(
		generation = store.current().generation,
		binds = store.current().binds.len(),
		"configuration installed"
	);
	crate::llm::preload_tokenizers();
	spawn_jwks_refresh(&inputs);

	// Follow on-disk config changes; an invalid update leaves the current
	// snapshot in place.
	if let Some(source) = cfg.local_config.clone() {
		let store = store.clone();
		let metrics = metrics.clone();
		tokio::task::spawn(async move {
			let mut last = None;
			loop {
				tokio::time::sleep(std::time::Duration::from_secs(5)).await;
				let Ok(raw) = source.read_to_string().await else {
					continue;
				};
				if last.as_deref() == Some(raw.as_str()) {
					continue;
				}
				match LocalConfig::parse(&raw).and_then(|l| l.to_snapshot()) {
					Ok(snapshot) => {
						store.replace(snapshot);
						metrics
							.config_generation
							.set(store.current().generation as i64);
						info!(
							generation = store.current().generation,
							"configuration reloaded"
						);
						last = Some(raw);
					},
					Err(e) => {
						error!("rejecting configuration update: {e:#}");
						last = Some(raw);
					},
				}
			}
		});
	}

	let admin = crate::admin::Admin::new(inputs.clone(), registry);
	tokio::task::spawn(async move {
		if let Err(e) = admin.run().await {
			error!("admin server failed: {e}");
		}
	});

	let (drain_trigger, drain_watcher) = flowgate_core::drain::new();
	let gateway = crate::proxy::gateway::Gateway::new(inputs.clone(), drain_watcher);
	let gateway_task = tokio::task::spawn(gateway.run());

	wait_for_shutdown().await;
	info!("shutdown signal received, draining");
	drain_trigger
		.start_drain_and_wait(flowgate_core::drain::DrainMode::Graceful)
		.await;
	let _ = gateway_task.await;
	if let Some(t) = &tracer {
		t.shutdown();
	}
	info!("shutdown complete");
	Ok(())
}

fn spawn_jwks_refresh(inputs: &Arc<ProxyInputs>) {
	// Remote JWKS documents refresh in the background; until the first
	// fetch completes, strict JWT policies reject.
	let snapshot = inputs.store.current();
	let mut remote = vec![];
	let mut collect = |p: &crate::types::agent::TrafficPolicy| {
		if let crate::types::agent::TrafficPolicy::JwtAuth(jwt) = p
			&& jwt.remote_url().is_some()
		{
			remote.push(jwt.clone());
		}
	};
	for p in snapshot.policies.iter() {
		if let crate::types::agent::PolicyType::Traffic(t) = &p.policy {
			collect(t);
		}
	}
	for bind in &snapshot.binds {
		for listener in bind.listeners.iter() {
			for route in listener.routes.iter() {
				for p in &route.inline_policies {
					collect(p);
				}
			}
		}
	}
	if remote.is_empty() {
		return;
	}
	let client = crate::proxy::PolicyClient {
		inputs: inputs.clone(),
	};
	tokio::task::spawn(crate::http::jwt::refresh_remote_jwks(remote, client));
}

async fn wait_for_shutdown() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut sigterm =
			tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
				.expect("signal handler installation");
		tokio::select! {
			_ = ctrl_c => {}
			_ = sigterm.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
