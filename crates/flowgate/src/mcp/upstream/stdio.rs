//! Stdio transport: a child process speaking newline-delimited JSON-RPC.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::UpstreamError;
use crate::mcp::jsonrpc;

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

pub struct StdioClient {
	child: Mutex<Child>,
	stdin: Mutex<ChildStdin>,
	pending: Pending,
	next_id: AtomicI64,
}

impl StdioClient {
	pub async fn spawn(
		cmd: &str,
		args: &[String],
		env: &HashMap<String, String>,
	) -> Result<StdioClient, UpstreamError> {
		let mut child = tokio::process::Command::new(cmd)
			.args(args)
			.envs(env)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| UpstreamError::Transport(format!("spawn {cmd}: {e}")))?;
		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| UpstreamError::Transport("no stdin".to_string()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| UpstreamError::Transport("no stdout".to_string()))?;

		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let reader_pending = pending.clone();
		tokio::task::spawn(async move {
			let mut lines = BufReader::new(stdout).lines();
			loop {
				match lines.next_line().await {
					Ok(Some(line)) => {
						let Ok(message) = serde_json::from_str::<Value>(&line) else {
							debug!("discarding non-json stdio line");
							continue;
						};
						let Some(id) = message.get("id").and_then(|i| i.as_i64()) else {
							// Server notification; nothing routes it today.
							continue;
						};
						if let Some(tx) = reader_pending.lock().await.remove(&id) {
							let _ = tx.send(message);
						}
					},
					Ok(None) => break,
					Err(e) => {
						warn!("stdio read failed: {e}");
						break;
					},
				}
			}
			// Wake anything still waiting; the child is gone.
			reader_pending.lock().await.clear();
		});

		Ok(StdioClient {
			child: Mutex::new(child),
			stdin: Mutex::new(stdin),
			pending,
			next_id: AtomicI64::new(1),
		})
	}

	pub async fn initialize(&self) -> Result<(), UpstreamError> {
		self
			.request("initialize", super::initialize_params())
			.await?;
		self
			.write(jsonrpc::notification("notifications/initialized", json!({})))
			.await;
		Ok(())
	}

	pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(id, tx);
		self.write(jsonrpc::request(json!(id), method, params)).await;
		rx.await
			.map_err(|_| UpstreamError::Transport("stdio server went away".to_string()))
	}

	pub async fn notify(&self, message: Value) {
		self.write(message).await;
	}

	async fn write(&self, message: Value) {
		let mut line = message.to_string();
		line.push('\n');
		let mut stdin = self.stdin.lock().await;
		if let Err(e) = stdin.write_all(line.as_bytes()).await {
			warn!("stdio write failed: {e}");
		}
	}

	pub async fn shutdown(self) {
		let mut child = self.child.into_inner();
		let _ = child.kill().await;
	}
}
