use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, reload};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "An L7 proxy for AI and agent workloads")]
struct Args {
	/// Configuration file (YAML or JSON).
	#[arg(short = 'f', long = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,
}

fn main() {
	let args = Args::parse();
	if let Err(e) = run(args) {
		eprintln!("flowgate: {e:#}");
		std::process::exit(1);
	}
}

fn run(args: Args) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let (filter, handle) = reload::Layer::new(filter);
	let _ = flowgate::admin::LOG_FILTER_HANDLE.set(handle);
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let raw = match &args.file {
		Some(path) => std::fs::read_to_string(path)
			.with_context(|| format!("reading {}", path.display()))?,
		None => {
			// No file: an xDS address must come from config/env.
			"{}".to_string()
		},
	};
	let local = flowgate::types::local::LocalConfig::parse(&raw).context("parsing configuration")?;
	let cfg = local
		.config
		.clone()
		.unwrap_or_default()
		.build(args.file.clone())
		.context("building runtime configuration")?;

	if args.validate_only {
		// Full validation includes snapshot construction.
		local.to_snapshot().context("validating configuration")?;
		println!("configuration is valid");
		return Ok(());
	}
	if local.binds.is_empty() && cfg.xds_address.is_none() {
		anyhow::bail!("no binds configured and no xDS address set");
	}
	if cfg.xds_address.is_some() {
		anyhow::bail!("xDS configuration delivery is not available in this build");
	}

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.worker_threads(cfg.num_worker_threads)
		.enable_all()
		.build()
		.context("building runtime")?;
	runtime.block_on(flowgate::app::run(cfg, local))
}
