//! Main entry point for the paycall service.
//!
//! Loads configuration, builds the engine, recovers jobs left behind by a
//! previous run, starts the expiry sweeper and serves the HTTP API until
//! interrupted.

use clap::Parser;
use paycall_config::Config;
use paycall_core::{PaycallBuilder, PaycallFactories};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

mod apis;
mod server;

/// Command-line arguments for the paycall service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "PAYCALL_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started paycall");

	let config = Config::from_file(&args.config).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = Arc::new(PaycallBuilder::new(config.clone()).build(PaycallFactories::builtin())?);

	let report = engine.recover().await?;
	if report.replayed_commits > 0
		|| report.interrupted_jobs > 0
		|| !report.inconsistent_quotes.is_empty()
		|| !report.unconsumed_payments.is_empty()
	{
		tracing::warn!(
			replayed_commits = report.replayed_commits,
			interrupted_jobs = report.interrupted_jobs,
			inconsistent_quotes = report.inconsistent_quotes.len(),
			unconsumed_payments = report.unconsumed_payments.len(),
			"Recovered state from previous run"
		);
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let sweeper = engine.spawn_sweeper(shutdown_rx);

	match config.api.filter(|api| api.enabled) {
		Some(api_config) => {
			server::start_server(api_config, Arc::clone(&engine), shutdown_signal()).await?;
			tracing::info!("API server finished");
		},
		None => {
			tracing::info!("API disabled, running background tasks only");
			shutdown_signal().await;
		},
	}

	let _ = shutdown_tx.send(true);
	if let Err(e) = sweeper.await {
		tracing::error!(error = %e, "Sweeper task ended abnormally");
	}

	tracing::info!("Stopped paycall");
	Ok(())
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		tracing::error!(error = %e, "Failed to listen for shutdown signal");
	}
}
