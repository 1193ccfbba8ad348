//! flowrelayd — the continuous-query engine's server entry point.
//!
//! Parses the process-wide CLI/env configuration, starts the
//! scheduler's per-database process tables, and runs until
//! asked to shut down.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use flowrelay_core::cnf::Cli;
use flowrelay_core::scheduler::{DbComplement, Scheduler};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,flowrelay_core=debug".into()))
		.init();

	let complement = DbComplement {
		num_workers: cli.num_workers as u32,
		num_combiners: cli.num_combiners as u32,
		num_queues: cli.num_queues as u32,
		num_reapers: cli.num_reapers as u32,
	};

	let databases: Vec<String> = if cli.databases.is_empty() { vec!["postgres".to_string()] } else { cli.databases.clone() };

	if let Err(e) = Scheduler::check_capacity(databases.len(), complement, cli.task_budget) {
		tracing::error!(target: "flowrelay::bin", error = %e, "refusing to start: not enough task budget");
		std::process::exit(1);
	}

	tracing::info!(
		target: "flowrelay::bin",
		databases = ?databases,
		num_workers = cli.num_workers,
		num_combiners = cli.num_combiners,
		num_queues = cli.num_queues,
		num_reapers = cli.num_reapers,
		"starting flowrelayd"
	);

	let scheduler = Arc::new(Scheduler::new());
	for name in &databases {
		scheduler.start_db(name.clone(), complement);
	}

	let cancel = CancellationToken::new();
	let tick_handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

	wait_for_shutdown_signal().await;
	tracing::info!(target: "flowrelay::bin", "shutdown signal received, draining databases");

	cancel.cancel();
	let _ = tick_handle.await;
	for name in &databases {
		scheduler.drop_db(name).await;
	}
	tracing::info!(target: "flowrelay::bin", "flowrelayd stopped");
}

/// Waits for either ctrl-c or, on unix, SIGTERM, and signals the rest of the
/// process to drain via the caller's `CancellationToken`.
async fn wait_for_shutdown_signal() {
	#[cfg(unix)]
	{
		let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = sigterm.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
