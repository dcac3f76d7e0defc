//! stellwerk-master — scheduling authority for a stellwerk deployment.
//!
//! Binds the REP endpoint, seeds a demo batch through the built-in batch
//! generator, and hands tasks out to controllers until every task has
//! finished or a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC (default endpoint)
//! stellwerk-master
//!
//! # TCP for a multi-node deployment
//! stellwerk-master --endpoint tcp://0.0.0.0:5690
//!
//! # From a config file, with a bigger batch
//! stellwerk-master --config /etc/stellwerk.toml --tasks 64
//! ```

use std::sync::Arc;

use clap::Parser;

use stellwerk::config::StellwerkConfig;
use stellwerk::generator::{BatchGenerator, TaskGenerator};
use stellwerk::master::{Master, MasterOutcome};
use stellwerk::pidfile::PidFile;
use stellwerk::queue::SharedQueue;
use stellwerk::shutdown::install_shutdown_handler;
use stellwerk::task::TaskSpec;

/// Scheduling authority: owns the backlog, the assignment ledger, and the
/// controller liveness table.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-master", version, about)]
struct Cli {
    /// Config file (TOML). Without it the built-in local defaults apply.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<String>,

    /// Endpoint to bind, overriding the config (tcp://host:port or ipc://path).
    #[arg(long)]
    endpoint: Option<String>,

    /// Number of demo tasks to schedule.
    #[arg(long, default_value_t = 16)]
    tasks: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting stellwerk-master");

    let mut config = match &cli.config {
        Some(path) => StellwerkConfig::from_file(path)?,
        None => StellwerkConfig::local(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.master.endpoint = endpoint;
    }
    config.validate()?;

    // One master per host; bail out before touching any socket.
    let pid_file = match PidFile::lock(&config.master.pid_file) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            std::process::exit(1);
        }
    };
    tracing::info!(pid = pid_file.pid(), path = %pid_file.path().display(), "pid file locked");

    let cancel = install_shutdown_handler();

    let backlog = Arc::new(SharedQueue::new(config.master.backlog_capacity));
    let finished = Arc::new(SharedQueue::new(config.master.finished_capacity));

    let batch = demo_batch(cli.tasks);
    tracing::info!(tasks = batch.len(), "seeding demo batch");
    let generator = Arc::new(BatchGenerator::new(
        Arc::clone(&backlog),
        Arc::clone(&finished),
        batch,
        config.resend_timeout(),
        cancel.clone(),
    ));
    {
        let generator = Arc::clone(&generator);
        tokio::spawn(async move { generator.start().await });
    }

    let master = Master::new(config, backlog, finished, generator, cancel);
    let outcome = master.run().await?;

    pid_file.unlock()?;

    match outcome {
        MasterOutcome::Drained => {
            tracing::info!("stellwerk-master exited cleanly");
            Ok(())
        }
        MasterOutcome::ErrorBudgetExhausted => {
            tracing::error!("stellwerk-master giving up after repeated errors");
            std::process::exit(1);
        }
    }
}

/// A small mixed batch so a fresh checkout has something to schedule.
fn demo_batch(tasks: u32) -> Vec<TaskSpec> {
    (0..tasks)
        .map(|i| {
            let tid = format!("t-{i}");
            match i % 3 {
                0 => TaskSpec::Smoke { tid },
                1 => TaskSpec::CreateFiles { tid, count: 8 },
                _ => TaskSpec::IoBench {
                    tid,
                    path: format!("/tmp/stellwerk/scratch/bench-{i}"),
                    block_kib: 4,
                    seconds: 1,
                },
            }
        })
        .collect()
}
