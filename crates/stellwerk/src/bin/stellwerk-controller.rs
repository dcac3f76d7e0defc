//! stellwerk-controller — node agent driving a local worker pool.
//!
//! Connects to the master, keeps one request in flight, and feeds assigned
//! tasks to a fixed pool of workers. The built-in runner executes tasks
//! against a scratch directory; embedders supply their own
//! [`stellwerk::task::TaskRunner`] instead.
//!
//! # Usage
//!
//! ```bash
//! # Local IPC (default endpoint)
//! stellwerk-controller
//!
//! # Remote master, named controller, bigger pool
//! stellwerk-controller --master tcp://10.0.0.1:5690 --id ctrl-node-3 --workers 8
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use stellwerk::config::StellwerkConfig;
use stellwerk::controller::{Controller, ControllerOutcome};
use stellwerk::pidfile::PidFile;
use stellwerk::pool::WorkerPool;
use stellwerk::task::{TaskError, TaskRunner, TaskSpec};

/// Node agent: requests tasks from the master and runs them locally.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-controller", version, about)]
struct Cli {
    /// Config file (TOML). Without it the built-in local defaults apply.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<String>,

    /// Master endpoint to connect to, overriding the config.
    #[arg(long)]
    master: Option<String>,

    /// Controller id on the wire, overriding the config.
    #[arg(long)]
    id: Option<String>,

    /// Worker count, overriding the config.
    #[arg(long)]
    workers: Option<usize>,

    /// Scratch directory for the built-in task runner.
    #[arg(long, env = "STELLWERK_SCRATCH", default_value = "/tmp/stellwerk/scratch")]
    scratch: String,
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
    tracing::info!(?cli, "starting stellwerk-controller");

    let mut config = match &cli.config {
        Some(path) => StellwerkConfig::from_file(path)?,
        None => StellwerkConfig::local(),
    };
    if let Some(master) = cli.master {
        config.controller.master_endpoint = master;
    }
    if let Some(id) = cli.id {
        config.controller.id = id;
    }
    if let Some(workers) = cli.workers {
        config.pool.workers = workers;
    }
    config.validate()?;

    // One controller per host; bail out before spawning any worker.
    let pid_file = match PidFile::lock(&config.controller.pid_file) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            std::process::exit(1);
        }
    };
    tracing::info!(pid = pid_file.pid(), path = %pid_file.path().display(), "pid file locked");

    let cancel = stellwerk::shutdown::install_shutdown_handler();

    let runner = Arc::new(ScratchRunner {
        root: PathBuf::from(&cli.scratch),
    });
    let pool = WorkerPool::start(runner, &config.pool);
    let controller = Controller::new(config, pool, cancel);
    let outcome = controller.run().await?;

    pid_file.unlock()?;

    match outcome {
        ControllerOutcome::CleanShutdown => {
            tracing::info!("stellwerk-controller exited cleanly");
            Ok(())
        }
        ControllerOutcome::TransportExhausted => {
            tracing::error!("stellwerk-controller lost the master");
            std::process::exit(1);
        }
        ControllerOutcome::PoolFailed => {
            tracing::error!("stellwerk-controller lost its worker pool");
            std::process::exit(1);
        }
    }
}

/// Executes the built-in task kinds against a scratch directory.
struct ScratchRunner {
    root: PathBuf,
}

impl TaskRunner for ScratchRunner {
    fn execute(&self, spec: &TaskSpec) -> Result<(), TaskError> {
        match spec {
            TaskSpec::Smoke { .. } => Ok(()),
            TaskSpec::CreateFiles { tid, count } => {
                let dir = self.root.join(tid);
                std::fs::create_dir_all(&dir)?;
                for i in 0..*count {
                    std::fs::write(dir.join(format!("f{i}")), b"stellwerk")?;
                }
                Ok(())
            }
            TaskSpec::MoveSegment { src, dst, .. } => {
                if let Some(parent) = Path::new(dst).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(src, dst)?;
                Ok(())
            }
            TaskSpec::IoBench {
                tid,
                path,
                block_kib,
                seconds,
            } => {
                use std::io::Write;

                if let Some(parent) = Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let block = vec![0u8; *block_kib as usize * 1024];
                let deadline =
                    std::time::Instant::now() + Duration::from_secs(u64::from(*seconds));
                let mut file = std::fs::File::create(path)?;
                let mut written: u64 = 0;
                while std::time::Instant::now() < deadline {
                    file.write_all(&block)?;
                    written += block.len() as u64;
                }
                file.sync_all()?;
                tracing::info!(tid = %tid, written, "io bench done");
                std::fs::remove_file(path)?;
                Ok(())
            }
        }
    }
}
