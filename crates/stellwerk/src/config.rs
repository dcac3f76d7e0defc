use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StellwerkError;
use crate::transport::Transport;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a scheduling deployment.
///
/// Parsed from `stellwerk.toml` with support for environment variable
/// overrides. One file describes all three roles; each binary reads the
/// sections it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StellwerkConfig {
    /// Scheduling authority.
    #[serde(default)]
    pub master: MasterConfig,

    /// Per-node agent.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Worker pool inside each controller.
    #[serde(default)]
    pub pool: PoolConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Master section: the REP endpoint and the scheduling policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Endpoint the master binds (controllers connect here).
    #[serde(default = "default_master_endpoint")]
    pub endpoint: String,

    /// Receive-poll bound per loop iteration, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which a standing assignment may be handed out again.
    #[serde(default = "default_resend_timeout_secs")]
    pub resend_timeout_secs: u64,

    /// Silence after which a controller is pruned during shutdown.
    #[serde(default = "default_controller_timeout_secs")]
    pub controller_timeout_secs: u64,

    /// Back-off advertised in WAIT_CMD replies.
    #[serde(default = "default_controller_wait_secs")]
    pub controller_wait_secs: u64,

    /// Bound on acquiring the backlog's compound lock per request.
    #[serde(default = "default_backlog_lock_wait_ms")]
    pub backlog_lock_wait_ms: u64,

    /// Backlog queue capacity.
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,

    /// Finished-stream queue capacity.
    #[serde(default = "default_finished_capacity")]
    pub finished_capacity: usize,

    /// Consecutive failed iterations tolerated before a fatal exit.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// PID file making the master a per-host singleton.
    #[serde(default = "default_master_pid_file")]
    pub pid_file: String,
}

fn default_master_endpoint() -> String {
    "tcp://127.0.0.1:5690".into()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_resend_timeout_secs() -> u64 {
    30
}

fn default_controller_timeout_secs() -> u64 {
    60
}

fn default_controller_wait_secs() -> u64 {
    5
}

fn default_backlog_lock_wait_ms() -> u64 {
    200
}

fn default_backlog_capacity() -> usize {
    1024
}

fn default_finished_capacity() -> usize {
    1024
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_master_pid_file() -> String {
    "/tmp/stellwerk/master.pid".into()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            endpoint: default_master_endpoint(),
            poll_interval_ms: default_poll_interval_ms(),
            resend_timeout_secs: default_resend_timeout_secs(),
            controller_timeout_secs: default_controller_timeout_secs(),
            controller_wait_secs: default_controller_wait_secs(),
            backlog_lock_wait_ms: default_backlog_lock_wait_ms(),
            backlog_capacity: default_backlog_capacity(),
            finished_capacity: default_finished_capacity(),
            max_consecutive_errors: default_max_consecutive_errors(),
            pid_file: default_master_pid_file(),
        }
    }
}

/// Controller section: where to find the master and how patient to be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Endpoint of the master's REP socket.
    #[serde(default = "default_master_endpoint")]
    pub master_endpoint: String,

    /// Controller id on the wire. Empty means generate one at startup.
    #[serde(default)]
    pub id: String,

    /// Bound on waiting for the master's reply to one request.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Unanswered requests tolerated before giving up on the master.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// PID file making the controller a per-host singleton.
    #[serde(default = "default_controller_pid_file")]
    pub pid_file: String,
}

fn default_reply_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    5
}

fn default_controller_pid_file() -> String {
    "/tmp/stellwerk/controller.pid".into()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            master_endpoint: default_master_endpoint(),
            id: String::new(),
            reply_timeout_ms: default_reply_timeout_ms(),
            max_retries: default_max_retries(),
            pid_file: default_controller_pid_file(),
        }
    }
}

/// Pool section: worker count, queue sizes, and shutdown patience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Local task queue capacity.
    #[serde(default = "default_task_capacity")]
    pub task_capacity: usize,

    /// Local result queue capacity.
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,

    /// How long workers get to finish their current task on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Bound on status-table lock acquisition from the controller loop.
    #[serde(default = "default_status_wait_ms")]
    pub status_wait_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_task_capacity() -> usize {
    64
}

fn default_result_capacity() -> usize {
    64
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_status_wait_ms() -> u64 {
    200
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_capacity: default_task_capacity(),
            result_capacity: default_result_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            status_wait_ms: default_status_wait_ms(),
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl StellwerkConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, StellwerkError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StellwerkError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Config for a single-host deployment over IPC sockets.
    pub fn local() -> Self {
        let endpoint = Transport::local("master").endpoint();
        Self {
            master: MasterConfig {
                endpoint: endpoint.clone(),
                ..MasterConfig::default()
            },
            controller: ControllerConfig {
                master_endpoint: endpoint,
                ..ControllerConfig::default()
            },
            pool: PoolConfig::default(),
        }
    }

    /// Config for a distributed deployment over TCP.
    pub fn distributed(master_host: &str, master_port: u16) -> Self {
        let endpoint = format!("tcp://{master_host}:{master_port}");
        Self {
            master: MasterConfig {
                endpoint: endpoint.clone(),
                ..MasterConfig::default()
            },
            controller: ControllerConfig {
                master_endpoint: endpoint,
                ..ControllerConfig::default()
            },
            pool: PoolConfig::default(),
        }
    }

    /// Resolve the master's bind transport.
    pub fn master_transport(&self) -> Result<Transport, StellwerkError> {
        Transport::parse(&self.master.endpoint)
    }

    /// Resolve the transport a controller connects to.
    pub fn controller_transport(&self) -> Result<Transport, StellwerkError> {
        Transport::parse(&self.controller.master_endpoint)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `STELLWERK_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `STELLWERK_MASTER_ENDPOINT` → `master.endpoint`
    /// - `STELLWERK_MASTER_RESEND_TIMEOUT_SECS` → `master.resend_timeout_secs`
    /// - `STELLWERK_CONTROLLER_MASTER_ENDPOINT` → `controller.master_endpoint`
    /// - `STELLWERK_CONTROLLER_ID` → `controller.id`
    /// - `STELLWERK_POOL_WORKERS` → `pool.workers`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STELLWERK_MASTER_ENDPOINT") {
            self.master.endpoint = v;
        }
        if let Ok(v) = std::env::var("STELLWERK_MASTER_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.master.poll_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_MASTER_RESEND_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.master.resend_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_MASTER_CONTROLLER_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.master.controller_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_MASTER_PID_FILE") {
            self.master.pid_file = v;
        }
        if let Ok(v) = std::env::var("STELLWERK_CONTROLLER_MASTER_ENDPOINT") {
            self.controller.master_endpoint = v;
        }
        if let Ok(v) = std::env::var("STELLWERK_CONTROLLER_ID") {
            self.controller.id = v;
        }
        if let Ok(v) = std::env::var("STELLWERK_CONTROLLER_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.controller.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("STELLWERK_CONTROLLER_PID_FILE") {
            self.controller.pid_file = v;
        }
        if let Ok(v) = std::env::var("STELLWERK_POOL_WORKERS") {
            if let Ok(n) = v.parse() {
                self.pool.workers = n;
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate the config: endpoints must parse, counts and timeouts must
    /// be non-zero where zero would wedge a loop.
    pub fn validate(&self) -> Result<(), StellwerkError> {
        Transport::parse(&self.master.endpoint)?;
        Transport::parse(&self.controller.master_endpoint)?;

        if self.master.poll_interval_ms == 0 {
            return Err(StellwerkError::Config(
                "master.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.master.resend_timeout_secs == 0 {
            return Err(StellwerkError::Config(
                "master.resend_timeout_secs must be at least 1".into(),
            ));
        }
        if self.master.max_consecutive_errors == 0 {
            return Err(StellwerkError::Config(
                "master.max_consecutive_errors must be at least 1".into(),
            ));
        }
        if self.master.backlog_capacity == 0 || self.master.finished_capacity == 0 {
            return Err(StellwerkError::Config(
                "master queue capacities must be at least 1".into(),
            ));
        }
        if self.controller.id.contains(';') {
            return Err(StellwerkError::Config(
                "controller.id must not contain ';'".into(),
            ));
        }
        if self.controller.reply_timeout_ms == 0 {
            return Err(StellwerkError::Config(
                "controller.reply_timeout_ms must be at least 1".into(),
            ));
        }
        if self.controller.max_retries == 0 {
            return Err(StellwerkError::Config(
                "controller.max_retries must be at least 1".into(),
            ));
        }
        if self.pool.workers == 0 {
            return Err(StellwerkError::Config(
                "pool.workers must be at least 1".into(),
            ));
        }
        if self.pool.task_capacity == 0 || self.pool.result_capacity == 0 {
            return Err(StellwerkError::Config(
                "pool queue capacities must be at least 1".into(),
            ));
        }
        Ok(())
    }

    // ── Duration accessors ──────────────────────────────────────────

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.master.poll_interval_ms)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_secs(self.master.resend_timeout_secs)
    }

    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.master.controller_timeout_secs)
    }

    pub fn backlog_lock_wait(&self) -> Duration {
        Duration::from_millis(self.master.backlog_lock_wait_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.reply_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.pool.shutdown_grace_ms)
    }

    pub fn status_wait(&self) -> Duration {
        Duration::from_millis(self.pool.status_wait_ms)
    }
}

impl Default for StellwerkConfig {
    fn default() -> Self {
        Self::local()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
