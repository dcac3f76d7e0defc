pub mod config;
pub mod controller;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod master;
pub mod message;
pub mod pidfile;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod status;
pub mod task;
pub mod transport;

pub use config::{ControllerConfig, MasterConfig, PoolConfig, StellwerkConfig};
pub use controller::{Controller, ControllerOutcome};
pub use error::StellwerkError;
pub use generator::{BatchGenerator, TaskGenerator};
pub use ledger::{AssignState, AssignmentRecord, FinishOutcome, Ledger, LivenessTable, Offer};
pub use master::{Master, MasterOutcome};
pub use message::{Message, TaskAssign};
pub use pidfile::PidFile;
pub use pool::{WorkItem, WorkerPool};
pub use queue::SharedQueue;
pub use registry::TaskRegistry;
pub use shutdown::install_shutdown_handler;
pub use status::{StatusTable, WorkerState, WorkerStatus};
pub use task::{TaskError, TaskRunner, TaskSpec};
pub use transport::Transport;
