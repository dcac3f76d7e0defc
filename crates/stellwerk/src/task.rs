//! Task definitions and the execution contract.

use thiserror::Error;

/// Error returned by a task body.
///
/// Caught and logged inside the worker loop; it never propagates past the
/// pool boundary, and the task id is still reported as finished.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully parametrized unit of work.
///
/// The kind set is closed; [`crate::registry::TaskRegistry`] maps wire tags
/// onto these variants and back. Each variant carries its task id plus the
/// typed constructor parameters of its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSpec {
    /// End-to-end pipeline probe, no parameters.
    Smoke { tid: String },

    /// Create `count` empty files in the scratch area.
    CreateFiles { tid: String, count: u32 },

    /// Move one storage segment from `src` to `dst`.
    MoveSegment { tid: String, src: String, dst: String },

    /// Timed I/O benchmark against `path`.
    IoBench {
        tid: String,
        path: String,
        block_kib: u32,
        seconds: u32,
    },
}

impl TaskSpec {
    /// Unique task id within the outstanding batch.
    pub fn tid(&self) -> &str {
        match self {
            TaskSpec::Smoke { tid }
            | TaskSpec::CreateFiles { tid, .. }
            | TaskSpec::MoveSegment { tid, .. }
            | TaskSpec::IoBench { tid, .. } => tid,
        }
    }
}

/// Execution contract supplied by the embedding application.
///
/// Bodies are synchronous and may block or panic; the pool runs them on the
/// blocking thread pool and treats both failure and panic as a completed
/// (albeit unsuccessful) execution. Bodies must tolerate re-execution, since
/// assignment is at-least-once.
pub trait TaskRunner: Send + Sync + 'static {
    fn execute(&self, spec: &TaskSpec) -> Result<(), TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_accessor_covers_all_kinds() {
        let specs = [
            TaskSpec::Smoke { tid: "a".into() },
            TaskSpec::CreateFiles {
                tid: "b".into(),
                count: 4,
            },
            TaskSpec::MoveSegment {
                tid: "c".into(),
                src: "/s".into(),
                dst: "/d".into(),
            },
            TaskSpec::IoBench {
                tid: "d".into(),
                path: "/p".into(),
                block_kib: 64,
                seconds: 10,
            },
        ];
        let tids: Vec<&str> = specs.iter().map(TaskSpec::tid).collect();
        assert_eq!(tids, ["a", "b", "c", "d"]);
    }
}
