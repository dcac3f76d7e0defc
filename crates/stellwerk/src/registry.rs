//! Closed registry mapping wire task tags onto [`TaskSpec`] variants.
//!
//! Assignment frames name tasks by `(module, kind)` tag pair; the registry
//! owns the tag constants, the per-kind argument decoders, and the inverse
//! encoding. There is no name-based dynamic construction: a tag that is not
//! registered here does not exist.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StellwerkError;
use crate::message::TaskAssign;
use crate::task::TaskSpec;

// ── Module tags ───────────────────────────────────────────────────────────

/// Pipeline and filesystem probes.
pub const MODULE_PROBE: &str = "probe";

/// Segment-migration steps.
pub const MODULE_MIGRATE: &str = "migrate";

/// I/O benchmarks.
pub const MODULE_BENCH: &str = "bench";

// ── Kind tags ─────────────────────────────────────────────────────────────

pub const KIND_SMOKE: &str = "smoke";
pub const KIND_CREATE_FILES: &str = "create_files";
pub const KIND_MOVE_SEGMENT: &str = "move_segment";
pub const KIND_IO_BENCH: &str = "io_bench";

type DecodeFn = fn(&TaskAssign) -> Result<TaskSpec, StellwerkError>;

struct Entry {
    module: &'static str,
    decode: DecodeFn,
}

/// Registry of the known task kinds.
pub struct TaskRegistry {
    entries: HashMap<&'static str, Entry>,
}

impl TaskRegistry {
    /// Registry with the built-in kind set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        registry.register(MODULE_PROBE, KIND_SMOKE, decode_smoke);
        registry.register(MODULE_PROBE, KIND_CREATE_FILES, decode_create_files);
        registry.register(MODULE_MIGRATE, KIND_MOVE_SEGMENT, decode_move_segment);
        registry.register(MODULE_BENCH, KIND_IO_BENCH, decode_io_bench);
        registry
    }

    fn register(&mut self, module: &'static str, kind: &'static str, decode: DecodeFn) {
        self.entries.insert(kind, Entry { module, decode });
    }

    /// Construct a [`TaskSpec`] from an assignment frame.
    ///
    /// Fails on an unregistered kind, a module tag that does not match the
    /// registration, a wrong argument count, or an unparsable argument.
    pub fn decode(&self, assign: &TaskAssign) -> Result<TaskSpec, StellwerkError> {
        let entry = self.entries.get(assign.kind.as_str()).ok_or_else(|| {
            StellwerkError::Protocol(format!("unknown task kind {:?}", assign.kind))
        })?;
        if entry.module != assign.module {
            return Err(StellwerkError::Protocol(format!(
                "task kind {:?} belongs to module {:?}, frame says {:?}",
                assign.kind, entry.module, assign.module
            )));
        }
        (entry.decode)(assign)
    }

    /// Produce the assignment frame for a spec. Inverse of [`Self::decode`].
    pub fn encode(&self, spec: &TaskSpec) -> TaskAssign {
        let (module, kind, args) = match spec {
            TaskSpec::Smoke { .. } => (MODULE_PROBE, KIND_SMOKE, vec![]),
            TaskSpec::CreateFiles { count, .. } => {
                (MODULE_PROBE, KIND_CREATE_FILES, vec![count.to_string()])
            }
            TaskSpec::MoveSegment { src, dst, .. } => (
                MODULE_MIGRATE,
                KIND_MOVE_SEGMENT,
                vec![src.clone(), dst.clone()],
            ),
            TaskSpec::IoBench {
                path,
                block_kib,
                seconds,
                ..
            } => (
                MODULE_BENCH,
                KIND_IO_BENCH,
                vec![path.clone(), block_kib.to_string(), seconds.to_string()],
            ),
        };
        TaskAssign {
            module: module.to_string(),
            kind: kind.to_string(),
            tid: spec.tid().to_string(),
            args,
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn expect_args(assign: &TaskAssign, want: usize) -> Result<(), StellwerkError> {
    if assign.args.len() != want {
        return Err(StellwerkError::Protocol(format!(
            "task kind {:?} takes {want} argument(s), got {}",
            assign.kind,
            assign.args.len()
        )));
    }
    Ok(())
}

fn parse_arg<T>(assign: &TaskAssign, idx: usize, name: &str) -> Result<T, StellwerkError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    assign.args[idx].parse::<T>().map_err(|e| {
        StellwerkError::Protocol(format!(
            "argument {name} of task kind {:?}: {e}",
            assign.kind
        ))
    })
}

fn decode_smoke(assign: &TaskAssign) -> Result<TaskSpec, StellwerkError> {
    expect_args(assign, 0)?;
    Ok(TaskSpec::Smoke {
        tid: assign.tid.clone(),
    })
}

fn decode_create_files(assign: &TaskAssign) -> Result<TaskSpec, StellwerkError> {
    expect_args(assign, 1)?;
    Ok(TaskSpec::CreateFiles {
        tid: assign.tid.clone(),
        count: parse_arg(assign, 0, "count")?,
    })
}

fn decode_move_segment(assign: &TaskAssign) -> Result<TaskSpec, StellwerkError> {
    expect_args(assign, 2)?;
    Ok(TaskSpec::MoveSegment {
        tid: assign.tid.clone(),
        src: assign.args[0].clone(),
        dst: assign.args[1].clone(),
    })
}

fn decode_io_bench(assign: &TaskAssign) -> Result<TaskSpec, StellwerkError> {
    expect_args(assign, 3)?;
    Ok(TaskSpec::IoBench {
        tid: assign.tid.clone(),
        path: assign.args[0].clone(),
        block_kib: parse_arg(assign, 1, "block_kib")?,
        seconds: parse_arg(assign, 2, "seconds")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(module: &str, kind: &str, tid: &str, args: &[&str]) -> TaskAssign {
        TaskAssign {
            module: module.into(),
            kind: kind.into(),
            tid: tid.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn decode_all_builtin_kinds() {
        let registry = TaskRegistry::builtin();

        assert_eq!(
            registry
                .decode(&assign("probe", "smoke", "t-1", &[]))
                .unwrap(),
            TaskSpec::Smoke { tid: "t-1".into() }
        );
        assert_eq!(
            registry
                .decode(&assign("probe", "create_files", "t-2", &["16"]))
                .unwrap(),
            TaskSpec::CreateFiles {
                tid: "t-2".into(),
                count: 16,
            }
        );
        assert_eq!(
            registry
                .decode(&assign("migrate", "move_segment", "t-3", &["/a", "/b"]))
                .unwrap(),
            TaskSpec::MoveSegment {
                tid: "t-3".into(),
                src: "/a".into(),
                dst: "/b".into(),
            }
        );
        assert_eq!(
            registry
                .decode(&assign("bench", "io_bench", "t-4", &["/scratch", "128", "30"]))
                .unwrap(),
            TaskSpec::IoBench {
                tid: "t-4".into(),
                path: "/scratch".into(),
                block_kib: 128,
                seconds: 30,
            }
        );
    }

    #[test]
    fn encode_decode_inverse() {
        let registry = TaskRegistry::builtin();
        let specs = [
            TaskSpec::Smoke { tid: "s".into() },
            TaskSpec::CreateFiles {
                tid: "c".into(),
                count: 3,
            },
            TaskSpec::MoveSegment {
                tid: "m".into(),
                src: "/x".into(),
                dst: "/y".into(),
            },
            TaskSpec::IoBench {
                tid: "b".into(),
                path: "/p".into(),
                block_kib: 4,
                seconds: 1,
            },
        ];
        for spec in specs {
            let frame = registry.encode(&spec);
            assert_eq!(registry.decode(&frame).unwrap(), spec);
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let registry = TaskRegistry::builtin();
        let err = registry
            .decode(&assign("probe", "mystery", "t-1", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown task kind"));
    }

    #[test]
    fn decode_rejects_module_mismatch() {
        let registry = TaskRegistry::builtin();
        let err = registry
            .decode(&assign("bench", "smoke", "t-1", &[]))
            .unwrap_err();
        assert!(err.to_string().contains("belongs to module"));
    }

    #[test]
    fn decode_rejects_wrong_arg_count() {
        let registry = TaskRegistry::builtin();
        assert!(registry
            .decode(&assign("probe", "smoke", "t-1", &["surplus"]))
            .is_err());
        assert!(registry
            .decode(&assign("migrate", "move_segment", "t-1", &["/only-src"]))
            .is_err());
    }

    #[test]
    fn decode_rejects_unparsable_argument() {
        let registry = TaskRegistry::builtin();
        let err = registry
            .decode(&assign("probe", "create_files", "t-1", &["many"]))
            .unwrap_err();
        assert!(err.to_string().contains("count"));
    }
}
