//! Text wire protocol between master and controllers.
//!
//! Every frame is a single line of `;`-separated fields with a leading tag.
//! The tag set is closed; field order and count are fixed per tag (TASK_ASS
//! carries a variable tail of constructor arguments). Encoding and decoding
//! round-trip exactly and perform no I/O.

use crate::error::StellwerkError;

/// Field separator within a frame.
pub const SEPARATOR: char = ';';

// ── Frame tags ────────────────────────────────────────────────────────────

/// Controller asks for work.
pub const TASK_REQUEST: &str = "TASK_REQ";

/// Master hands out one task.
pub const TASK_ASSIGN: &str = "TASK_ASS";

/// Master tells the controller to back off for a number of seconds.
pub const WAIT_CMD: &str = "WAIT_CMD";

/// Controller reports a completed task id.
pub const TASK_FINISHED: &str = "TASK_FIN";

/// Bare acknowledgement.
pub const ACK: &str = "ACK";

/// Controller liveness ping while its workers are busy.
pub const HEARTBEAT: &str = "HEARTBEAT";

/// Master orders the controller to shut down locally.
pub const EXIT_CMD: &str = "EXIT_CMD";

/// Body of a task assignment: which registry entry to construct and its
/// positional constructor arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssign {
    /// Module tag grouping related task kinds (e.g. "probe", "migrate").
    pub module: String,
    /// Task kind within the module; selects the registry decoder.
    pub kind: String,
    /// Unique task id within the outstanding batch.
    pub tid: String,
    /// Positional constructor arguments, possibly empty.
    pub args: Vec<String>,
}

/// One frame of the master/controller protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TaskRequest { sender: String },
    TaskAssign(TaskAssign),
    Wait { seconds: u64 },
    TaskFinished { sender: String, tid: String },
    Ack,
    Heartbeat { sender: String },
    Exit,
}

impl Message {
    /// Encode this frame to its wire form.
    ///
    /// Fails if any field contains the separator, which would shift the
    /// field positions of the decoded frame.
    pub fn encode(&self) -> Result<String, StellwerkError> {
        let fields: Vec<&str> = match self {
            Message::TaskRequest { sender } => vec![TASK_REQUEST, sender],
            Message::TaskAssign(assign) => {
                let mut f = vec![TASK_ASSIGN, &assign.module, &assign.kind, &assign.tid];
                f.extend(assign.args.iter().map(String::as_str));
                f
            }
            Message::Wait { seconds } => {
                // Numeric field, separator-safe by construction.
                return Ok(format!("{WAIT_CMD}{SEPARATOR}{seconds}"));
            }
            Message::TaskFinished { sender, tid } => vec![TASK_FINISHED, sender, tid],
            Message::Ack => vec![ACK],
            Message::Heartbeat { sender } => vec![HEARTBEAT, sender],
            Message::Exit => vec![EXIT_CMD],
        };

        for field in &fields[1..] {
            if field.contains(SEPARATOR) {
                return Err(StellwerkError::Protocol(format!(
                    "field {field:?} contains the separator '{SEPARATOR}'"
                )));
            }
        }
        Ok(fields.join(&SEPARATOR.to_string()))
    }

    /// Decode a wire frame.
    ///
    /// Fails on an unknown tag, on a field count that does not match the
    /// tag, and on a non-numeric WAIT_CMD duration.
    pub fn decode(frame: &str) -> Result<Self, StellwerkError> {
        let fields: Vec<&str> = frame.split(SEPARATOR).collect();
        let tag = fields[0];

        match (tag, fields.len()) {
            (TASK_REQUEST, 2) => Ok(Message::TaskRequest {
                sender: fields[1].to_string(),
            }),
            (TASK_ASSIGN, n) if n >= 4 => Ok(Message::TaskAssign(TaskAssign {
                module: fields[1].to_string(),
                kind: fields[2].to_string(),
                tid: fields[3].to_string(),
                args: fields[4..].iter().map(|s| s.to_string()).collect(),
            })),
            (WAIT_CMD, 2) => {
                let seconds = fields[1].parse::<u64>().map_err(|_| {
                    StellwerkError::Protocol(format!(
                        "WAIT_CMD duration {:?} is not a number",
                        fields[1]
                    ))
                })?;
                Ok(Message::Wait { seconds })
            }
            (TASK_FINISHED, 3) => Ok(Message::TaskFinished {
                sender: fields[1].to_string(),
                tid: fields[2].to_string(),
            }),
            (ACK, 1) => Ok(Message::Ack),
            (HEARTBEAT, 2) => Ok(Message::Heartbeat {
                sender: fields[1].to_string(),
            }),
            (EXIT_CMD, 1) => Ok(Message::Exit),
            (TASK_REQUEST | TASK_ASSIGN | WAIT_CMD | TASK_FINISHED | ACK | HEARTBEAT
            | EXIT_CMD, n) => Err(StellwerkError::Protocol(format!(
                "tag {tag} does not take {n} fields: {frame:?}"
            ))),
            _ => Err(StellwerkError::Protocol(format!(
                "unknown frame tag: {frame:?}"
            ))),
        }
    }

    /// The wire tag of this frame, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::TaskRequest { .. } => TASK_REQUEST,
            Message::TaskAssign(_) => TASK_ASSIGN,
            Message::Wait { .. } => WAIT_CMD,
            Message::TaskFinished { .. } => TASK_FINISHED,
            Message::Ack => ACK,
            Message::Heartbeat { .. } => HEARTBEAT,
            Message::Exit => EXIT_CMD,
        }
    }

    /// The sending controller's id, for frames that carry one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Message::TaskRequest { sender }
            | Message::TaskFinished { sender, .. }
            | Message::Heartbeat { sender } => Some(sender),
            _ => None,
        }
    }
}
