//! Scheduling master.
//!
//! One REP socket, one loop: controllers request work, report completions,
//! and heartbeat; the master answers every request from its in-memory
//! ledger and backlog. Shutdown is never abrupt — signals and errors only
//! disable distribution, after which every caller is released with an exit
//! order and the loop ends once the liveness table drains.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeromq::prelude::*;
use zeromq::{RepSocket, ZmqMessage};

use crate::config::StellwerkConfig;
use crate::error::StellwerkError;
use crate::generator::TaskGenerator;
use crate::ledger::{FinishOutcome, Ledger, LivenessTable, Offer};
use crate::message::{Message, EXIT_CMD};
use crate::queue::SharedQueue;
use crate::registry::TaskRegistry;
use crate::task::TaskSpec;

/// Why the master loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterOutcome {
    /// Distribution ended and every known controller was released.
    Drained,
    /// Too many consecutive iteration errors.
    ErrorBudgetExhausted,
}

/// The scheduling authority. Owns the ledger, the liveness table, and the
/// REP end of the wire protocol.
pub struct Master {
    config: StellwerkConfig,
    backlog: Arc<SharedQueue<TaskSpec>>,
    finished: Arc<SharedQueue<String>>,
    generator: Arc<dyn TaskGenerator>,
    registry: TaskRegistry,
    ledger: Ledger,
    liveness: LivenessTable,
    cancel: CancellationToken,
    /// While true, requests are answered with work; once false, every
    /// request is answered with an exit order.
    distributing: bool,
    /// Back-off advertised in WAIT_CMD replies; zeroed for fast-drain.
    wait_secs: u64,
    consecutive_errors: u32,
}

impl Master {
    pub fn new(
        config: StellwerkConfig,
        backlog: Arc<SharedQueue<TaskSpec>>,
        finished: Arc<SharedQueue<String>>,
        generator: Arc<dyn TaskGenerator>,
        cancel: CancellationToken,
    ) -> Self {
        let ledger = Ledger::new(config.resend_timeout());
        let wait_secs = config.master.controller_wait_secs;
        Self {
            config,
            backlog,
            finished,
            generator,
            registry: TaskRegistry::builtin(),
            ledger,
            liveness: LivenessTable::new(),
            cancel,
            distributing: true,
            wait_secs,
            consecutive_errors: 0,
        }
    }

    /// Bind the REP socket and run the scheduling loop to completion.
    pub async fn run(mut self) -> Result<MasterOutcome, StellwerkError> {
        let transport = self.config.master_transport()?;
        transport.ensure_ipc_dir()?;
        transport.remove_stale_socket()?;

        let mut socket = RepSocket::new();
        socket.bind(&transport.endpoint()).await?;
        info!(endpoint = %transport, "master listening");

        loop {
            if self.consecutive_errors >= self.config.master.max_consecutive_errors {
                error!(
                    errors = self.consecutive_errors,
                    "consecutive error budget exhausted"
                );
                return Ok(MasterOutcome::ErrorBudgetExhausted);
            }
            if self.cancel.is_cancelled() && self.distributing {
                info!("shutdown requested, distribution disabled");
                self.distributing = false;
            }

            let msg = match tokio::time::timeout(self.config.poll_interval(), socket.recv()).await
            {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    warn!(error = %e, "socket recv error");
                    self.note_error();
                    continue;
                }
                Err(_) => {
                    // Poll timeout: no controller spoke up this interval.
                    if self.tick() {
                        info!("liveness table empty, master drained");
                        return Ok(MasterOutcome::Drained);
                    }
                    continue;
                }
            };

            // A received request must be answered whatever happens; REP
            // sockets enforce strict recv/send alternation.
            let reply = match self.dispatch(&msg).await {
                Ok(reply) => {
                    self.consecutive_errors = 0;
                    reply
                }
                Err(e) => {
                    warn!(error = %e, "request handling failed, releasing requester");
                    self.note_error();
                    Message::Exit
                }
            };
            let wire = match reply.encode() {
                Ok(wire) => wire,
                Err(e) => {
                    error!(error = %e, "reply not encodable, releasing requester");
                    self.note_error();
                    EXIT_CMD.to_string()
                }
            };
            if let Err(e) = socket.send(wire.into()).await {
                warn!(error = %e, "reply send error");
                self.note_error();
            }
        }
    }

    /// Decode one request and produce its reply.
    async fn dispatch(&mut self, msg: &ZmqMessage) -> Result<Message, StellwerkError> {
        let frame = frame_text(msg)?;
        let message = Message::decode(&frame)?;

        // Shutdown in progress: release whoever speaks, whatever they say.
        if !self.distributing {
            if let Some(sender) = message.sender() {
                self.liveness.remove(sender);
                info!(sender = %sender, "controller released");
            }
            return Ok(Message::Exit);
        }

        match message {
            Message::TaskRequest { sender } => self.handle_task_request(&sender).await,
            Message::TaskFinished { sender, tid } => {
                self.handle_task_finished(&sender, &tid).await
            }
            Message::Heartbeat { sender } => {
                debug!(sender = %sender, "heartbeat");
                self.liveness.touch(&sender, Instant::now());
                Ok(Message::Ack)
            }
            other => Err(StellwerkError::Protocol(format!(
                "unexpected {} frame on the scheduling socket",
                other.tag()
            ))),
        }
    }

    async fn handle_task_request(&mut self, sender: &str) -> Result<Message, StellwerkError> {
        let now = Instant::now();
        self.liveness.touch(sender, now);

        // Popping pairs an emptiness decision with ledger bookkeeping; the
        // compound lock keeps the generator's clear+fill swap out of the
        // middle. Bounded so one stuck holder cannot stall the loop.
        let guard =
            tokio::time::timeout(self.config.backlog_lock_wait(), self.backlog.transaction())
                .await;
        let Ok(_guard) = guard else {
            warn!(sender = %sender, "backlog lock contended, deferring requester");
            return Ok(self.wait_reply());
        };

        let Some(spec) = self.backlog.pop_nowait().await else {
            if self.generator.is_alive() {
                debug!(sender = %sender, "backlog empty, deferring requester");
            } else {
                // Nothing queued and nothing coming: fast-drain.
                info!("backlog drained and generator retired, distribution disabled");
                self.distributing = false;
                self.wait_secs = 0;
            }
            return Ok(self.wait_reply());
        };

        match self.ledger.offer(spec.tid(), sender, now) {
            Offer::Assign { resend } => {
                if resend {
                    warn!(tid = %spec.tid(), sender = %sender, "assignment timed out, resending");
                } else {
                    info!(tid = %spec.tid(), sender = %sender, "task assigned");
                }
                Ok(Message::TaskAssign(self.registry.encode(&spec)))
            }
            Offer::Defer => {
                // Dropped, not re-queued; the generator's next refill will
                // carry the tid again.
                debug!(tid = %spec.tid(), sender = %sender, "task still in flight, deferring");
                Ok(self.wait_reply())
            }
        }
    }

    async fn handle_task_finished(
        &mut self,
        sender: &str,
        tid: &str,
    ) -> Result<Message, StellwerkError> {
        let now = Instant::now();
        self.liveness.touch(sender, now);

        match self.ledger.finish(tid, sender, now)? {
            FinishOutcome::Completed => {
                // Bounded: a wedged finished stream must surface as an error,
                // not stall the reply.
                let published = tokio::time::timeout(
                    self.config.backlog_lock_wait(),
                    self.finished.push(tid.to_string()),
                )
                .await;
                if published.is_err() {
                    return Err(StellwerkError::Queue(format!(
                        "finished stream full, completion of {tid:?} not published"
                    )));
                }
                info!(tid = %tid, sender = %sender, "task finished");
                Ok(Message::Ack)
            }
            FinishOutcome::Stale { current_owner } => {
                warn!(
                    tid = %tid,
                    sender = %sender,
                    owner = %current_owner,
                    "stale finished notice ignored"
                );
                Ok(Message::Ack)
            }
            FinishOutcome::Duplicate => {
                debug!(tid = %tid, sender = %sender, "duplicate finished notice");
                Ok(Message::Ack)
            }
        }
    }

    fn wait_reply(&self) -> Message {
        Message::Wait {
            seconds: self.wait_secs,
        }
    }

    /// Count one failed iteration and stop handing out work.
    fn note_error(&mut self) {
        self.consecutive_errors += 1;
        if self.distributing {
            warn!(
                errors = self.consecutive_errors,
                "distribution disabled after iteration error"
            );
            self.distributing = false;
        }
    }

    /// Poll-timeout housekeeping. True once shutdown is complete.
    fn tick(&mut self) -> bool {
        if self.distributing {
            return false;
        }
        let dropped = self
            .liveness
            .prune(self.config.controller_timeout(), Instant::now());
        if dropped > 0 {
            info!(
                dropped,
                remaining = self.liveness.len(),
                "pruned silent controllers"
            );
        }
        self.liveness.is_empty()
    }
}

/// The request payload as UTF-8 text. The protocol is single-frame.
fn frame_text(msg: &ZmqMessage) -> Result<String, StellwerkError> {
    let frame = msg
        .get(0)
        .ok_or_else(|| StellwerkError::Transport("empty zeromq message".into()))?;
    String::from_utf8(frame.to_vec())
        .map_err(|_| StellwerkError::Transport("frame is not valid UTF-8".into()))
}
