//! Per-node controller.
//!
//! One REQ socket toward the master, one worker pool at home. The loop
//! always has exactly one request in flight: report a completion if one is
//! pending, otherwise ask for work when a worker is idle, otherwise
//! heartbeat. Unanswered requests tear the connection down and rebuild it;
//! the retry budget bounds how long a silent master is tolerated.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{ReqSocket, ZmqMessage};

use crate::config::StellwerkConfig;
use crate::error::StellwerkError;
use crate::message::Message;
use crate::pool::WorkerPool;
use crate::registry::TaskRegistry;

/// Why the controller loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerOutcome {
    /// The master ordered shutdown and the pool wound down.
    CleanShutdown,
    /// The reply retry budget ran out.
    TransportExhausted,
    /// Every worker left service without an exit order.
    PoolFailed,
}

/// What the loop does after a handled reply.
#[derive(Debug)]
enum Step {
    Continue,
    Stop(ControllerOutcome),
}

/// Pause before rebuilding a torn-down connection.
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Patience for the pool's initial spin-up.
const POOL_START: Duration = Duration::from_secs(2);

/// The node-local scheduling agent.
pub struct Controller {
    config: StellwerkConfig,
    id: String,
    pool: WorkerPool,
    registry: TaskRegistry,
    cancel: CancellationToken,
    retries: u32,
    /// Completion not yet acknowledged by the master. Survives reconnects;
    /// dropped only on shutdown.
    pending_finish: Option<String>,
}

impl Controller {
    pub fn new(config: StellwerkConfig, pool: WorkerPool, cancel: CancellationToken) -> Self {
        let id = if config.controller.id.is_empty() {
            format!("ctrl-{}", Uuid::new_v4())
        } else {
            config.controller.id.clone()
        };
        Self {
            config,
            id,
            pool,
            registry: TaskRegistry::builtin(),
            cancel,
            retries: 0,
            pending_finish: None,
        }
    }

    /// Wire id of this controller.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the request loop until the master releases us or the node fails.
    ///
    /// The pool is wound down on every exit path, including errors.
    pub async fn run(mut self) -> Result<ControllerOutcome, StellwerkError> {
        let endpoint = match self.config.controller_transport() {
            Ok(transport) => transport.endpoint(),
            Err(e) => {
                self.wind_down().await;
                return Err(e);
            }
        };

        if !self.pool.wait_ready(POOL_START).await {
            warn!("no worker became ready in time");
            return Ok(self.finish(ControllerOutcome::PoolFailed).await);
        }
        info!(
            endpoint = %endpoint,
            id = %self.id,
            workers = self.pool.size(),
            "controller started"
        );

        let mut socket: Option<ReqSocket> = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested");
                return Ok(self.finish(ControllerOutcome::CleanShutdown).await);
            }

            let Some(probe) = self.choose_probe().await else {
                warn!("all workers out of service");
                return Ok(self.finish(ControllerOutcome::PoolFailed).await);
            };

            let mut live = match socket.take() {
                Some(live) => live,
                None => match connect(&endpoint).await {
                    Ok(live) => live,
                    Err(e) => {
                        warn!(error = %e, "connect failed");
                        if self.bump_retry() {
                            return Ok(self.finish(ControllerOutcome::TransportExhausted).await);
                        }
                        self.nap(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            let wire = match probe.encode() {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, "request not encodable");
                    self.wind_down().await;
                    return Err(e);
                }
            };
            let sent_finish = matches!(probe, Message::TaskFinished { .. });
            debug!(tag = probe.tag(), "probing master");

            if let Err(e) = live.send(wire.into()).await {
                warn!(error = %e, "send failed, rebuilding connection");
                if self.bump_retry() {
                    return Ok(self.finish(ControllerOutcome::TransportExhausted).await);
                }
                self.nap(RECONNECT_DELAY).await;
                continue;
            }

            let reply = match tokio::time::timeout(self.config.reply_timeout(), live.recv()).await
            {
                Ok(Ok(msg)) => {
                    self.retries = 0;
                    match frame_text(&msg).and_then(|text| Message::decode(&text)) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(error = %e, "master reply unusable");
                            self.wind_down().await;
                            return Err(e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "recv failed, rebuilding connection");
                    if self.bump_retry() {
                        return Ok(self.finish(ControllerOutcome::TransportExhausted).await);
                    }
                    self.nap(RECONNECT_DELAY).await;
                    continue;
                }
                Err(_) => {
                    warn!(
                        timeout = ?self.config.reply_timeout(),
                        "no reply from master, rebuilding connection"
                    );
                    if self.bump_retry() {
                        return Ok(self.finish(ControllerOutcome::TransportExhausted).await);
                    }
                    self.nap(RECONNECT_DELAY).await;
                    continue;
                }
            };

            // Exchange complete; the connection is good, keep it.
            socket = Some(live);

            match self.handle_reply(reply, sent_finish).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop(outcome)) => return Ok(self.finish(outcome).await),
                Err(e) => {
                    warn!(error = %e, "reply handling failed");
                    self.wind_down().await;
                    return Err(e);
                }
            }
        }
    }

    /// Pick the next request, most urgent first: an unreported completion,
    /// then work hunger, then a bare heartbeat. `None` means no worker is
    /// left alive.
    async fn choose_probe(&mut self) -> Option<Message> {
        if let Some(tid) = &self.pending_finish {
            return Some(Message::TaskFinished {
                sender: self.id.clone(),
                tid: tid.clone(),
            });
        }
        if let Some(tid) = self.pool.take_finished().await {
            self.pending_finish = Some(tid.clone());
            return Some(Message::TaskFinished {
                sender: self.id.clone(),
                tid,
            });
        }

        let counts =
            tokio::time::timeout(self.config.status_wait(), self.pool.status().counts()).await;
        match counts {
            Ok((ready, _)) if ready > 0 => Some(Message::TaskRequest {
                sender: self.id.clone(),
            }),
            Ok((_, alive)) if alive > 0 => Some(Message::Heartbeat {
                sender: self.id.clone(),
            }),
            Ok(_) => None,
            Err(_) => {
                // Cannot see the table; do not claim readiness blindly.
                warn!("status table lock contended, heartbeating");
                Some(Message::Heartbeat {
                    sender: self.id.clone(),
                })
            }
        }
    }

    async fn handle_reply(
        &mut self,
        reply: Message,
        sent_finish: bool,
    ) -> Result<Step, StellwerkError> {
        match reply {
            Message::TaskAssign(assign) => {
                let spec = self.registry.decode(&assign)?;
                info!(tid = %spec.tid(), "task accepted");
                self.pool.submit(spec).await;
                Ok(Step::Continue)
            }
            Message::Wait { seconds } => {
                debug!(seconds, "master says wait");
                self.nap(Duration::from_secs(seconds)).await;
                Ok(Step::Continue)
            }
            Message::Ack => {
                if sent_finish {
                    self.pending_finish = None;
                }
                Ok(Step::Continue)
            }
            Message::Exit => {
                info!("exit ordered by master");
                Ok(Step::Stop(ControllerOutcome::CleanShutdown))
            }
            other => Err(StellwerkError::Protocol(format!(
                "unexpected {} reply from master",
                other.tag()
            ))),
        }
    }

    /// Wind the pool down and report the outcome.
    async fn finish(self, outcome: ControllerOutcome) -> ControllerOutcome {
        self.wind_down().await;
        info!(outcome = ?outcome, "controller stopped");
        outcome
    }

    /// Stop the pool: abandon queued tasks, give running ones the grace
    /// window, abort the rest.
    async fn wind_down(self) {
        let grace = self.config.shutdown_grace();
        self.pool.begin_shutdown().await;
        let aborted = self.pool.join(grace).await;
        if aborted > 0 {
            warn!(aborted, "workers force-terminated during shutdown");
        }
    }

    fn bump_retry(&mut self) -> bool {
        self.retries += 1;
        warn!(
            retries = self.retries,
            max = self.config.controller.max_retries,
            "master exchange failed"
        );
        self.retries >= self.config.controller.max_retries
    }

    /// Sleep that shutdown can interrupt.
    async fn nap(&self, wait: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn connect(endpoint: &str) -> Result<ReqSocket, StellwerkError> {
    let mut socket = ReqSocket::new();
    socket.connect(endpoint).await?;
    Ok(socket)
}

/// The reply payload as UTF-8 text. The protocol is single-frame.
fn frame_text(msg: &ZmqMessage) -> Result<String, StellwerkError> {
    let frame = msg
        .get(0)
        .ok_or_else(|| StellwerkError::Transport("empty zeromq message".into()))?;
    String::from_utf8(frame.to_vec())
        .map_err(|_| StellwerkError::Transport("frame is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::TaskAssign;
    use crate::task::{TaskError, TaskRunner, TaskSpec};

    struct OkRunner;

    impl TaskRunner for OkRunner {
        fn execute(&self, _spec: &TaskSpec) -> Result<(), TaskError> {
            Ok(())
        }
    }

    struct SlowRunner;

    impl TaskRunner for SlowRunner {
        fn execute(&self, _spec: &TaskSpec) -> Result<(), TaskError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    fn controller_with(runner: Arc<dyn TaskRunner>, workers: usize) -> Controller {
        let mut config = StellwerkConfig::local();
        config.pool.workers = workers;
        let pool = WorkerPool::start(runner, &config.pool);
        Controller::new(config, pool, CancellationToken::new())
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let controller = controller_with(Arc::new(OkRunner), 1);
        assert!(controller.id().starts_with("ctrl-"));

        let mut config = StellwerkConfig::local();
        config.controller.id = "ctrl-node-3".into();
        let pool = WorkerPool::start(Arc::new(OkRunner), &config.pool);
        let named = Controller::new(config, pool, CancellationToken::new());
        assert_eq!(named.id(), "ctrl-node-3");
    }

    #[tokio::test]
    async fn probe_prefers_pending_finish() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        controller.pool.wait_ready(Duration::from_secs(2)).await;
        controller.pending_finish = Some("t-9".into());

        let probe = controller.choose_probe().await.unwrap();
        match probe {
            Message::TaskFinished { sender, tid } => {
                assert_eq!(sender, controller.id());
                assert_eq!(tid, "t-9");
            }
            other => panic!("expected a finished notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_requests_work_when_a_worker_is_ready() {
        let mut controller = controller_with(Arc::new(OkRunner), 2);
        assert!(controller.pool.wait_ready(Duration::from_secs(2)).await);

        let probe = controller.choose_probe().await.unwrap();
        assert!(matches!(probe, Message::TaskRequest { .. }));
    }

    #[tokio::test]
    async fn probe_heartbeats_while_all_workers_are_busy() {
        let mut controller = controller_with(Arc::new(SlowRunner), 1);
        assert!(controller.pool.wait_ready(Duration::from_secs(2)).await);

        controller
            .pool
            .submit(TaskSpec::Smoke { tid: "t-1".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let probe = controller.choose_probe().await.unwrap();
        assert!(matches!(probe, Message::Heartbeat { .. }));
    }

    #[tokio::test]
    async fn probe_is_none_once_every_worker_exited() {
        let mut controller = controller_with(Arc::new(OkRunner), 2);
        assert!(controller.pool.wait_ready(Duration::from_secs(2)).await);

        controller.pool.begin_shutdown().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(controller.choose_probe().await.is_none());
    }

    #[tokio::test]
    async fn ack_clears_pending_finish() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        controller.pending_finish = Some("t-1".into());

        let step = controller.handle_reply(Message::Ack, true).await.unwrap();
        assert!(matches!(step, Step::Continue));
        assert!(controller.pending_finish.is_none());
    }

    #[tokio::test]
    async fn ack_for_non_finish_probe_keeps_pending() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        controller.pending_finish = Some("t-1".into());

        controller.handle_reply(Message::Ack, false).await.unwrap();
        assert_eq!(controller.pending_finish.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn assignment_is_decoded_and_executed() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        assert!(controller.pool.wait_ready(Duration::from_secs(2)).await);

        let assign = Message::TaskAssign(TaskAssign {
            module: "probe".into(),
            kind: "smoke".into(),
            tid: "t-1".into(),
            args: vec![],
        });
        let step = controller.handle_reply(assign, false).await.unwrap();
        assert!(matches!(step, Step::Continue));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(tid) = controller.pool.take_finished().await {
                assert_eq!(tid, "t-1");
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task should have executed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn exit_reply_stops_the_loop() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        let step = controller.handle_reply(Message::Exit, false).await.unwrap();
        assert!(matches!(
            step,
            Step::Stop(ControllerOutcome::CleanShutdown)
        ));
    }

    #[tokio::test]
    async fn unexpected_reply_is_a_protocol_error() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        let err = controller
            .handle_reply(
                Message::TaskRequest {
                    sender: "other".into(),
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StellwerkError::Protocol(_)));
    }

    #[tokio::test]
    async fn retry_budget_trips_at_the_configured_maximum() {
        let mut controller = controller_with(Arc::new(OkRunner), 1);
        controller.config.controller.max_retries = 3;

        assert!(!controller.bump_retry());
        assert!(!controller.bump_retry());
        assert!(controller.bump_retry());
    }
}
