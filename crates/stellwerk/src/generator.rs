//! Task generation seam and the built-in batch generator.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::SharedQueue;
use crate::task::TaskSpec;

/// Supplies the master's backlog and consumes its finished stream.
///
/// The generator decides what work exists; the master only decides who runs
/// it. Re-enqueueing still-unfinished specs on the generator's schedule is
/// what turns the ledger's resend rule into actual re-delivery.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    /// Run until no further backlog will ever be produced.
    async fn start(&self);

    /// False once the generator has retired; with an empty backlog this
    /// tells the master to begin draining.
    fn is_alive(&self) -> bool;
}

/// Generator for one fixed batch of tasks.
///
/// Keeps the batch's unfinished specs flowing into the backlog: whenever the
/// backlog has been drained and the refill interval has passed, the
/// remaining specs are enqueued again. Retires once every tid in the batch
/// has come back on the finished stream.
pub struct BatchGenerator {
    backlog: Arc<SharedQueue<TaskSpec>>,
    finished: Arc<SharedQueue<String>>,
    batch: Vec<TaskSpec>,
    outstanding: Mutex<HashSet<String>>,
    alive: AtomicBool,
    refill_interval: Duration,
    cancel: CancellationToken,
}

impl BatchGenerator {
    pub fn new(
        backlog: Arc<SharedQueue<TaskSpec>>,
        finished: Arc<SharedQueue<String>>,
        batch: Vec<TaskSpec>,
        refill_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let outstanding = batch.iter().map(|s| s.tid().to_string()).collect();
        Self {
            backlog,
            finished,
            batch,
            outstanding: Mutex::new(outstanding),
            alive: AtomicBool::new(true),
            refill_interval,
            cancel,
        }
    }

    /// Refill the backlog with the batch's unfinished specs.
    ///
    /// Emptiness check and fill happen under the backlog's compound lock so
    /// the master's pop sequence can never interleave with the swap. A
    /// backlog that still holds tasks is left alone.
    async fn refill(&self) {
        let outstanding = self.outstanding.lock().await;
        let _guard = self.backlog.transaction().await;
        if !self.backlog.is_empty().await {
            debug!("backlog not yet drained, skipping refill");
            return;
        }
        let specs: Vec<TaskSpec> = self
            .batch
            .iter()
            .filter(|s| outstanding.contains(s.tid()))
            .cloned()
            .collect();
        if specs.is_empty() {
            return;
        }
        debug!(count = specs.len(), "refilling backlog");
        if let Err(e) = self.backlog.fill(specs).await {
            warn!(error = %e, "backlog refill failed");
        }
    }

    fn retire(&self, reason: &str) {
        info!(reason, "generator retiring");
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskGenerator for BatchGenerator {
    async fn start(&self) {
        info!(tasks = self.batch.len(), "batch generator started");
        if self.outstanding.lock().await.is_empty() {
            self.retire("batch complete");
            return;
        }
        let mut next_refill = tokio::time::Instant::now();

        loop {
            if tokio::time::Instant::now() >= next_refill {
                self.refill().await;
                next_refill = tokio::time::Instant::now() + self.refill_interval;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.retire("cancelled");
                    return;
                }
                tid = self.finished.pop() => {
                    let mut outstanding = self.outstanding.lock().await;
                    if outstanding.remove(&tid) {
                        debug!(tid = %tid, remaining = outstanding.len(), "task retired");
                    }
                    if outstanding.is_empty() {
                        drop(outstanding);
                        self.retire("batch complete");
                        return;
                    }
                }
                _ = tokio::time::sleep_until(next_refill) => {}
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
