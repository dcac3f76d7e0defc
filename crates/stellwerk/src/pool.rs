//! Worker pool executing assigned tasks inside a controller.
//!
//! Workers are tokio tasks sharing one task queue, one result queue, and one
//! status table. Task bodies run on the blocking thread pool, so a body that
//! blocks, fails, or panics never takes its worker loop down with it; its
//! task id is reported as finished either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::queue::SharedQueue;
use crate::status::StatusTable;
use crate::task::{TaskRunner, TaskSpec};

/// One unit handed to a worker through the task queue.
///
/// Shutdown is the poison pill: pushing one is the only way to release a
/// worker parked on an empty queue.
pub enum WorkItem {
    Run(TaskSpec),
    Shutdown,
}

/// Fixed-size pool of worker tasks.
pub struct WorkerPool {
    tasks: Arc<SharedQueue<WorkItem>>,
    results: Arc<SharedQueue<String>>,
    status: Arc<StatusTable>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers and return the pool handle.
    pub fn start(runner: Arc<dyn TaskRunner>, config: &PoolConfig) -> Self {
        let tasks = Arc::new(SharedQueue::new(config.task_capacity));
        let results = Arc::new(SharedQueue::new(config.result_capacity));
        let status = Arc::new(StatusTable::new(config.workers));
        let cancel = CancellationToken::new();

        let handles = (0..config.workers)
            .map(|slot| {
                tokio::spawn(worker_loop(
                    slot,
                    Arc::clone(&runner),
                    Arc::clone(&tasks),
                    Arc::clone(&results),
                    Arc::clone(&status),
                    cancel.child_token(),
                ))
            })
            .collect();

        info!(workers = config.workers, "worker pool started");
        Self {
            tasks,
            results,
            status,
            cancel,
            handles,
        }
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.status.size()
    }

    /// The shared status table.
    pub fn status(&self) -> &Arc<StatusTable> {
        &self.status
    }

    /// Queue a task for execution.
    pub async fn submit(&self, spec: TaskSpec) {
        self.tasks.push(WorkItem::Run(spec)).await;
    }

    /// Take one finished task id, if any worker has reported one.
    pub async fn take_finished(&self) -> Option<String> {
        self.results.pop_nowait().await
    }

    /// Wait until every worker has come up Ready, up to `bound`.
    pub async fn wait_ready(&self, bound: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            let (ready, _) = self.status.counts().await;
            if ready == self.size() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Begin a cooperative shutdown.
    ///
    /// Cancels the workers' token, abandons unstarted tasks (the master
    /// re-assigns them once their records go stale), and pushes one stop
    /// pill per alive worker so parked pops wake up.
    pub async fn begin_shutdown(&self) {
        self.cancel.cancel();

        let _guard = self.tasks.transaction().await;
        self.tasks.clear().await;
        let (_, alive) = self.status.counts().await;
        info!(alive, "signalling workers to stop");
        for _ in 0..alive {
            self.tasks.push(WorkItem::Shutdown).await;
        }
    }

    /// Wait up to `grace` for the workers to exit, then abort stragglers.
    /// Returns how many had to be aborted.
    pub async fn join(self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;

        for (slot, mut handle) in self.handles.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(slot, "worker did not stop within grace, aborting");
                    handle.abort();
                    self.status.set_not_ready(slot).await;
                    aborted += 1;
                }
            }
        }

        if aborted == 0 {
            info!("all workers stopped gracefully");
        } else {
            warn!(aborted, "worker pool stopped with aborts");
        }
        aborted
    }
}

async fn worker_loop(
    slot: usize,
    runner: Arc<dyn TaskRunner>,
    tasks: Arc<SharedQueue<WorkItem>>,
    results: Arc<SharedQueue<String>>,
    status: Arc<StatusTable>,
    cancel: CancellationToken,
) {
    status.set_ready(slot).await;
    debug!(slot, "worker ready");

    loop {
        // Checked between tasks only; a parked pop is released by a pill.
        if cancel.is_cancelled() {
            break;
        }
        match tasks.pop().await {
            WorkItem::Shutdown => {
                debug!(slot, "worker received stop pill");
                break;
            }
            WorkItem::Run(spec) => {
                let tid = spec.tid().to_string();
                status.set_executing(slot, &tid).await;
                run_body(slot, &runner, spec).await;
                // Finished means "no longer in flight", not "succeeded".
                results.push(tid).await;
                status.set_ready(slot).await;
            }
        }
    }

    status.set_not_ready(slot).await;
    debug!(slot, "worker stopped");
}

async fn run_body(slot: usize, runner: &Arc<dyn TaskRunner>, spec: TaskSpec) {
    let tid = spec.tid().to_string();
    let runner = Arc::clone(runner);
    match tokio::task::spawn_blocking(move || runner.execute(&spec)).await {
        Ok(Ok(())) => debug!(slot, tid = %tid, "task completed"),
        Ok(Err(e)) => warn!(slot, tid = %tid, error = %e, "task body failed"),
        Err(e) if e.is_panic() => warn!(slot, tid = %tid, "task body panicked"),
        Err(e) => warn!(slot, tid = %tid, error = %e, "task body cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::task::TaskError;

    const JOIN_GRACE: Duration = Duration::from_secs(2);

    fn pool_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            task_capacity: 16,
            result_capacity: 16,
            shutdown_grace_ms: 2000,
            status_wait_ms: 200,
        }
    }

    fn smoke(tid: &str) -> TaskSpec {
        TaskSpec::Smoke { tid: tid.into() }
    }

    /// Records executed tids; fails on "fail-*" tids, panics on "boom-*".
    struct ScriptedRunner {
        executed: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
            })
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl TaskRunner for ScriptedRunner {
        fn execute(&self, spec: &TaskSpec) -> Result<(), TaskError> {
            let tid = spec.tid().to_string();
            self.executed.lock().unwrap().push(tid.clone());
            if tid.starts_with("boom") {
                panic!("scripted panic for {tid}");
            }
            if tid.starts_with("fail") {
                return Err(TaskError::Failed(format!("scripted failure for {tid}")));
            }
            Ok(())
        }
    }

    /// Sleeps long enough to outlive any reasonable shutdown grace.
    struct StuckRunner;

    impl TaskRunner for StuckRunner {
        fn execute(&self, _spec: &TaskSpec) -> Result<(), TaskError> {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        }
    }

    async fn drain_results(pool: &WorkerPool, n: usize) -> Vec<String> {
        let mut tids = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tids.len() < n {
            if let Some(tid) = pool.take_finished().await {
                tids.push(tid);
            } else {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "workers reported only {} of {n} results",
                    tids.len()
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        tids
    }

    #[tokio::test]
    async fn executes_and_reports_each_task() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::start(runner.clone(), &pool_config(2));
        assert!(pool.wait_ready(Duration::from_secs(1)).await);

        pool.submit(smoke("t-1")).await;
        pool.submit(smoke("t-2")).await;
        pool.submit(smoke("t-3")).await;

        let mut tids = drain_results(&pool, 3).await;
        tids.sort();
        assert_eq!(tids, ["t-1", "t-2", "t-3"]);

        let mut executed = runner.executed();
        executed.sort();
        assert_eq!(executed, ["t-1", "t-2", "t-3"]);

        pool.begin_shutdown().await;
        assert_eq!(pool.join(JOIN_GRACE).await, 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_bodies_still_report_finished() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::start(runner.clone(), &pool_config(1));
        assert!(pool.wait_ready(Duration::from_secs(1)).await);

        pool.submit(smoke("boom-1")).await;
        pool.submit(smoke("fail-1")).await;
        pool.submit(smoke("ok-1")).await;

        // Single worker: results arrive in order, each exactly once, and the
        // worker survives both the panic and the failure.
        let tids = drain_results(&pool, 3).await;
        assert_eq!(tids, ["boom-1", "fail-1", "ok-1"]);
        assert!(pool.take_finished().await.is_none());

        let (ready, alive) = pool.status().counts().await;
        assert_eq!((ready, alive), (1, 1));

        pool.begin_shutdown().await;
        assert_eq!(pool.join(JOIN_GRACE).await, 0);
    }

    #[tokio::test]
    async fn pills_release_parked_workers() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::start(runner, &pool_config(3));
        assert!(pool.wait_ready(Duration::from_secs(1)).await);

        // All three are parked on the empty queue.
        pool.begin_shutdown().await;
        assert_eq!(pool.join(JOIN_GRACE).await, 0);
    }

    #[tokio::test]
    async fn unstarted_tasks_are_abandoned_on_shutdown() {
        let runner = ScriptedRunner::new();
        let pool = WorkerPool::start(runner.clone(), &pool_config(1));
        assert!(pool.wait_ready(Duration::from_secs(1)).await);

        // One executes, the rest sit in the queue when shutdown begins.
        pool.submit(smoke("t-1")).await;
        drain_results(&pool, 1).await;
        pool.submit(smoke("t-2")).await;
        pool.submit(smoke("t-3")).await;

        pool.begin_shutdown().await;
        let aborted = pool.join(JOIN_GRACE).await;
        assert_eq!(aborted, 0);

        let executed = runner.executed();
        assert!(executed.contains(&"t-1".to_string()));
    }

    #[tokio::test]
    async fn stuck_worker_is_aborted_after_grace() {
        let pool = WorkerPool::start(Arc::new(StuckRunner), &pool_config(1));
        assert!(pool.wait_ready(Duration::from_secs(1)).await);

        pool.submit(smoke("t-slow")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = Arc::clone(pool.status());
        pool.begin_shutdown().await;
        let aborted = pool.join(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);

        let (_, alive) = status.counts().await;
        assert_eq!(alive, 0);
    }
}
