//! Shared worker status table.

use std::time::Instant;

use tokio::sync::Mutex;

/// Lifecycle state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Slot exists but the worker is not accepting tasks yet (or has exited).
    NotReady,
    /// Idle, parked on the task queue.
    Ready,
    /// Running a task body.
    Executing,
}

/// Status cell for one worker slot.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Task id currently executing, if any.
    pub tid: Option<String>,
    /// Last state transition.
    pub since: Instant,
}

impl WorkerStatus {
    fn initial() -> Self {
        Self {
            state: WorkerState::NotReady,
            tid: None,
            since: Instant::now(),
        }
    }
}

/// Fixed-size status table shared between the controller loop and its
/// workers.
///
/// One table-wide lock guards all slots. Every critical section is an O(1)
/// field update or a snapshot copy; the lock is never held across task
/// execution. Callers on the controller's hot path bound their acquisition
/// with `tokio::time::timeout`.
pub struct StatusTable {
    slots: Mutex<Vec<WorkerStatus>>,
    size: usize,
}

impl StatusTable {
    /// Table with `size` slots, all NotReady.
    pub fn new(size: usize) -> Self {
        Self {
            slots: Mutex::new((0..size).map(|_| WorkerStatus::initial()).collect()),
            size,
        }
    }

    /// Number of slots (fixed at construction).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark `slot` idle and clear its task id.
    pub async fn set_ready(&self, slot: usize) {
        let mut slots = self.slots.lock().await;
        slots[slot].state = WorkerState::Ready;
        slots[slot].tid = None;
        slots[slot].since = Instant::now();
    }

    /// Mark `slot` as executing `tid`.
    pub async fn set_executing(&self, slot: usize, tid: &str) {
        let mut slots = self.slots.lock().await;
        slots[slot].state = WorkerState::Executing;
        slots[slot].tid = Some(tid.to_string());
        slots[slot].since = Instant::now();
    }

    /// Mark `slot` out of service.
    pub async fn set_not_ready(&self, slot: usize) {
        let mut slots = self.slots.lock().await;
        slots[slot].state = WorkerState::NotReady;
        slots[slot].tid = None;
        slots[slot].since = Instant::now();
    }

    /// Copy of all slots.
    pub async fn snapshot(&self) -> Vec<WorkerStatus> {
        self.slots.lock().await.clone()
    }

    /// `(ready, alive)` counts in one lock acquisition; alive means Ready or
    /// Executing.
    pub async fn counts(&self) -> (usize, usize) {
        let slots = self.slots.lock().await;
        let ready = slots
            .iter()
            .filter(|s| s.state == WorkerState::Ready)
            .count();
        let alive = slots
            .iter()
            .filter(|s| s.state != WorkerState::NotReady)
            .count();
        (ready, alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slots_start_not_ready() {
        let table = StatusTable::new(3);
        assert_eq!(table.size(), 3);
        assert_eq!(table.counts().await, (0, 0));
        for slot in table.snapshot().await {
            assert_eq!(slot.state, WorkerState::NotReady);
            assert_eq!(slot.tid, None);
        }
    }

    #[tokio::test]
    async fn transitions_update_state_and_tid() {
        let table = StatusTable::new(2);
        table.set_ready(0).await;
        table.set_executing(1, "t-42").await;

        let slots = table.snapshot().await;
        assert_eq!(slots[0].state, WorkerState::Ready);
        assert_eq!(slots[0].tid, None);
        assert_eq!(slots[1].state, WorkerState::Executing);
        assert_eq!(slots[1].tid.as_deref(), Some("t-42"));
        assert_eq!(table.counts().await, (1, 2));

        table.set_ready(1).await;
        let slots = table.snapshot().await;
        assert_eq!(slots[1].state, WorkerState::Ready);
        assert_eq!(slots[1].tid, None);
        assert_eq!(table.counts().await, (2, 2));
    }

    #[tokio::test]
    async fn exit_returns_slot_to_not_ready() {
        let table = StatusTable::new(1);
        table.set_ready(0).await;
        table.set_not_ready(0).await;
        assert_eq!(table.counts().await, (0, 0));
    }
}
