//! Bounded FIFO shared between producer and consumer tasks.
//!
//! Locking happens in two layers and the layers stay separate:
//!
//! 1. every single call on the queue is internally atomic (a per-call lock
//!    plus condition signalling), so concurrent callers never corrupt it;
//! 2. compound sequences (check emptiness then pop, clear then refill) are
//!    NOT atomic on their own. Callers that need one must hold the guard
//!    returned by [`SharedQueue::transaction`] for the whole sequence, which
//!    locks out other compound holders while single calls keep working.

use std::collections::VecDeque;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::StellwerkError;

/// FIFO queue with per-call atomicity and an explicit compound-operation lock.
pub struct SharedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    xlock: Mutex<()>,
}

impl<T> SharedQueue<T> {
    /// Empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            xlock: Mutex::new(()),
        }
    }

    /// Acquire the compound-operation lock.
    ///
    /// Hold the guard across multi-call sequences that must not interleave
    /// with other compound holders. Single calls stay atomic without it.
    pub async fn transaction(&self) -> MutexGuard<'_, ()> {
        self.xlock.lock().await
    }

    /// Seed the queue with a batch of items.
    ///
    /// Fails if the queue is not empty or the batch exceeds capacity; the
    /// queue is unchanged on failure.
    pub async fn fill(&self, items: Vec<T>) -> Result<(), StellwerkError> {
        let mut queue = self.inner.lock().await;
        if !queue.is_empty() {
            return Err(StellwerkError::Queue(format!(
                "fill on a non-empty queue ({} item(s) present)",
                queue.len()
            )));
        }
        if items.len() > self.capacity {
            return Err(StellwerkError::Queue(format!(
                "fill of {} item(s) exceeds capacity {}",
                items.len(),
                self.capacity
            )));
        }
        let added = items.len();
        queue.extend(items);
        if added > 0 {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Drop every queued item.
    pub async fn clear(&self) {
        let mut queue = self.inner.lock().await;
        queue.clear();
        self.not_full.notify_one();
    }

    /// Append one item, waiting while the queue is at capacity.
    pub async fn push(&self, item: T) {
        loop {
            let notified = self.not_full.notified();
            {
                let mut queue = self.inner.lock().await;
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    // Pass the signal on while space remains, so one wakeup
                    // is never lost among several parked callers.
                    if queue.len() < self.capacity {
                        self.not_full.notify_one();
                    }
                    self.not_empty.notify_one();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Remove and return the oldest item, waiting while the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut queue = self.inner.lock().await;
                if let Some(item) = queue.pop_front() {
                    if !queue.is_empty() {
                        self.not_empty.notify_one();
                    }
                    self.not_full.notify_one();
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Remove and return the oldest item, or `None` right away when empty.
    pub async fn pop_nowait(&self) -> Option<T> {
        let mut queue = self.inner.lock().await;
        let item = queue.pop_front();
        if item.is_some() {
            if !queue.is_empty() {
                self.not_empty.notify_one();
            }
            self.not_full.notify_one();
        }
        item
    }

    /// Best-effort emptiness snapshot. Stale as soon as the lock drops;
    /// pair with [`Self::transaction`] when the answer must hold for a
    /// following call.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Best-effort length snapshot.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
