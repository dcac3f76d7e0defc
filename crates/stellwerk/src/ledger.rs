//! Master-side assignment ledger and controller liveness table.
//!
//! Both structures are plain in-memory state owned by the master loop; the
//! decision functions take the current instant as an argument so the resend
//! and pruning rules are testable without a clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::StellwerkError;

/// Lifecycle of one assignment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignState {
    Assigned,
    Finished,
}

/// Bookkeeping for one task id that has been handed out at least once.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub state: AssignState,
    /// Controller the task is (or was last) assigned to.
    pub owner: String,
    /// Last state transition.
    pub at: Instant,
}

/// Decision on a popped task id.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    /// Hand the task to the requester; the record now reads Assigned.
    Assign {
        /// True when an earlier assignment of the same tid is superseded.
        resend: bool,
    },
    /// In flight elsewhere and still fresh; the requester must wait.
    Defer,
}

/// Outcome of a finished notice against the ledger.
#[derive(Debug, PartialEq, Eq)]
pub enum FinishOutcome {
    /// First finish from the current owner; publish the tid downstream.
    Completed,
    /// Notice from a superseded owner; the ledger is untouched.
    Stale { current_owner: String },
    /// Repeat notice from the owner of an already-finished record.
    Duplicate,
}

/// Assignment ledger: every task id handed out at least once, with owner and
/// freshness.
#[derive(Debug)]
pub struct Ledger {
    records: HashMap<String, AssignmentRecord>,
    resend_timeout: Duration,
}

impl Ledger {
    pub fn new(resend_timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            resend_timeout,
        }
    }

    /// Decide whether a popped task may go to `sender`.
    ///
    /// Assigns when the tid has no record, when its record is Finished, or
    /// when the standing assignment is older than the resend timeout.
    /// Otherwise the task stays with its current owner and the caller must
    /// defer. A tid is never in flight twice within the resend window.
    pub fn offer(&mut self, tid: &str, sender: &str, now: Instant) -> Offer {
        let resend = match self.records.get(tid) {
            None => false,
            Some(record) if record.state == AssignState::Finished => false,
            Some(record) if now.saturating_duration_since(record.at) >= self.resend_timeout => {
                true
            }
            Some(_) => return Offer::Defer,
        };
        self.records.insert(
            tid.to_string(),
            AssignmentRecord {
                state: AssignState::Assigned,
                owner: sender.to_string(),
                at: now,
            },
        );
        Offer::Assign { resend }
    }

    /// Apply a finished notice from `sender`.
    ///
    /// A record advances to Finished only on the first notice from its
    /// current owner; superseded owners and repeats leave it untouched. A
    /// notice for a tid with no record at all is a ledger inconsistency.
    pub fn finish(
        &mut self,
        tid: &str,
        sender: &str,
        now: Instant,
    ) -> Result<FinishOutcome, StellwerkError> {
        let record = self.records.get_mut(tid).ok_or_else(|| {
            StellwerkError::Ledger(format!("finished notice for never-assigned task {tid:?}"))
        })?;
        if record.owner != sender {
            return Ok(FinishOutcome::Stale {
                current_owner: record.owner.clone(),
            });
        }
        if record.state == AssignState::Finished {
            return Ok(FinishOutcome::Duplicate);
        }
        record.state = AssignState::Finished;
        record.at = now;
        Ok(FinishOutcome::Completed)
    }

    pub fn get(&self, tid: &str) -> Option<&AssignmentRecord> {
        self.records.get(tid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Last-seen table of controllers, keyed by sender id.
#[derive(Debug, Default)]
pub struct LivenessTable {
    seen: HashMap<String, Instant>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity from `sender`.
    pub fn touch(&mut self, sender: &str, now: Instant) {
        self.seen.insert(sender.to_string(), now);
    }

    /// Forget `sender` immediately.
    pub fn remove(&mut self, sender: &str) {
        self.seen.remove(sender);
    }

    /// Drop every controller not seen within `timeout`. Returns how many
    /// were dropped.
    pub fn prune(&mut self, timeout: Duration, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) < timeout);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEND: Duration = Duration::from_secs(30);

    #[test]
    fn first_offer_assigns() {
        let mut ledger = Ledger::new(RESEND);
        let now = Instant::now();
        assert_eq!(
            ledger.offer("t-1", "ctrl-a", now),
            Offer::Assign { resend: false }
        );
        let record = ledger.get("t-1").unwrap();
        assert_eq!(record.state, AssignState::Assigned);
        assert_eq!(record.owner, "ctrl-a");
    }

    #[test]
    fn fresh_assignment_is_never_doubled() {
        let mut ledger = Ledger::new(RESEND);
        let t0 = Instant::now();
        ledger.offer("t-1", "ctrl-a", t0);

        // Same and other controllers both get deferred within the window.
        assert_eq!(
            ledger.offer("t-1", "ctrl-a", t0 + Duration::from_secs(1)),
            Offer::Defer
        );
        assert_eq!(
            ledger.offer("t-1", "ctrl-b", t0 + RESEND - Duration::from_millis(1)),
            Offer::Defer
        );
        assert_eq!(ledger.get("t-1").unwrap().owner, "ctrl-a");
    }

    #[test]
    fn stale_assignment_is_resent() {
        let mut ledger = Ledger::new(RESEND);
        let t0 = Instant::now();
        ledger.offer("t-1", "ctrl-a", t0);

        let offer = ledger.offer("t-1", "ctrl-b", t0 + RESEND);
        assert_eq!(offer, Offer::Assign { resend: true });
        let record = ledger.get("t-1").unwrap();
        assert_eq!(record.owner, "ctrl-b");
        assert_eq!(record.at, t0 + RESEND);
    }

    #[test]
    fn finished_record_is_reassignable() {
        let mut ledger = Ledger::new(RESEND);
        let t0 = Instant::now();
        ledger.offer("t-1", "ctrl-a", t0);
        ledger
            .finish("t-1", "ctrl-a", t0 + Duration::from_secs(1))
            .unwrap();

        assert_eq!(
            ledger.offer("t-1", "ctrl-b", t0 + Duration::from_secs(2)),
            Offer::Assign { resend: false }
        );
    }

    #[test]
    fn finish_from_current_owner_completes_once() {
        let mut ledger = Ledger::new(RESEND);
        let t0 = Instant::now();
        ledger.offer("t-1", "ctrl-a", t0);

        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(
            ledger.finish("t-1", "ctrl-a", t1).unwrap(),
            FinishOutcome::Completed
        );
        let record = ledger.get("t-1").unwrap();
        assert_eq!(record.state, AssignState::Finished);
        assert_eq!(record.at, t1);

        assert_eq!(
            ledger
                .finish("t-1", "ctrl-a", t1 + Duration::from_secs(1))
                .unwrap(),
            FinishOutcome::Duplicate
        );
        // Duplicate leaves the completion time alone.
        assert_eq!(ledger.get("t-1").unwrap().at, t1);
    }

    #[test]
    fn finish_from_superseded_owner_is_stale() {
        let mut ledger = Ledger::new(RESEND);
        let t0 = Instant::now();
        ledger.offer("t-1", "ctrl-a", t0);
        ledger.offer("t-1", "ctrl-b", t0 + RESEND);

        let outcome = ledger
            .finish("t-1", "ctrl-a", t0 + RESEND + Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            outcome,
            FinishOutcome::Stale {
                current_owner: "ctrl-b".into()
            }
        );
        // Unchanged: still assigned to ctrl-b at the resend instant.
        let record = ledger.get("t-1").unwrap();
        assert_eq!(record.state, AssignState::Assigned);
        assert_eq!(record.owner, "ctrl-b");
        assert_eq!(record.at, t0 + RESEND);
    }

    #[test]
    fn finish_without_record_is_an_inconsistency() {
        let mut ledger = Ledger::new(RESEND);
        let err = ledger.finish("ghost", "ctrl-a", Instant::now()).unwrap_err();
        assert!(matches!(err, StellwerkError::Ledger(_)));
    }

    #[test]
    fn liveness_prunes_only_silent_controllers() {
        let timeout = Duration::from_secs(10);
        let mut table = LivenessTable::new();
        let t0 = Instant::now();
        table.touch("ctrl-a", t0);
        table.touch("ctrl-b", t0 + Duration::from_secs(8));

        assert_eq!(table.prune(timeout, t0 + Duration::from_secs(12)), 1);
        assert_eq!(table.len(), 1);

        assert_eq!(table.prune(timeout, t0 + Duration::from_secs(30)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn liveness_touch_refreshes() {
        let timeout = Duration::from_secs(10);
        let mut table = LivenessTable::new();
        let t0 = Instant::now();
        table.touch("ctrl-a", t0);
        table.touch("ctrl-a", t0 + Duration::from_secs(9));

        assert_eq!(table.prune(timeout, t0 + Duration::from_secs(12)), 0);
        assert_eq!(table.len(), 1);

        table.remove("ctrl-a");
        assert!(table.is_empty());
    }
}
