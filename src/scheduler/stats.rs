//! Lifetime counters backing the stats snapshot.
//!
//! Counters only ever increase. Live counts (queued, running, per-priority)
//! are derived from the queue and running set when a snapshot is taken.

use crate::domain::TaskState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeCounters {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

impl LifetimeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a task reaching `state`. Non-terminal states are ignored.
    pub fn record_terminal(&mut self, state: TaskState) {
        match state {
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
            TaskState::Queued | TaskState::Running => {}
        }
    }

    pub fn record_retry(&mut self) {
        self.retried += 1;
    }
}
