//! Point-in-time statistics snapshot.

use serde::{Deserialize, Serialize};

use super::task::Priority;
use crate::scheduler::MemoryPressure;

/// Queued plus running task counts per priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityBreakdown {
    pub fn increment(&mut self, priority: Priority) {
        match priority {
            Priority::High => self.high += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }
}

/// Consistent view of the scheduler taken under a single lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub running: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Re-enqueues after failed attempts (lifetime)
    pub retried: u64,
    pub by_priority: PriorityBreakdown,
    pub running_ids: Vec<String>,
    /// In dispatch order
    pub queued_ids: Vec<String>,
    pub memory_pressure: MemoryPressure,
    pub paused: bool,
}

impl StatsSnapshot {
    /// Tasks not yet in a terminal state
    pub fn active(&self) -> usize {
        self.running + self.queued
    }

    /// Tasks that reached a terminal state
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}
