//! Priority queue for tasks awaiting admission.
//!
//! Ordering is strict priority (high > normal > low), then FIFO within a
//! priority class. FIFO position is a monotonically increasing sequence
//! number handed out on every insertion, so ties between identical
//! timestamps cannot occur.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::domain::{Priority, PriorityBreakdown};

/// Position of a queued task. Smaller keys are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<Priority>,
    seq: u64,
}

impl QueueKey {
    fn priority(&self) -> Priority {
        self.rank.0
    }
}

/// Ordered holding area for task ids.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    ordered: BTreeMap<QueueKey, String>,
    index: HashMap<String, QueueKey>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail of `priority`'s class. Returns the assigned sequence.
    pub fn push(&mut self, id: &str, priority: Priority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(id, QueueKey {
            rank: Reverse(priority),
            seq,
        });
        seq
    }

    /// Insert with a previously assigned sequence, restoring an earlier position.
    pub fn push_at(&mut self, id: &str, priority: Priority, seq: u64) {
        self.insert(id, QueueKey {
            rank: Reverse(priority),
            seq,
        });
    }

    fn insert(&mut self, id: &str, key: QueueKey) {
        if let Some(old) = self.index.insert(id.to_string(), key) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key, id.to_string());
    }

    /// Head of the queue without removing it.
    pub fn peek(&self) -> Option<(&str, Priority)> {
        self.ordered
            .iter()
            .next()
            .map(|(key, id)| (id.as_str(), key.priority()))
    }

    /// Remove and return the head of the queue.
    pub fn pop(&mut self) -> Option<String> {
        let (_, id) = self.ordered.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    /// Pop the head only if its priority is at least `min`.
    ///
    /// Because the queue is priority ordered, a head below `min` means no
    /// queued task is eligible.
    pub fn pop_eligible(&mut self, min: Priority) -> Option<String> {
        match self.peek() {
            Some((_, priority)) if priority >= min => self.pop(),
            _ => None,
        }
    }

    /// Remove a task by id. Returns false if it was not queued.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(key) = self.index.remove(id) else {
            return false;
        };
        self.ordered.remove(&key);
        true
    }

    /// Move a queued task to the tail of `priority`'s class.
    ///
    /// Returns the new sequence, or None if the id is not queued.
    pub fn reprioritize(&mut self, id: &str, priority: Priority) -> Option<u64> {
        if !self.remove(id) {
            return None;
        }
        Some(self.push(id, priority))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Queued ids in dispatch order.
    pub fn ids(&self) -> Vec<String> {
        self.ordered.values().cloned().collect()
    }

    pub fn breakdown(&self) -> PriorityBreakdown {
        let mut breakdown = PriorityBreakdown::default();
        for key in self.ordered.keys() {
            breakdown.increment(key.priority());
        }
        breakdown
    }

    /// Remove everything, returning ids in dispatch order.
    pub fn drain(&mut self) -> Vec<String> {
        self.index.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }
}
