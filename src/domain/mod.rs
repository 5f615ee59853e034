//! Domain types for tasksched
//!
//! This module contains the core domain types:
//! - Task: TaskSpec (caller input), TaskRecord (tracked state), Priority, TaskState
//! - Event: lifecycle notifications broadcast to subscribers
//! - Stats: the consistent snapshot returned by `Scheduler::stats`

pub mod event;
pub mod stats;
pub mod task;

pub use event::TaskEvent;
pub use stats::{PriorityBreakdown, StatsSnapshot};
pub use task::{Priority, TaskFn, TaskRecord, TaskSpec, TaskState};
