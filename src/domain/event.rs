//! Lifecycle events broadcast by the scheduler.
//!
//! Collaborators that want per-task completion notification subscribe to the
//! scheduler; everyone else just queries state.

use serde::{Deserialize, Serialize};

use super::task::Priority;

/// A state transition observed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task entered the queue
    Queued { task_id: String, priority: Priority },
    /// Task was admitted; `attempt` is 1-based
    Started { task_id: String, attempt: u32 },
    /// Attempt failed and the task went back to the queue
    Retrying { task_id: String, attempt: u32, error: String },
    /// Task moved to another priority class while queued
    Reprioritized { task_id: String, priority: Priority },
    /// Work resolved successfully
    Completed { task_id: String, attempts: u32 },
    /// Work failed with no retry remaining
    Failed { task_id: String, attempts: u32, error: String },
    /// Task was cancelled while queued or running
    Cancelled { task_id: String },
}

impl TaskEvent {
    /// The task this event concerns
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Queued { task_id, .. }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Retrying { task_id, .. }
            | TaskEvent::Reprioritized { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id } => task_id,
        }
    }

    /// True for events that end a task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }
}
