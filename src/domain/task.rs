//! Task record and related types
//!
//! A task is one unit of schedulable asynchronous work. Callers describe it
//! with a [`TaskSpec`]; the scheduler turns that into a [`TaskRecord`] with an
//! explicit lifecycle [`TaskState`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// The deferred unit of work.
///
/// Invoked once per attempt with the task's cancellation token. Must be safe
/// to call again when the task is retried.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Relative urgency of a task. Ordering is `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// All priorities, most urgent first
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}' (expected high, normal or low)", other)),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the priority queue
    Queued,
    /// Admitted and executing
    Running,
    /// Work resolved successfully
    Completed,
    /// Work failed and no retry remains
    Failed,
    /// Cancelled while queued or running
    Cancelled,
}

impl TaskState {
    /// Returns true if no further transitions can leave this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Caller-facing description of a task to enqueue.
///
/// `created_at` and `attempts` are assigned by the scheduler.
pub struct TaskSpec {
    pub id: Option<String>,
    pub run: TaskFn,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    pub retry_on_fail: bool,
    /// None falls back to the scheduler's default cap
    pub max_retries: Option<u32>,
    pub cancellation: Option<CancellationToken>,
}

impl TaskSpec {
    /// Create a spec from an async closure.
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        Self::from_fn(Arc::new(
            move |token: CancellationToken| -> BoxFuture<'static, eyre::Result<()>> { Box::pin(run(token)) },
        ))
    }

    /// Create a spec from an already boxed task function.
    pub fn from_fn(run: TaskFn) -> Self {
        Self {
            id: None,
            run,
            priority: Priority::default(),
            tags: BTreeSet::new(),
            retry_on_fail: false,
            max_retries: None,
            cancellation: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Re-enqueue the task when its work fails.
    pub fn retry_on_fail(mut self) -> Self {
        self.retry_on_fail = true;
        self
    }

    /// Bound retries explicitly. Implies `retry_on_fail`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_fail = true;
        self.max_retries = Some(max_retries);
        self
    }

    /// Link the task to a caller-owned token. The task gets a child token, so
    /// cancelling the task never cancels the caller's token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .field("retry_on_fail", &self.retry_on_fail)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// A task tracked by the scheduler
pub struct TaskRecord {
    //=== Identity ===
    pub id: String,
    pub run: TaskFn,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,

    //=== Policy ===
    pub priority: Priority,
    pub retry_on_fail: bool,
    pub max_retries: Option<u32>,

    //=== Runtime State ===
    pub state: TaskState,
    /// Incremented each time the task is dispatched
    pub attempts: u32,
    /// FIFO position within the priority class, reassigned on each requeue
    pub queue_seq: u64,
    pub token: CancellationToken,
    /// Set once a cancel was delivered while running
    pub cancel_requested: bool,
}

impl TaskRecord {
    /// Build a queued record from a spec and its effective id
    pub fn from_spec(id: String, spec: TaskSpec) -> Self {
        Self {
            id,
            run: spec.run,
            tags: spec.tags,
            created_at: Utc::now(),
            priority: spec.priority,
            retry_on_fail: spec.retry_on_fail,
            max_retries: spec.max_retries,
            state: TaskState::Queued,
            attempts: 0,
            queue_seq: 0,
            token: spec
                .cancellation
                .map(|parent| parent.child_token())
                .unwrap_or_default(),
            cancel_requested: false,
        }
    }

    /// Whether a failure after the current attempt should be retried
    pub fn can_retry(&self, default_max_retries: u32) -> bool {
        let cap = self.max_retries.unwrap_or(default_max_retries);
        self.retry_on_fail && self.attempts <= cap
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("tags", &self.tags)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_spec() -> TaskSpec {
        TaskSpec::new(|_token| async { Ok(()) })
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::ALL[0], Priority::High);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_serialization() {
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
    }

    #[test]
    fn test_task_state_is_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_spec_defaults() {
        let spec = noop_spec();
        assert!(spec.id.is_none());
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.tags.is_empty());
        assert!(!spec.retry_on_fail);
        assert!(spec.max_retries.is_none());
    }

    #[test]
    fn test_spec_builder() {
        let spec = noop_spec()
            .with_id("search-1")
            .with_priority(Priority::High)
            .with_tag("search")
            .with_tags(["prefetch", "search"])
            .with_max_retries(3);

        assert_eq!(spec.id.as_deref(), Some("search-1"));
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.tags.len(), 2);
        assert!(spec.retry_on_fail);
        assert_eq!(spec.max_retries, Some(3));
    }

    #[test]
    fn test_record_from_spec() {
        let record = TaskRecord::from_spec("t1".to_string(), noop_spec().with_tag("a"));
        assert_eq!(record.state, TaskState::Queued);
        assert_eq!(record.attempts, 0);
        assert!(record.tags.contains("a"));
        assert!(!record.cancel_requested);
        assert!(!record.token.is_cancelled());
    }

    #[test]
    fn test_record_follows_caller_token() {
        let token = CancellationToken::new();
        let record = TaskRecord::from_spec("t1".to_string(), noop_spec().with_cancellation(token.clone()));
        token.cancel();
        assert!(record.token.is_cancelled());
    }

    #[test]
    fn test_record_cancel_does_not_reach_caller_token() {
        let token = CancellationToken::new();
        let record = TaskRecord::from_spec("t1".to_string(), noop_spec().with_cancellation(token.clone()));
        record.token.cancel();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_can_retry_respects_cap() {
        let mut record = TaskRecord::from_spec("t1".to_string(), noop_spec().with_max_retries(2));
        record.attempts = 1;
        assert!(record.can_retry(5));
        record.attempts = 2;
        assert!(record.can_retry(5));
        record.attempts = 3;
        assert!(!record.can_retry(5));
    }

    #[test]
    fn test_can_retry_uses_default_cap() {
        let mut record = TaskRecord::from_spec("t1".to_string(), noop_spec().retry_on_fail());
        record.attempts = 1;
        assert!(record.can_retry(1));
        record.attempts = 2;
        assert!(!record.can_retry(1));
    }

    #[test]
    fn test_can_retry_disabled() {
        let mut record = TaskRecord::from_spec("t1".to_string(), noop_spec());
        record.attempts = 1;
        assert!(!record.can_retry(10));
    }
}
