//! tasksched - A bounded-concurrency priority task scheduler
//!
//! Runs in-process asynchronous work with priorities, retries, cooperative
//! cancellation and memory-pressure backpressure, and exposes a consistent
//! stats snapshot for introspection.

pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod scheduler;

pub use config::{RetryPlacement, SchedulerConfig};
pub use domain::{Priority, PriorityBreakdown, StatsSnapshot, TaskEvent, TaskFn, TaskSpec, TaskState};
pub use error::{Result, SchedulerError};
pub use scheduler::{FixedPressure, MemoryPressure, PressureContext, PressurePolicy, PressureSource, Scheduler};
pub use tokio_util::sync::CancellationToken;
