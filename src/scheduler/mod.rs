//! Bounded-concurrency task scheduling.
//!
//! This module provides:
//! - **Priority queue**: strict high > normal > low ordering, FIFO within a class.
//! - **Cancellation registry**: id and tag lookup of live tasks' cancellation tokens.
//! - **Memory pressure**: an injected coarse signal and the admission policy it drives.
//! - **Dispatcher**: the [`Scheduler`] handle, which admits work up to
//!   `max_concurrency`, retries failures, and records terminal states.
//!
//! # Architecture
//!
//! The dispatcher is event driven with a polling backstop:
//! 1. `enqueue` pushes into the queue and runs an admission pass
//! 2. Admitted tasks are spawned onto the Tokio runtime
//! 3. Each settled attempt records its outcome and runs another admission pass
//! 4. A periodic tick re-runs admission for tasks held back by memory pressure
//!
//! # Example
//!
//! ```ignore
//! use tasksched::{Priority, Scheduler, SchedulerConfig, TaskSpec};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let id = scheduler.enqueue(
//!     TaskSpec::new(|token| async move { refresh_feed(token).await })
//!         .with_priority(Priority::High)
//!         .with_tag("feed")
//!         .with_max_retries(2),
//! )?;
//!
//! scheduler.cancel_by_tag("feed");
//! scheduler.shutdown().await;
//! ```

mod dispatcher;
mod pressure;
mod queue;
mod registry;
mod stats;

pub use dispatcher::Scheduler;
pub use pressure::{
    FixedPressure, MemoryPressure, PressureConfig, PressureContext, PressurePolicy, PressureSource,
    QueueDepthPressure, QueueDepthThresholds,
};
