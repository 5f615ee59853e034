//! Memory pressure signal and the admission policy it drives.
//!
//! The scheduler never reads host state itself. A [`PressureSource`] is
//! injected at construction and sampled on every admission pass; the
//! [`PressurePolicy`] maps the sampled label to the lowest priority admitted
//! freely. Tasks below that floor are throttled, not blocked: they only take
//! one of a few throttled slots, and only when nothing at or above the floor
//! is waiting.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::Priority;

/// Coarse memory pressure label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    #[default]
    Low,
    Medium,
    High,
}

impl MemoryPressure {
    fn as_u8(self) -> u8 {
        match self {
            MemoryPressure::Low => 0,
            MemoryPressure::Medium => 1,
            MemoryPressure::High => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => MemoryPressure::Low,
            1 => MemoryPressure::Medium,
            _ => MemoryPressure::High,
        }
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryPressure::Low => "low",
            MemoryPressure::Medium => "medium",
            MemoryPressure::High => "high",
        };
        f.write_str(s)
    }
}

/// Scheduler state visible to a pressure source when it is sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressureContext {
    pub queued: usize,
    pub running: usize,
}

/// Source of the memory pressure reading.
///
/// Sampled while the scheduler's state lock is held, so implementations must
/// be cheap and must not call back into the scheduler.
pub trait PressureSource: Send + Sync {
    fn sample(&self, ctx: &PressureContext) -> MemoryPressure;
}

/// A reading pushed in from outside (host callbacks, tests).
#[derive(Debug, Default)]
pub struct FixedPressure {
    level: AtomicU8,
}

impl FixedPressure {
    pub fn new(level: MemoryPressure) -> Self {
        Self {
            level: AtomicU8::new(level.as_u8()),
        }
    }

    /// Replace the current reading.
    pub fn set(&self, level: MemoryPressure) {
        self.level.store(level.as_u8(), Ordering::SeqCst);
    }

    pub fn get(&self) -> MemoryPressure {
        MemoryPressure::from_u8(self.level.load(Ordering::SeqCst))
    }
}

impl PressureSource for FixedPressure {
    fn sample(&self, _ctx: &PressureContext) -> MemoryPressure {
        self.get()
    }
}

/// Queue-depth thresholds for [`QueueDepthPressure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDepthThresholds {
    /// Queued count at or above which pressure is medium
    pub medium: usize,
    /// Queued count at or above which pressure is high
    pub high: usize,
}

impl Default for QueueDepthThresholds {
    fn default() -> Self {
        Self { medium: 64, high: 256 }
    }
}

/// Derives pressure from how many tasks are waiting.
#[derive(Debug, Clone, Default)]
pub struct QueueDepthPressure {
    thresholds: QueueDepthThresholds,
}

impl QueueDepthPressure {
    pub fn new(thresholds: QueueDepthThresholds) -> Self {
        Self { thresholds }
    }
}

impl PressureSource for QueueDepthPressure {
    fn sample(&self, ctx: &PressureContext) -> MemoryPressure {
        if ctx.queued >= self.thresholds.high {
            MemoryPressure::High
        } else if ctx.queued >= self.thresholds.medium {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }
}

/// Lowest priority admitted freely at each pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressurePolicy {
    pub low: Priority,
    pub medium: Priority,
    pub high: Priority,
    /// Running tasks allowed below the current floor. Must be at least 1 so a
    /// queue-depth source can always drain the backlog that raised it.
    pub throttled_slots: usize,
}

impl Default for PressurePolicy {
    fn default() -> Self {
        Self {
            low: Priority::Low,
            medium: Priority::Normal,
            high: Priority::High,
            throttled_slots: 1,
        }
    }
}

impl PressurePolicy {
    /// Minimum priority a task needs to be admitted under `pressure`.
    pub fn min_priority(&self, pressure: MemoryPressure) -> Priority {
        match pressure {
            MemoryPressure::Low => self.low,
            MemoryPressure::Medium => self.medium,
            MemoryPressure::High => self.high,
        }
    }

    /// True if `priority` is at or above the floor for `pressure`.
    pub fn admits(&self, pressure: MemoryPressure, priority: Priority) -> bool {
        priority >= self.min_priority(pressure)
    }

    /// True if one more below-floor task may start while `throttled` are running.
    pub fn has_throttled_slot(&self, throttled: usize) -> bool {
        throttled < self.throttled_slots
    }
}

/// Pressure section of the scheduler config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub policy: PressurePolicy,
    pub queue_depth: QueueDepthThresholds,
}
