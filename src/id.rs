//! ID generation utilities for tasksched
//!
//! Provides functions for generating unique identifiers for tasks.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique task ID
///
/// Format: `task-{timestamp_ms}-{seq}-{random_hex}`
/// Example: `task-1738300800123-7-a1b2`
///
/// `seq` is the scheduler's own enqueue counter, so two ids generated in the
/// same millisecond by the same scheduler never collide.
pub fn generate_task_id(seq: u64) -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("task-{}-{}-{:04x}", timestamp, seq, random)
}
