use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchedulerError};
use crate::scheduler::PressureConfig;

/// Where a retried task re-enters its priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPlacement {
    /// Behind every task already queued at the same priority
    #[default]
    Tail,
    /// Back at its previous position, ahead of newer same-priority work
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub default_max_retries: u32,
    pub retry_placement: RetryPlacement,
    /// Interval of the background admission pass; 0 disables it
    pub poll_interval_ms: u64,
    pub event_capacity: usize,
    /// Terminal tasks remembered for `task_state`/`attempts` and duplicate-id
    /// checks; the oldest are forgotten first
    pub retired_capacity: usize,
    pub pressure: PressureConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_max_retries: 2,
            retry_placement: RetryPlacement::Tail,
            poll_interval_ms: 200,
            event_capacity: 256,
            retired_capacity: 1024,
            pressure: PressureConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_retry_placement(mut self, placement: RetryPlacement) -> Self {
        self.retry_placement = placement;
        self
    }

    pub fn with_retired_capacity(mut self, capacity: usize) -> Self {
        self.retired_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    /// Reject settings the dispatcher cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrency must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "event_capacity must be positive".to_string(),
            ));
        }
        if self.pressure.policy.throttled_slots == 0 {
            return Err(SchedulerError::InvalidConfig(
                "pressure.policy.throttled_slots must be positive".to_string(),
            ));
        }
        let depth = &self.pressure.queue_depth;
        if depth.medium > depth.high {
            return Err(SchedulerError::InvalidConfig(format!(
                "pressure.queue_depth.medium ({}) exceeds pressure.queue_depth.high ({})",
                depth.medium, depth.high
            )));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // Explicit path must load, no fallback
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
