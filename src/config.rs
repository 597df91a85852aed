//! Job configuration.
//!
//! All tunable literals live here rather than being scattered across
//! components: segment sizing, checkpoint interval, retry policy, and
//! the controller's polling and shutdown timings.

use crate::errors::PlanError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one segmented simulation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Total simulated time in nanoseconds.
    pub total_ns: f64,
    /// Nominal duration of each segment in nanoseconds. The final
    /// segment may be shorter.
    pub segment_ns: f64,
    /// How often the engine is asked to write a checkpoint, in minutes.
    #[serde(default = "default_checkpoint_interval_minutes")]
    pub checkpoint_interval_minutes: u32,
    /// Maximum automatic retries of a failed segment before halting.
    #[serde(default = "default_max_segment_retries")]
    pub max_segment_retries: u32,
    /// Delay between retries of a failed segment, in seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Liveness/progress poll interval for a running engine, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on stop, in seconds.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_checkpoint_interval_minutes() -> u32 {
    15
}

fn default_max_segment_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_stop_grace_secs() -> u64 {
    30
}

impl JobConfig {
    /// Create a config with default tunables for the given durations.
    pub fn new(total_ns: f64, segment_ns: f64) -> Self {
        Self {
            total_ns,
            segment_ns,
            checkpoint_interval_minutes: default_checkpoint_interval_minutes(),
            max_segment_retries: default_max_segment_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }

    /// Validate the durations. Non-positive or non-finite durations are
    /// rejected before any planning happens.
    pub fn validate(&self) -> Result<(), PlanError> {
        if !self.total_ns.is_finite() || self.total_ns <= 0.0 {
            return Err(PlanError::InvalidConfiguration {
                message: format!("total_ns must be positive, got {}", self.total_ns),
            });
        }
        if !self.segment_ns.is_finite() || self.segment_ns <= 0.0 {
            return Err(PlanError::InvalidConfiguration {
                message: format!("segment_ns must be positive, got {}", self.segment_ns),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = JobConfig::new(100.0, 10.0);
        assert_eq!(config.checkpoint_interval_minutes, 15);
        assert_eq!(config.max_segment_retries, 3);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.stop_grace(), Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_non_positive_durations() {
        assert!(JobConfig::new(0.0, 10.0).validate().is_err());
        assert!(JobConfig::new(-5.0, 10.0).validate().is_err());
        assert!(JobConfig::new(100.0, 0.0).validate().is_err());
        assert!(JobConfig::new(100.0, -1.0).validate().is_err());
        assert!(JobConfig::new(f64::NAN, 10.0).validate().is_err());
        assert!(JobConfig::new(100.0, 10.0).validate().is_ok());
    }

    #[test]
    fn deserializes_with_missing_tunables() {
        let config: JobConfig =
            serde_json::from_str(r#"{"total_ns": 30.0, "segment_ns": 10.0}"#).unwrap();
        assert_eq!(config.total_ns, 30.0);
        assert_eq!(config.max_segment_retries, 3);
        assert_eq!(config.checkpoint_interval_minutes, 15);
    }
}
