//! Configuration for the orchestration core.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CobaltError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CobaltConfig {
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
    /// Heartbeat monitor tuning.
    pub monitor: MonitorConfig,
    /// Webhook callback tuning.
    pub callback: CallbackConfig,
}

/// Scheduler tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between scheduling passes, in milliseconds.
    pub pass_interval_ms: u64,
    /// Base retry backoff delay, in seconds.
    pub backoff_base_seconds: u64,
    /// Multiplier applied per attempt to the backoff delay.
    pub backoff_multiplier: f64,
    /// Symmetric jitter fraction applied to the backoff delay (0.2 = ±20%).
    pub backoff_jitter: f64,
    /// Pending time after which a task is promoted one priority tier.
    pub aging_threshold_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_ms: 100,
            backoff_base_seconds: 2,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.2,
            aging_threshold_seconds: 60,
        }
    }
}

/// Heartbeat monitor tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between liveness sweeps, in seconds.
    pub sweep_interval_seconds: u64,
    /// Heartbeat age beyond which an agent is considered lost, in seconds.
    pub staleness_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { sweep_interval_seconds: 5, staleness_seconds: 30 }
    }
}

/// Webhook callback tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Maximum delivery attempts per callback.
    pub attempts: u32,
    /// Delay between delivery attempts, in seconds.
    pub retry_delay_seconds: u64,
    /// Per-request timeout, in seconds.
    pub request_timeout_seconds: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self { attempts: 3, retry_delay_seconds: 1, request_timeout_seconds: 10 }
    }
}

impl CobaltConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CobaltError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` if the TOML is malformed.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CobaltError::Validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates numeric ranges.
    ///
    /// # Errors
    /// Returns `CobaltError::Validation` if a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.backoff_multiplier < 1.0 {
            return Err(CobaltError::Validation(
                "scheduler.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.scheduler.backoff_jitter) {
            return Err(CobaltError::Validation(
                "scheduler.backoff_jitter must be in [0.0, 1.0)".to_string(),
            ));
        }
        if self.monitor.staleness_seconds == 0 || self.monitor.sweep_interval_seconds == 0 {
            return Err(CobaltError::Validation(
                "monitor intervals must be greater than zero".to_string(),
            ));
        }
        if self.callback.attempts == 0 {
            return Err(CobaltError::Validation(
                "callback.attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CobaltConfig::default();
        assert_eq!(config.scheduler.pass_interval_ms, 100);
        assert_eq!(config.scheduler.aging_threshold_seconds, 60);
        assert_eq!(config.monitor.staleness_seconds, 30);
        assert_eq!(config.monitor.sweep_interval_seconds, 5);
        assert_eq!(config.callback.attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CobaltConfig::from_toml(
            r"
            [monitor]
            staleness_seconds = 45
            ",
        )
        .unwrap();
        assert_eq!(config.monitor.staleness_seconds, 45);
        assert_eq!(config.monitor.sweep_interval_seconds, 5);
        assert_eq!(config.scheduler.backoff_base_seconds, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CobaltConfig::from_toml(
            r"
            [scheduler]
            backoff_multiplier = 0.5
            ",
        )
        .is_err());

        assert!(CobaltConfig::from_toml(
            r"
            [callback]
            attempts = 0
            ",
        )
        .is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\npass_interval_ms = 250").unwrap();

        let config = CobaltConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.pass_interval_ms, 250);
    }
}
