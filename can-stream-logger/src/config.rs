//! Logger configuration types
//!
//! This module defines the knobs of the lifecycle engines: which job the
//! listener runs, the capture/flush periods of the batch logger and the
//! stop/rebind policies. Loading the values from a file is the job of the
//! application layer (can-stream-cli).

use crate::types::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What the listener does with each frame after updating the snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    /// Record the frame through the log facade
    #[default]
    Log,
    /// Forward `(description, payload)` to a publish sink
    Publish,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Log => write!(f, "log"),
            Job::Publish => write!(f, "publish"),
        }
    }
}

/// One watched CAN ID as supplied by the configuration provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    /// CAN message ID
    pub id: u32,
    /// Human readable description, also the snapshot column name
    pub desc: String,
}

impl WatchEntry {
    pub fn new(id: u32, desc: impl Into<String>) -> Self {
        Self {
            id,
            desc: desc.into(),
        }
    }
}

/// Configuration for the listener, watcher and batch logger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Job of the listener's per-frame callback
    #[serde(default)]
    pub job: Job,

    /// Period of the capture task in milliseconds (default: 1000ms)
    #[serde(default = "default_capture_period")]
    pub capture_period_ms: u64,

    /// Period of the flush task in milliseconds (default: 10000ms)
    #[serde(default = "default_flush_period")]
    pub flush_period_ms: u64,

    /// Receive timeout of the dispatch loop in milliseconds (default: 100ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Restart a stopped listener when a new channel is bound
    #[serde(default)]
    pub restart_on_rebind: bool,

    /// Optional upper bound for `stop()`; `None` waits for the loop forever
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,

    /// Watcher logs its progress every this many frames (default: 1000)
    #[serde(default = "default_report_every")]
    pub watcher_report_every: u64,

    /// Prefix prepended to every publish topic (default: "avl/")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_capture_period() -> u64 {
    1000
}

fn default_flush_period() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_report_every() -> u64 {
    1000
}

fn default_topic_prefix() -> String {
    "avl/".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            job: Job::default(),
            capture_period_ms: default_capture_period(),
            flush_period_ms: default_flush_period(),
            poll_interval_ms: default_poll_interval(),
            restart_on_rebind: false,
            stop_timeout_ms: None,
            watcher_report_every: default_report_every(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

impl LoggerConfig {
    /// Create a new logger configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: select the listener job
    pub fn with_job(mut self, job: Job) -> Self {
        self.job = job;
        self
    }

    /// Builder method: set capture and flush periods
    pub fn with_periods(mut self, capture_ms: u64, flush_ms: u64) -> Self {
        self.capture_period_ms = capture_ms;
        self.flush_period_ms = flush_ms;
        self
    }

    /// Builder method: set the dispatch loop receive timeout
    pub fn with_poll_interval(mut self, poll_ms: u64) -> Self {
        self.poll_interval_ms = poll_ms;
        self
    }

    /// Builder method: restart the listener on rebind even when stopped
    pub fn with_restart_on_rebind(mut self, enabled: bool) -> Self {
        self.restart_on_rebind = enabled;
        self
    }

    /// Builder method: bound the time `stop()` waits for a loop
    pub fn with_stop_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.stop_timeout_ms = timeout_ms;
        self
    }

    /// Builder method: set the watcher progress cadence
    pub fn with_watcher_report_every(mut self, frames: u64) -> Self {
        self.watcher_report_every = frames;
        self
    }

    /// Builder method: set the publish topic prefix
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn capture_period(&self) -> Duration {
        Duration::from_millis(self.capture_period_ms)
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_ms.map(Duration::from_millis)
    }

    /// Check the periods before any loop is built from this configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("capture_period_ms", self.capture_period_ms),
            ("flush_period_ms", self.flush_period_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.flush_period_ms < self.capture_period_ms {
            log::warn!(
                "flush_period_ms ({}) is shorter than capture_period_ms ({}); most flushes will be empty",
                self.flush_period_ms,
                self.capture_period_ms
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_config_builder() {
        let config = LoggerConfig::new()
            .with_job(Job::Publish)
            .with_periods(50, 500)
            .with_poll_interval(10)
            .with_restart_on_rebind(true)
            .with_stop_timeout(Some(250))
            .with_topic_prefix("car/");

        assert_eq!(config.job, Job::Publish);
        assert_eq!(config.capture_period(), Duration::from_millis(50));
        assert_eq!(config.flush_period(), Duration::from_millis(500));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(config.restart_on_rebind);
        assert_eq!(config.stop_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.topic_prefix, "car/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = LoggerConfig::default();
        assert_eq!(config.job, Job::Log);
        assert_eq!(config.capture_period_ms, 1000);
        assert_eq!(config.flush_period_ms, 10_000);
        assert!(!config.restart_on_rebind);
        assert_eq!(config.stop_timeout(), None);
    }

    #[test]
    fn test_zero_period_rejected() {
        let config = LoggerConfig::new().with_periods(0, 100);
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "capture_period_ms"),
            other => panic!("unexpected result: {:?}", other),
        }

        let config = LoggerConfig::new().with_poll_interval(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_job_display() {
        assert_eq!(Job::Log.to_string(), "log");
        assert_eq!(Job::Publish.to_string(), "publish");
    }
}
