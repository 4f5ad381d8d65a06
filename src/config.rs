//! Queue configuration.
//!
//! Loadable from JSON; every field has a default so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

pub const IN_DIR: &str = "in";
pub const OUT_DIR: &str = "out";
pub const READ_DIR: &str = "read";
pub const SENT_DIR: &str = "sent";
pub const FAILED_DIR: &str = "failed";

/// Configuration for one endpoint's storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Storage root. Holds `in/`, `out/`, `read/`, `sent/` and `failed/`.
    /// Default: `./msg`
    pub root: PathBuf,

    /// How long read and sent audit logs are kept, in hours.
    /// Default: 48
    pub read_log_retention_hours: f64,

    /// Write read and sent audit logs at all.
    /// Default: true
    pub persist_read_logs: bool,

    /// Minimum gap between audit-log retention sweeps, in seconds.
    /// Default: 7200 (2 hours)
    pub cleanup_interval_secs: u64,

    /// Outbound delivery retry policy.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("msg"),
            read_log_retention_hours: 48.0,
            persist_read_logs: true,
            cleanup_interval_secs: 2 * 60 * 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.read_log_retention_hours.is_finite() || self.read_log_retention_hours < 0.0 {
            return Err(Error::Config(format!(
                "read_log_retention_hours must be a non-negative number, got {}",
                self.read_log_retention_hours
            )));
        }
        self.retry.validate()
    }

    pub fn read_log_retention(&self) -> Duration {
        Duration::from_secs_f64(self.read_log_retention_hours.max(0.0) * 3600.0)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn in_dir(&self) -> PathBuf {
        self.root.join(IN_DIR)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join(OUT_DIR)
    }

    pub fn read_dir(&self) -> PathBuf {
        self.root.join(READ_DIR)
    }

    pub fn sent_dir(&self) -> PathBuf {
        self.root.join(SENT_DIR)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }
}

/// Bounded exponential backoff for outbound delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before a message is moved to `failed/`.
    /// Default: 10
    pub max_attempts: u32,

    /// Delay after the first failure, in milliseconds. Doubles per attempt.
    /// Default: 100
    pub base_delay_ms: u64,

    /// Upper bound on the delay, in milliseconds.
    /// Default: 30000
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
