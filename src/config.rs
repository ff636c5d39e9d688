//! Configuration for the event bus and task scheduler.
//!
//! Embedding applications deserialize these from their own config file:
//!
//! ```toml
//! [bus]
//! max_history = 1000
//!
//! [scheduler]
//! db_path = "scheduler/tasks.db"
//! poll_interval_secs = 1
//! default_max_retries = 3
//! ```

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of events retained in history.
    #[serde(default = "BusConfig::default_max_history")]
    pub max_history: usize,

    /// Seconds a persisted event survives in the shared backend.
    #[serde(default = "BusConfig::default_event_ttl_secs")]
    pub event_ttl_secs: i64,

    /// How often shared-backend workers poll the job queue (milliseconds).
    #[serde(default = "BusConfig::default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
}

impl BusConfig {
    fn default_max_history() -> usize {
        1000
    }

    fn default_event_ttl_secs() -> i64 {
        86_400 // 24 hours
    }

    fn default_job_poll_interval_ms() -> u64 {
        250
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: Self::default_max_history(),
            event_ttl_secs: Self::default_event_ttl_secs(),
            job_poll_interval_ms: Self::default_job_poll_interval_ms(),
        }
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Database path (relative to the embedder's workspace).
    #[serde(default = "SchedulerConfig::default_db_path")]
    pub db_path: String,

    /// How often the poll loop checks for due tasks (seconds).
    #[serde(default = "SchedulerConfig::default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Retry budget applied when a task does not set its own.
    #[serde(default = "SchedulerConfig::default_max_retries")]
    pub default_max_retries: u32,

    /// Base delay before the first retry; doubles per attempt, capped at an hour.
    #[serde(default = "SchedulerConfig::default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Wall-clock budget for one execution. Exceeding it counts as a failure.
    /// `None` disables the timeout.
    #[serde(default = "SchedulerConfig::default_execution_timeout")]
    pub execution_timeout_secs: Option<u64>,
}

impl SchedulerConfig {
    fn default_db_path() -> String {
        "scheduler/tasks.db".to_string()
    }

    fn default_poll_interval() -> u64 {
        1
    }

    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_backoff() -> u64 {
        30
    }

    fn default_execution_timeout() -> Option<u64> {
        Some(300)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            poll_interval_secs: Self::default_poll_interval(),
            default_max_retries: Self::default_max_retries(),
            retry_backoff_secs: Self::default_retry_backoff(),
            execution_timeout_secs: Self::default_execution_timeout(),
        }
    }
}

/// Combined configuration, loadable from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from a TOML file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }
}
