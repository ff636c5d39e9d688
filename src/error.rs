//! Error types for the event bus and task scheduler.

use thiserror::Error;

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// `publish` was called before `start`. The fire-and-forget
    /// `publish_sync` degrades to a logged no-op instead of raising this.
    #[error("event bus is not running")]
    NotRunning,

    /// Subscription pattern failed to compile.
    #[error("invalid subscription pattern: {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A schedule specification that could not be parsed.
///
/// Raised for malformed cron and absolute specs. Unrecognized relative
/// phrases are not errors; `parse_relative` returns `None` for those.
#[derive(Debug, Error)]
pub enum ScheduleParseError {
    /// Malformed cron expression.
    #[error("invalid cron expression: {expression}")]
    Cron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    /// Cron expression with the wrong number of fields.
    #[error("cron expression must have 5 fields, got {found}: {expression}")]
    CronFieldCount { expression: String, found: usize },

    /// String that matched none of the accepted shapes.
    #[error("could not parse schedule spec: {0}")]
    Unrecognized(String),
}

/// Errors raised by the task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task argument bag failed per-type validation.
    #[error("invalid task arguments: {0}")]
    InvalidArgs(String),

    /// No runner registered for the task type.
    #[error("no runner registered for task type: {0}")]
    UnknownRunner(String),

    /// Task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Schedule spec could not be parsed.
    #[error(transparent)]
    Parse(#[from] ScheduleParseError),

    /// Task store error.
    #[error("task store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from a shared key-value backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// Backend-specific failure (connectivity, I/O, corruption).
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for KvError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
