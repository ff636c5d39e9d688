//! Scheduled task and execution records.

use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Kind of deferred work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    McpToolCall,
    PluginCommand,
    Notification,
    ShellCommand,
    Reminder,
    Sequence,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::McpToolCall => "mcp_tool_call",
            Self::PluginCommand => "plugin_command",
            Self::Notification => "notification",
            Self::ShellCommand => "shell_command",
            Self::Reminder => "reminder",
            Self::Sequence => "sequence",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SchedulerError> {
        match s {
            "mcp_tool_call" => Ok(Self::McpToolCall),
            "plugin_command" => Ok(Self::PluginCommand),
            "notification" => Ok(Self::Notification),
            "shell_command" => Ok(Self::ShellCommand),
            "reminder" => Ok(Self::Reminder),
            "sequence" => Ok(Self::Sequence),
            _ => Err(SchedulerError::InvalidArgs(format!(
                "unknown task type: {s}"
            ))),
        }
    }
}

/// Whether a task fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    OneTime,
    Recurring,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SchedulerError> {
        match s {
            "one_time" => Ok(Self::OneTime),
            "recurring" => Ok(Self::Recurring),
            _ => Err(SchedulerError::InvalidArgs(format!(
                "unknown schedule type: {s}"
            ))),
        }
    }
}

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SchedulerError> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(SchedulerError::InvalidArgs(format!(
                "unknown task status: {s}"
            ))),
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SchedulerError> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(SchedulerError::InvalidArgs(format!(
                "unknown execution status: {s}"
            ))),
        }
    }
}

/// A persisted record of deferred or recurring work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub task_type: TaskType,
    pub name: Option<String>,
    pub args: Map<String, Value>,
    pub schedule_type: ScheduleType,
    /// The original user-supplied spec, re-parsed when the task re-arms.
    pub schedule_spec: String,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(
        task_type: TaskType,
        args: Map<String, Value>,
        schedule_type: ScheduleType,
        schedule_spec: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type,
            name: None,
            args,
            schedule_type,
            schedule_spec: schedule_spec.into(),
            status: TaskStatus::Scheduled,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            max_runs: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }
}

/// One attempt to run a scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    /// Full error chain for diagnostics.
    pub error_detail: Option<String>,
    pub duration_ms: Option<i64>,
}

impl TaskExecution {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error_message: None,
            error_detail: None,
            duration_ms: None,
        }
    }

    fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.completed_at = Some(now);
        self.status = status;
    }

    pub fn mark_completed(mut self, result: Option<Value>) -> Self {
        self.finish(ExecutionStatus::Completed);
        self.result = result;
        self
    }

    pub fn mark_failed(mut self, message: String, detail: Option<String>) -> Self {
        self.finish(ExecutionStatus::Failed);
        self.error_message = Some(message);
        self.error_detail = detail;
        self
    }

    pub fn mark_cancelled(mut self) -> Self {
        self.finish(ExecutionStatus::Cancelled);
        self
    }
}

/// Validate an argument bag against its task type's shape.
pub fn validate_args(task_type: TaskType, args: &Map<String, Value>) -> Result<(), SchedulerError> {
    match task_type {
        TaskType::McpToolCall => {
            require_str(args, "server")?;
            require_str(args, "tool")?;
            optional_object(args, "arguments")
        }
        TaskType::PluginCommand => {
            require_str(args, "plugin")?;
            require_str(args, "command")?;
            optional_object(args, "args")
        }
        TaskType::Notification => require_str(args, "message"),
        TaskType::ShellCommand => require_str(args, "command"),
        TaskType::Reminder => require_str(args, "message"),
        TaskType::Sequence => {
            let steps = args
                .get("tasks")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    SchedulerError::InvalidArgs("sequence requires a 'tasks' array".to_string())
                })?;
            if steps.is_empty() {
                return Err(SchedulerError::InvalidArgs(
                    "sequence requires at least one step".to_string(),
                ));
            }
            for (i, step) in steps.iter().enumerate() {
                let step = step.as_object().ok_or_else(|| {
                    SchedulerError::InvalidArgs(format!("sequence step {i} must be an object"))
                })?;
                let step_type = step
                    .get("task_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SchedulerError::InvalidArgs(format!(
                            "sequence step {i} missing 'task_type'"
                        ))
                    })?;
                let step_type = TaskType::parse(step_type)?;
                let step_args = step
                    .get("args")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        SchedulerError::InvalidArgs(format!("sequence step {i} missing 'args'"))
                    })?;
                validate_args(step_type, step_args)?;
            }
            Ok(())
        }
    }
}

fn require_str(args: &Map<String, Value>, field: &str) -> Result<(), SchedulerError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(_) => Err(SchedulerError::InvalidArgs(format!(
            "'{field}' must be a non-empty string"
        ))),
        None => Err(SchedulerError::InvalidArgs(format!(
            "missing required field '{field}'"
        ))),
    }
}

fn optional_object(args: &Map<String, Value>, field: &str) -> Result<(), SchedulerError> {
    match args.get(field) {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(SchedulerError::InvalidArgs(format!(
            "'{field}' must be an object"
        ))),
    }
}
