//! SQLite persistence for scheduled tasks and their executions.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE scheduled_tasks (
//!     task_id TEXT PRIMARY KEY,
//!     task_type TEXT NOT NULL,
//!     name TEXT,
//!     args TEXT NOT NULL,             -- JSON argument bag
//!     schedule_type TEXT NOT NULL,    -- 'one_time', 'recurring'
//!     schedule_spec TEXT NOT NULL,    -- original user-supplied spec
//!     status TEXT NOT NULL,
//!     last_run_at INTEGER,            -- ms since epoch
//!     next_run_at INTEGER,
//!     run_count INTEGER DEFAULT 0,
//!     max_runs INTEGER,
//!     retry_count INTEGER DEFAULT 0,
//!     max_retries INTEGER DEFAULT 3,
//!     last_error TEXT,
//!     created_by TEXT,
//!     created_at INTEGER NOT NULL,
//!     updated_at INTEGER NOT NULL
//! );
//!
//! CREATE TABLE task_executions (
//!     execution_id TEXT PRIMARY KEY,
//!     task_id TEXT NOT NULL,
//!     started_at INTEGER NOT NULL,
//!     completed_at INTEGER,
//!     status TEXT NOT NULL,
//!     result TEXT,                    -- JSON payload
//!     error_message TEXT,
//!     error_detail TEXT,
//!     duration_ms INTEGER,
//!     memory_usage INTEGER,           -- reserved, not populated
//!     cpu_usage REAL,                 -- reserved, not populated
//!     FOREIGN KEY (task_id) REFERENCES scheduled_tasks(task_id) ON DELETE CASCADE
//! );
//! ```
//!
//! Tasks are never hard-deleted; terminal rows stay for audit.

use super::task::{
    ExecutionStatus, ScheduleType, ScheduledTask, TaskExecution, TaskStatus, TaskType,
};
use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const TASK_COLUMNS: &str = "task_id, task_type, name, args, schedule_type, schedule_spec, \
     status, last_run_at, next_run_at, run_count, max_runs, retry_count, max_retries, \
     last_error, created_by, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "execution_id, task_id, started_at, completed_at, status, \
     result, error_message, error_detail, duration_ms";

/// Task storage with SQLite backend.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open or create a task database.
    pub fn open(path: &Path) -> Result<Self, SchedulerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::InvalidArgs(format!(
                    "cannot create task store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                name TEXT,
                args TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_spec TEXT NOT NULL,
                status TEXT NOT NULL,
                last_run_at INTEGER,
                next_run_at INTEGER,
                run_count INTEGER DEFAULT 0,
                max_runs INTEGER,
                retry_count INTEGER DEFAULT 0,
                max_retries INTEGER DEFAULT 3,
                last_error TEXT,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_executions (
                execution_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                status TEXT NOT NULL,
                result TEXT,
                error_message TEXT,
                error_detail TEXT,
                duration_ms INTEGER,
                memory_usage INTEGER,
                cpu_usage REAL,
                FOREIGN KEY (task_id) REFERENCES scheduled_tasks(task_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run_at);
            CREATE INDEX IF NOT EXISTS idx_executions_task ON task_executions(task_id);
            CREATE INDEX IF NOT EXISTS idx_executions_started ON task_executions(started_at DESC);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn task_from_row(row: &Row<'_>) -> Result<ScheduledTask, rusqlite::Error> {
        let task_type_str: String = row.get(1)?;
        let args_json: String = row.get(3)?;
        let schedule_type_str: String = row.get(4)?;
        let status_str: String = row.get(6)?;

        let invalid = |idx: usize, name: &str| {
            rusqlite::Error::InvalidColumnType(idx, name.to_string(), rusqlite::types::Type::Text)
        };

        Ok(ScheduledTask {
            task_id: row.get(0)?,
            task_type: TaskType::parse(&task_type_str).map_err(|_| invalid(1, "task_type"))?,
            name: row.get(2)?,
            args: serde_json::from_str(&args_json).map_err(|_| invalid(3, "args"))?,
            schedule_type: ScheduleType::parse(&schedule_type_str)
                .map_err(|_| invalid(4, "schedule_type"))?,
            schedule_spec: row.get(5)?,
            status: TaskStatus::parse(&status_str).map_err(|_| invalid(6, "status"))?,
            last_run_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
            next_run_at: row.get::<_, Option<i64>>(8)?.map(from_ms),
            run_count: row.get(9)?,
            max_runs: row.get(10)?,
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            last_error: row.get(13)?,
            created_by: row.get(14)?,
            created_at: from_ms(row.get(15)?),
            updated_at: from_ms(row.get(16)?),
        })
    }

    fn execution_from_row(row: &Row<'_>) -> Result<TaskExecution, rusqlite::Error> {
        let status_str: String = row.get(4)?;
        let result_json: Option<String> = row.get(5)?;

        Ok(TaskExecution {
            execution_id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: from_ms(row.get(2)?),
            completed_at: row.get::<_, Option<i64>>(3)?.map(from_ms),
            status: ExecutionStatus::parse(&status_str).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    4,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            result: result_json.and_then(|raw| serde_json::from_str(&raw).ok()),
            error_message: row.get(6)?,
            error_detail: row.get(7)?,
            duration_ms: row.get(8)?,
        })
    }

    /// Insert a new task.
    pub async fn insert_task(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let args_json = serde_json::to_string(&task.args)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO scheduled_tasks (
                task_id, task_type, name, args, schedule_type, schedule_spec, status,
                last_run_at, next_run_at, run_count, max_runs, retry_count, max_retries,
                last_error, created_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                task.task_id,
                task.task_type.as_str(),
                task.name,
                args_json,
                task.schedule_type.as_str(),
                task.schedule_spec,
                task.status.as_str(),
                task.last_run_at.map(to_ms),
                task.next_run_at.map(to_ms),
                task.run_count,
                task.max_runs,
                task.retry_count,
                task.max_retries,
                task.last_error,
                task.created_by,
                to_ms(task.created_at),
                to_ms(task.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>, SchedulerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_id = ?1"
        ))?;
        let task = stmt
            .query_row(params![task_id], Self::task_from_row)
            .optional()?;
        Ok(task)
    }

    /// List tasks, optionally filtered by status, most recently created first.
    pub async fn list_tasks(
        &self,
        status_filter: Option<TaskStatus>,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let conn = self.conn.lock().await;

        let mut tasks = Vec::new();
        match status_filter {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE status = ?1 \
                     ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], Self::task_from_row)?;
                for task in rows {
                    tasks.push(task?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map([], Self::task_from_row)?;
                for task in rows {
                    tasks.push(task?);
                }
            }
        }

        Ok(tasks)
    }

    /// Scheduled tasks whose next run is at or before `now`.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks \
             WHERE status = 'scheduled' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at ASC"
        ))?;

        let rows = stmt.query_map(params![to_ms(now)], Self::task_from_row)?;
        let mut tasks = Vec::new();
        for task in rows {
            tasks.push(task?);
        }
        Ok(tasks)
    }

    /// Persist every mutable field of a task.
    pub async fn update_task(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let args_json = serde_json::to_string(&task.args)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE scheduled_tasks SET
                task_type = ?2, name = ?3, args = ?4, schedule_type = ?5, schedule_spec = ?6,
                status = ?7, last_run_at = ?8, next_run_at = ?9, run_count = ?10,
                max_runs = ?11, retry_count = ?12, max_retries = ?13, last_error = ?14,
                created_by = ?15, updated_at = ?16
            WHERE task_id = ?1
            "#,
            params![
                task.task_id,
                task.task_type.as_str(),
                task.name,
                args_json,
                task.schedule_type.as_str(),
                task.schedule_spec,
                task.status.as_str(),
                task.last_run_at.map(to_ms),
                task.next_run_at.map(to_ms),
                task.run_count,
                task.max_runs,
                task.retry_count,
                task.max_retries,
                task.last_error,
                task.created_by,
                to_ms(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Record a new execution attempt.
    pub async fn insert_execution(&self, execution: &TaskExecution) -> Result<(), SchedulerError> {
        let result_json = execution
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO task_executions (
                execution_id, task_id, started_at, completed_at, status,
                result, error_message, error_detail, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                execution.execution_id,
                execution.task_id,
                to_ms(execution.started_at),
                execution.completed_at.map(to_ms),
                execution.status.as_str(),
                result_json,
                execution.error_message,
                execution.error_detail,
                execution.duration_ms,
            ],
        )?;
        Ok(())
    }

    /// Finalize an execution attempt.
    pub async fn update_execution(&self, execution: &TaskExecution) -> Result<(), SchedulerError> {
        let result_json = execution
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE task_executions SET
                completed_at = ?2, status = ?3, result = ?4,
                error_message = ?5, error_detail = ?6, duration_ms = ?7
            WHERE execution_id = ?1
            "#,
            params![
                execution.execution_id,
                execution.completed_at.map(to_ms),
                execution.status.as_str(),
                result_json,
                execution.error_message,
                execution.error_detail,
                execution.duration_ms,
            ],
        )?;
        Ok(())
    }

    /// Recent executions for a task, newest first.
    pub async fn executions_for(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskExecution>, SchedulerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions \
             WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![task_id, limit as i64], Self::execution_from_row)?;
        let mut executions = Vec::new();
        for execution in rows {
            executions.push(execution?);
        }
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    async fn open_store(temp: &TempDir) -> TaskStore {
        TaskStore::open(&temp.path().join("tasks.db")).unwrap()
    }

    #[tokio::test]
    async fn insert_and_reload_task() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let mut task = ScheduledTask::new(
            TaskType::Notification,
            args(json!({"message": "ping"})),
            ScheduleType::OneTime,
            "in 2 minutes",
        )
        .with_name("ping-me")
        .with_created_by("cli");
        task.next_run_at = Some(Utc::now());

        store.insert_task(&task).await.unwrap();

        let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_type, TaskType::Notification);
        assert_eq!(loaded.name.as_deref(), Some("ping-me"));
        assert_eq!(loaded.args["message"], "ping");
        assert_eq!(loaded.status, TaskStatus::Scheduled);
        assert_eq!(loaded.schedule_spec, "in 2 minutes");
        assert!(loaded.next_run_at.is_some());

        assert!(store.get_task("no-such-task").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        for status in [TaskStatus::Scheduled, TaskStatus::Cancelled, TaskStatus::Scheduled] {
            let mut task = ScheduledTask::new(
                TaskType::Reminder,
                args(json!({"message": "x"})),
                ScheduleType::OneTime,
                "tomorrow",
            );
            task.status = status;
            store.insert_task(&task).await.unwrap();
        }

        assert_eq!(store.list_tasks(None).await.unwrap().len(), 3);
        assert_eq!(
            store
                .list_tasks(Some(TaskStatus::Scheduled))
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .list_tasks(Some(TaskStatus::Cancelled))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn due_tasks_respects_status_and_time() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        let now = Utc::now();

        let mut due = ScheduledTask::new(
            TaskType::Reminder,
            args(json!({"message": "due"})),
            ScheduleType::OneTime,
            "now",
        );
        due.next_run_at = Some(now - chrono::Duration::seconds(5));
        store.insert_task(&due).await.unwrap();

        let mut future = ScheduledTask::new(
            TaskType::Reminder,
            args(json!({"message": "later"})),
            ScheduleType::OneTime,
            "tomorrow",
        );
        future.next_run_at = Some(now + chrono::Duration::hours(1));
        store.insert_task(&future).await.unwrap();

        let mut cancelled = ScheduledTask::new(
            TaskType::Reminder,
            args(json!({"message": "dead"})),
            ScheduleType::OneTime,
            "now",
        );
        cancelled.next_run_at = Some(now - chrono::Duration::seconds(5));
        cancelled.status = TaskStatus::Cancelled;
        store.insert_task(&cancelled).await.unwrap();

        let ready = store.due_tasks(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task_id, due.task_id);
    }

    #[tokio::test]
    async fn update_task_persists_lifecycle_fields() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let mut task = ScheduledTask::new(
            TaskType::ShellCommand,
            args(json!({"command": "true"})),
            ScheduleType::Recurring,
            "*/5 * * * *",
        );
        store.insert_task(&task).await.unwrap();

        task.status = TaskStatus::Failed;
        task.retry_count = 3;
        task.run_count = 7;
        task.last_error = Some("exit 1".to_string());
        store.update_task(&task).await.unwrap();

        let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.retry_count, 3);
        assert_eq!(loaded.run_count, 7);
        assert_eq!(loaded.last_error.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn execution_rows_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let task = ScheduledTask::new(
            TaskType::Notification,
            args(json!({"message": "hi"})),
            ScheduleType::OneTime,
            "in 1 minute",
        );
        store.insert_task(&task).await.unwrap();

        let execution = TaskExecution::new(&task.task_id);
        store.insert_execution(&execution).await.unwrap();

        let finalized = execution.mark_failed(
            "handler crashed".to_string(),
            Some("handler crashed\ncaused by: timeout".to_string()),
        );
        store.update_execution(&finalized).await.unwrap();

        let executions = store.executions_for(&task.task_id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert_eq!(executions[0].error_message.as_deref(), Some("handler crashed"));
        assert!(executions[0].error_detail.as_deref().unwrap().contains("timeout"));
        assert!(executions[0].duration_ms.is_some());
    }
}
