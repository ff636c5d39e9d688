//! Task runner trait and registry.
//!
//! Runners perform the actual work of a scheduled task — calling an MCP
//! tool, sending a notification, spawning a shell command. They live in the
//! embedding application; the scheduler only routes to them by the stable
//! task-type string they declare.

use super::task::ScheduledTask;
use crate::error::SchedulerError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Executes one kind of scheduled task.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    /// The task type this runner handles (e.g. `"notification"`).
    fn task_type(&self) -> &str;

    /// Run the task, returning a structured result payload.
    async fn run(&self, task: &ScheduledTask) -> anyhow::Result<Value>;
}

/// Registry of task runners keyed by task-type string.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under its declared task type.
    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(runner.task_type().to_string(), runner);
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskRunner>, SchedulerError> {
        self.runners
            .get(task_type)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownRunner(task_type.to_string()))
    }

    pub fn has(&self, task_type: &str) -> bool {
        self.runners.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{ScheduleType, TaskType};
    use serde_json::json;

    struct EchoRunner;

    #[async_trait::async_trait]
    impl TaskRunner for EchoRunner {
        fn task_type(&self) -> &str {
            "notification"
        }

        async fn run(&self, task: &ScheduledTask) -> anyhow::Result<Value> {
            Ok(json!({"echoed": task.args.get("message")}))
        }
    }

    #[tokio::test]
    async fn registry_routes_by_task_type() {
        let mut registry = RunnerRegistry::new();
        registry.register(Arc::new(EchoRunner));

        assert!(registry.has("notification"));
        assert!(!registry.has("shell_command"));
        assert!(matches!(
            registry.get("shell_command"),
            Err(SchedulerError::UnknownRunner(_))
        ));

        let task = ScheduledTask::new(
            TaskType::Notification,
            json!({"message": "hello"}).as_object().cloned().unwrap(),
            ScheduleType::OneTime,
            "in 1 minute",
        );
        let result = registry.get("notification").unwrap().run(&task).await.unwrap();
        assert_eq!(result["echoed"], "hello");
    }
}
