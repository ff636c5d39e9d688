//! Task scheduler: schedule, poll, execute, retry.
//!
//! The scheduler owns scheduled-task records, turns parsed triggers into
//! deferred executions, and announces every lifecycle transition on the
//! event bus. The poll loop claims due tasks (flipping them to `running`
//! and opening an execution row) and spawns each run on its own task, so a
//! slow execution never blocks the loop.
//!
//! State machine per task:
//!
//! ```text
//! scheduled --trigger--> running --success--> completed   (one_time)
//!                                         \-> scheduled   (recurring)
//! running --failure--> scheduled  (retry_count < max_retries)
//!                  \-> failed     (retries exhausted)
//! any non-terminal --cancel--> cancelled
//! ```

use super::runner::RunnerRegistry;
use super::store::TaskStore;
use super::task::{validate_args, ScheduleType, ScheduledTask, TaskExecution, TaskStatus, TaskType};
use crate::bus::EventBus;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::event::{topics, Event};
use crate::schedule::{parse_schedule, Trigger};
use crate::scheduler::runner::TaskRunner;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Optional task metadata supplied at schedule time.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub name: Option<String>,
    pub max_runs: Option<u32>,
    pub max_retries: Option<u32>,
    pub created_by: Option<String>,
}

/// Schedule-and-execute engine over a [`TaskStore`] and an [`EventBus`].
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: TaskStore,
    bus: Arc<dyn EventBus>,
    runners: RunnerRegistry,
    config: SchedulerConfig,
    running: AtomicBool,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Builder for [`TaskScheduler`].
pub struct TaskSchedulerBuilder {
    store: TaskStore,
    bus: Arc<dyn EventBus>,
    runners: RunnerRegistry,
    config: SchedulerConfig,
}

impl TaskSchedulerBuilder {
    /// Register a runner for one task type.
    pub fn runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runners.register(runner);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TaskScheduler {
        TaskScheduler {
            inner: Arc::new(Inner {
                store: self.store,
                bus: self.bus,
                runners: self.runners,
                config: self.config,
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }
}

impl TaskScheduler {
    pub fn builder(store: TaskStore, bus: Arc<dyn EventBus>) -> TaskSchedulerBuilder {
        TaskSchedulerBuilder {
            store,
            bus,
            runners: RunnerRegistry::new(),
            config: SchedulerConfig::default(),
        }
    }

    /// Start the poll loop. Idempotent.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let period = std::time::Duration::from_secs(inner.config.poll_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = Inner::claim_due(&inner).await {
                    error!("scheduler poll failed: {e}");
                }
            }
        });

        *self.inner.worker.lock().await = Some((cancel, handle));
    }

    /// Stop the poll loop. In-flight executions finish on their own tasks.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some((cancel, handle)) = self.inner.worker.lock().await.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("scheduler poll task failed: {e}");
            }
        }
    }

    // ── Schedule API ────────────────────────────────────────────────────────

    pub async fn schedule_mcp_tool_call(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("server".to_string(), json!(server));
        args.insert("tool".to_string(), json!(tool));
        if let Some(arguments) = arguments {
            args.insert("arguments".to_string(), Value::Object(arguments));
        }
        self.schedule_task(TaskType::McpToolCall, args, schedule_spec, options)
            .await
    }

    pub async fn schedule_plugin_command(
        &self,
        plugin: &str,
        command: &str,
        command_args: Option<Map<String, Value>>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("plugin".to_string(), json!(plugin));
        args.insert("command".to_string(), json!(command));
        if let Some(command_args) = command_args {
            args.insert("args".to_string(), Value::Object(command_args));
        }
        self.schedule_task(TaskType::PluginCommand, args, schedule_spec, options)
            .await
    }

    pub async fn schedule_notification(
        &self,
        message: &str,
        channel: Option<&str>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("message".to_string(), json!(message));
        if let Some(channel) = channel {
            args.insert("channel".to_string(), json!(channel));
        }
        self.schedule_task(TaskType::Notification, args, schedule_spec, options)
            .await
    }

    pub async fn schedule_shell_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("command".to_string(), json!(command));
        if let Some(cwd) = cwd {
            args.insert("cwd".to_string(), json!(cwd));
        }
        self.schedule_task(TaskType::ShellCommand, args, schedule_spec, options)
            .await
    }

    pub async fn schedule_reminder(
        &self,
        message: &str,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("message".to_string(), json!(message));
        self.schedule_task(TaskType::Reminder, args, schedule_spec, options)
            .await
    }

    pub async fn schedule_sequence(
        &self,
        steps: Vec<Value>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        let mut args = Map::new();
        args.insert("tasks".to_string(), Value::Array(steps));
        self.schedule_task(TaskType::Sequence, args, schedule_spec, options)
            .await
    }

    /// Validate, resolve the schedule, persist, and announce a new task.
    pub async fn schedule_task(
        &self,
        task_type: TaskType,
        args: Map<String, Value>,
        schedule_spec: &str,
        options: ScheduleOptions,
    ) -> Result<String, SchedulerError> {
        validate_args(task_type, &args)?;
        let trigger = parse_schedule(schedule_spec)?;

        let schedule_type = if trigger.is_recurring() {
            ScheduleType::Recurring
        } else {
            ScheduleType::OneTime
        };

        let mut task = ScheduledTask::new(task_type, args, schedule_type, schedule_spec)
            .with_max_retries(
                options
                    .max_retries
                    .unwrap_or(self.inner.config.default_max_retries),
            );
        if let Some(name) = options.name {
            task = task.with_name(name);
        }
        if let Some(max_runs) = options.max_runs {
            task = task.with_max_runs(max_runs);
        }
        if let Some(created_by) = options.created_by {
            task = task.with_created_by(created_by);
        }
        task.next_run_at = Some(trigger.initial_fire(Utc::now()));

        self.inner.store.insert_task(&task).await?;
        self.inner.announce(
            topics::TASK_SCHEDULED,
            &task,
            [(
                "next_run_at",
                json!(task.next_run_at.map(|t| t.to_rfc3339())),
            )],
        );

        debug!(
            task_id = %task.task_id,
            task_type = task_type.as_str(),
            spec = schedule_spec,
            "task scheduled"
        );
        Ok(task.task_id)
    }

    // ── Inspection and control ──────────────────────────────────────────────

    /// Cancel a non-terminal task, revoking its pending trigger. Returns
    /// `false` when the task is missing or already terminal; cancelling
    /// twice is a no-op.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, SchedulerError> {
        let Some(mut task) = self.inner.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }

        task.status = TaskStatus::Cancelled;
        task.next_run_at = None;
        self.inner.store.update_task(&task).await?;
        self.inner.announce(
            topics::TASK_CANCELLED,
            &task,
            [("cancelled_at", json!(Utc::now().to_rfc3339()))],
        );
        Ok(true)
    }

    pub async fn get_scheduled_tasks(
        &self,
        status_filter: Option<TaskStatus>,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        self.inner.store.list_tasks(status_filter).await
    }

    pub async fn get_task_info(
        &self,
        task_id: &str,
    ) -> Result<Option<ScheduledTask>, SchedulerError> {
        self.inner.store.get_task(task_id).await
    }

    pub async fn get_task_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<TaskExecution>, SchedulerError> {
        self.inner.store.executions_for(task_id, limit).await
    }
}

impl Inner {
    /// Announce a lifecycle transition. Fire-and-forget: a stopped bus
    /// logs and drops rather than failing the scheduler.
    fn announce<const N: usize>(
        &self,
        topic: &str,
        task: &ScheduledTask,
        extra: [(&str, Value); N],
    ) {
        let mut builder = Event::builder(topic)
            .source("scheduler")
            .field("task_id", task.task_id.clone())
            .field("task_type", task.task_type.as_str())
            .field("status", task.status.as_str());
        if let Some(name) = &task.name {
            builder = builder.field("name", name.clone());
        }
        for (key, value) in extra {
            builder = builder.field(key, value);
        }
        self.bus.publish_sync(builder.build());
    }

    /// Claim every due task: flip to `running`, open an execution row, and
    /// spawn the run on its own task so the loop keeps polling.
    async fn claim_due(inner: &Arc<Self>) -> Result<(), SchedulerError> {
        let due = inner.store.due_tasks(Utc::now()).await?;
        for task in due {
            // Re-read in case the task was cancelled between query and claim.
            let Some(mut current) = inner.store.get_task(&task.task_id).await? else {
                continue;
            };
            if current.status != TaskStatus::Scheduled {
                continue;
            }

            current.status = TaskStatus::Running;
            inner.store.update_task(&current).await?;

            let execution = TaskExecution::new(&current.task_id);
            inner.store.insert_execution(&execution).await?;

            let inner = inner.clone();
            tokio::spawn(async move {
                inner.run_claimed(current, execution).await;
            });
        }
        Ok(())
    }

    async fn run_claimed(&self, mut task: ScheduledTask, execution: TaskExecution) {
        let result = match self.config.execution_timeout_secs {
            Some(secs) => {
                let budget = std::time::Duration::from_secs(secs);
                match tokio::time::timeout(budget, self.run_task(&task)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("execution timed out after {secs}s")),
                }
            }
            None => self.run_task(&task).await,
        };

        let now = Utc::now();

        // Cancellation raced the run: keep the terminal state, close the row.
        match self.store.get_task(&task.task_id).await {
            Ok(Some(current)) if current.status == TaskStatus::Cancelled => {
                let execution = execution.mark_cancelled();
                if let Err(e) = self.store.update_execution(&execution).await {
                    error!(task_id = %task.task_id, "failed to finalize execution: {e}");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(task_id = %task.task_id, "failed to re-read task after run: {e}");
            }
        }

        task.last_run_at = Some(now);

        let execution = match result {
            Ok(value) => {
                task.run_count += 1;
                task.retry_count = 0;
                task.last_error = None;

                match plan_next_run(&task, now) {
                    Some(next) => {
                        task.status = TaskStatus::Scheduled;
                        task.next_run_at = Some(next);
                    }
                    None => {
                        task.status = TaskStatus::Completed;
                        task.next_run_at = None;
                    }
                }
                self.announce(
                    topics::TASK_COMPLETED,
                    &task,
                    [("run_count", json!(task.run_count))],
                );
                execution.mark_completed(Some(value))
            }
            Err(e) => {
                let message = e.to_string();
                let detail = format!("{e:?}");
                task.last_error = Some(message.clone());

                if task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    task.status = TaskStatus::Scheduled;
                    task.next_run_at = Some(now + self.retry_delay(task.retry_count));
                    self.announce(
                        topics::TASK_RETRYING,
                        &task,
                        [
                            ("attempt", json!(task.retry_count)),
                            ("error", json!(message.clone())),
                        ],
                    );
                } else {
                    task.status = TaskStatus::Failed;
                    task.next_run_at = None;
                    self.announce(
                        topics::TASK_FAILED,
                        &task,
                        [("error", json!(message.clone()))],
                    );
                }
                execution.mark_failed(message, Some(detail))
            }
        };

        if let Err(e) = self.store.update_execution(&execution).await {
            error!(task_id = %task.task_id, "failed to finalize execution: {e}");
        }
        if let Err(e) = self.store.update_task(&task).await {
            error!(task_id = %task.task_id, "failed to update task after run: {e}");
        }
    }

    async fn run_task(&self, task: &ScheduledTask) -> anyhow::Result<Value> {
        if task.task_type == TaskType::Sequence {
            return self.run_sequence(task).await;
        }
        let runner = self.runners.get(task.task_type.as_str())?;
        runner.run(task).await
    }

    /// Run sequence steps in order, stopping at the first failure.
    async fn run_sequence(&self, task: &ScheduledTask) -> anyhow::Result<Value> {
        let steps = task
            .args
            .get("tasks")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("sequence task lost its 'tasks' array"))?;

        let mut results = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let step_type = step
                .get("task_type")
                .and_then(Value::as_str)
                .and_then(|s| TaskType::parse(s).ok())
                .ok_or_else(|| anyhow::anyhow!("sequence step {i} has no valid task_type"))?;
            let step_args = step
                .get("args")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let step_task = ScheduledTask::new(
                step_type,
                step_args,
                task.schedule_type,
                task.schedule_spec.clone(),
            );
            let runner = self.runners.get(step_type.as_str())?;
            let value = runner
                .run(&step_task)
                .await
                .map_err(|e| anyhow::anyhow!("sequence step {i} failed: {e}"))?;
            results.push(value);
        }

        Ok(Value::Array(results))
    }

    fn retry_delay(&self, retry_count: u32) -> ChronoDuration {
        let base = self.config.retry_backoff_secs;
        let secs = base
            .saturating_mul(1_u64 << retry_count.saturating_sub(1).min(63))
            .min(3600);
        ChronoDuration::seconds(secs as i64)
    }
}

/// Next fire time after a successful run, or `None` when the task is done.
///
/// Recurring tasks re-arm from their original spec until `max_runs`;
/// one-time tasks never re-arm.
fn plan_next_run(task: &ScheduledTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if task.schedule_type != ScheduleType::Recurring {
        return None;
    }
    if let Some(max_runs) = task.max_runs {
        if task.run_count >= max_runs {
            return None;
        }
    }
    match parse_schedule(&task.schedule_spec) {
        Ok(Trigger::Cron(cron)) => cron.next_after(now),
        Ok(Trigger::Once(_)) => None,
        Err(e) => {
            warn!(
                task_id = %task.task_id,
                spec = %task.schedule_spec,
                "stored schedule spec no longer parses: {e}"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventHandler, LocalBus};
    use crate::config::BusConfig;
    use crate::subscription::SubscribeOptions;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tempfile::TempDir;

    struct OkRunner {
        task_type: &'static str,
        calls: AtomicU32,
    }

    impl OkRunner {
        fn new(task_type: &'static str) -> Arc<Self> {
            Arc::new(Self {
                task_type,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskRunner for OkRunner {
        fn task_type(&self) -> &str {
            self.task_type
        }

        async fn run(&self, _task: &ScheduledTask) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    struct FailRunner {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskRunner for FailRunner {
        fn task_type(&self) -> &str {
            "shell_command"
        }

        async fn run(&self, _task: &ScheduledTask) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("exit status 1")
        }
    }

    struct SlowRunner;

    #[async_trait]
    impl TaskRunner for SlowRunner {
        fn task_type(&self) -> &str {
            "notification"
        }

        async fn run(&self, _task: &ScheduledTask) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({"ok": true}))
        }
    }

    struct TopicCollector {
        seen: std::sync::Mutex<Vec<String>>,
    }

    impl TopicCollector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for TopicCollector {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: 1,
            retry_backoff_secs: 0,
            execution_timeout_secs: None,
            ..SchedulerConfig::default()
        }
    }

    async fn scheduler_with(
        temp: &TempDir,
        config: SchedulerConfig,
        runners: Vec<Arc<dyn TaskRunner>>,
    ) -> (TaskScheduler, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new(BusConfig::default()));
        bus.start().await.unwrap();

        let store = TaskStore::open(&temp.path().join("tasks.db")).unwrap();
        let mut builder = TaskScheduler::builder(store, bus.clone()).config(config);
        for runner in runners {
            builder = builder.runner(runner);
        }
        (builder.build(), bus)
    }

    async fn wait_for_status(
        scheduler: &TaskScheduler,
        task_id: &str,
        status: TaskStatus,
    ) {
        for _ in 0..100 {
            let task = scheduler.get_task_info(task_id).await.unwrap().unwrap();
            if task.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("task never reached {status:?}");
    }

    #[tokio::test]
    async fn schedule_and_cancel_round_trip() {
        let temp = TempDir::new().unwrap();
        let (scheduler, _bus) = scheduler_with(&temp, fast_config(), vec![]).await;

        let task_id = scheduler
            .schedule_notification("ping", None, "in 2 minutes", ScheduleOptions::default())
            .await
            .unwrap();

        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Scheduled);
        assert_eq!(info.schedule_type, ScheduleType::OneTime);
        assert!(info.next_run_at.is_some());

        assert!(scheduler.cancel_task(&task_id).await.unwrap());
        assert!(!scheduler.cancel_task(&task_id).await.unwrap());

        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Cancelled);
        assert!(info.next_run_at.is_none());
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_false() {
        let temp = TempDir::new().unwrap();
        let (scheduler, _bus) = scheduler_with(&temp, fast_config(), vec![]).await;
        assert!(!scheduler.cancel_task("no-such-task").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_args_rejected_before_store() {
        let temp = TempDir::new().unwrap();
        let (scheduler, _bus) = scheduler_with(&temp, fast_config(), vec![]).await;

        let result = scheduler
            .schedule_task(
                TaskType::ShellCommand,
                Map::new(),
                "in 1 minute",
                ScheduleOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidArgs(_))));
        assert!(scheduler.get_scheduled_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_spec_rejected() {
        let temp = TempDir::new().unwrap();
        let (scheduler, _bus) = scheduler_with(&temp, fast_config(), vec![]).await;

        let result = scheduler
            .schedule_reminder("hi", "99 99 * * *", ScheduleOptions::default())
            .await;
        assert!(matches!(result, Err(SchedulerError::Parse(_))));
    }

    #[tokio::test]
    async fn cron_spec_creates_recurring_task() {
        let temp = TempDir::new().unwrap();
        let (scheduler, _bus) = scheduler_with(&temp, fast_config(), vec![]).await;

        let task_id = scheduler
            .schedule_reminder("standup", "0 9 * * *", ScheduleOptions::default())
            .await
            .unwrap();

        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert_eq!(info.schedule_type, ScheduleType::Recurring);
        let next = info.next_run_at.unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[tokio::test]
    async fn due_task_runs_to_completion() {
        let temp = TempDir::new().unwrap();
        let runner = OkRunner::new("notification");
        let (scheduler, bus) =
            scheduler_with(&temp, fast_config(), vec![runner.clone()]).await;

        let collector = TopicCollector::new();
        bus.subscribe("scheduler.*", "observer", collector.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        scheduler.start().await;
        let task_id = scheduler
            .schedule_notification("now", None, "in 0 minutes", ScheduleOptions::default())
            .await
            .unwrap();

        wait_for_status(&scheduler, &task_id, TaskStatus::Completed).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let executions = scheduler.get_task_executions(&task_id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, super::super::task::ExecutionStatus::Completed);
        assert!(executions[0].duration_ms.is_some());

        let c = collector.clone();
        for _ in 0..50 {
            if c.topics().iter().any(|t| t == topics::TASK_COMPLETED) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let seen = collector.topics();
        assert!(seen.contains(&topics::TASK_SCHEDULED.to_string()));
        assert!(seen.contains(&topics::TASK_COMPLETED.to_string()));

        scheduler.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn failing_task_retries_then_fails() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let runner: Arc<dyn TaskRunner> = Arc::new(FailRunner { calls: calls.clone() });
        let (scheduler, bus) = scheduler_with(&temp, fast_config(), vec![runner]).await;

        let collector = TopicCollector::new();
        bus.subscribe("scheduler.task.retrying", "observer", collector.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        scheduler.start().await;
        let task_id = scheduler
            .schedule_shell_command(
                "false",
                None,
                "in 0 minutes",
                ScheduleOptions {
                    max_retries: Some(3),
                    ..ScheduleOptions::default()
                },
            )
            .await
            .unwrap();

        wait_for_status(&scheduler, &task_id, TaskStatus::Failed).await;

        // 1 initial attempt + 3 retries, never a 5th.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let executions = scheduler.get_task_executions(&task_id, 10).await.unwrap();
        assert_eq!(executions.len(), 4);

        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert_eq!(info.retry_count, 3);
        assert_eq!(info.last_error.as_deref(), Some("exit status 1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(collector.topics().len(), 3);

        scheduler.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn missing_runner_counts_as_failure() {
        let temp = TempDir::new().unwrap();
        let (scheduler, bus) = scheduler_with(&temp, fast_config(), vec![]).await;

        scheduler.start().await;
        let task_id = scheduler
            .schedule_reminder(
                "orphan",
                "in 0 minutes",
                ScheduleOptions {
                    max_retries: Some(0),
                    ..ScheduleOptions::default()
                },
            )
            .await
            .unwrap();

        wait_for_status(&scheduler, &task_id, TaskStatus::Failed).await;
        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert!(info.last_error.unwrap().contains("no runner registered"));

        scheduler.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn execution_timeout_is_a_failure() {
        let temp = TempDir::new().unwrap();
        let config = SchedulerConfig {
            execution_timeout_secs: Some(1),
            ..fast_config()
        };
        let (scheduler, bus) =
            scheduler_with(&temp, config, vec![Arc::new(SlowRunner)]).await;

        scheduler.start().await;
        let task_id = scheduler
            .schedule_notification(
                "slow",
                None,
                "in 0 minutes",
                ScheduleOptions {
                    max_retries: Some(0),
                    ..ScheduleOptions::default()
                },
            )
            .await
            .unwrap();

        wait_for_status(&scheduler, &task_id, TaskStatus::Failed).await;
        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert!(info.last_error.unwrap().contains("timed out"));

        scheduler.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn cancelled_task_never_runs() {
        let temp = TempDir::new().unwrap();
        let runner = OkRunner::new("notification");
        let (scheduler, bus) =
            scheduler_with(&temp, fast_config(), vec![runner.clone()]).await;

        let task_id = scheduler
            .schedule_notification("never", None, "in 0 minutes", ScheduleOptions::default())
            .await
            .unwrap();
        assert!(scheduler.cancel_task(&task_id).await.unwrap());

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let info = scheduler.get_task_info(&task_id).await.unwrap().unwrap();
        assert_eq!(info.status, TaskStatus::Cancelled);

        scheduler.stop().await;
        bus.stop().await;
    }

    #[tokio::test]
    async fn sequence_runs_steps_in_order() {
        let temp = TempDir::new().unwrap();
        let notify = OkRunner::new("notification");
        let shell = OkRunner::new("shell_command");
        let (scheduler, bus) = scheduler_with(
            &temp,
            fast_config(),
            vec![notify.clone(), shell.clone()],
        )
        .await;

        scheduler.start().await;
        let task_id = scheduler
            .schedule_sequence(
                vec![
                    json!({"task_type": "notification", "args": {"message": "one"}}),
                    json!({"task_type": "shell_command", "args": {"command": "true"}}),
                ],
                "in 0 minutes",
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        wait_for_status(&scheduler, &task_id, TaskStatus::Completed).await;
        assert_eq!(notify.calls.load(Ordering::SeqCst), 1);
        assert_eq!(shell.calls.load(Ordering::SeqCst), 1);

        scheduler.stop().await;
        bus.stop().await;
    }

    #[test]
    fn plan_next_run_recurring_until_max_runs() {
        let mut task = ScheduledTask::new(
            TaskType::Reminder,
            json!({"message": "x"}).as_object().cloned().unwrap(),
            ScheduleType::Recurring,
            "0 9 * * *",
        )
        .with_max_runs(3);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        task.run_count = 2;
        let next = plan_next_run(&task, now).unwrap();
        assert_eq!(next.hour(), 9);
        assert!(next > now);

        task.run_count = 3;
        assert!(plan_next_run(&task, now).is_none());
    }

    #[test]
    fn plan_next_run_one_time_is_none() {
        let task = ScheduledTask::new(
            TaskType::Reminder,
            json!({"message": "x"}).as_object().cloned().unwrap(),
            ScheduleType::OneTime,
            "in 5 minutes",
        );
        assert!(plan_next_run(&task, Utc::now()).is_none());
    }
}
