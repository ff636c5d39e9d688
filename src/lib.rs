//! Event-driven task coordination for agentic assistant runtimes.
//!
//! Two subsystems, built leaves-first:
//!
//! - an [`EventBus`](bus::EventBus) routing published [`Event`](event::Event)s
//!   to pattern-matched subscribers, with an in-process backend and a
//!   shared-store backend for multi-process deployments;
//! - a [`TaskScheduler`](scheduler::TaskScheduler) that persists scheduled
//!   tasks, fires them from cron/absolute/relative specs, retries failures,
//!   and announces every lifecycle transition on the bus.

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod pattern;
pub mod schedule;
pub mod scheduler;
pub mod subscription;

// Re-export the surface collaborating components touch.
pub use bus::{EventBus, EventHandler, FnHandler, KvStore, LocalBus, SharedBus, SqliteKv};
pub use config::{BusConfig, Config, SchedulerConfig};
pub use error::{BusError, KvError, ScheduleParseError, SchedulerError};
pub use event::{topics, Event, EventBuilder, EventPriority};
pub use schedule::{parse_relative, parse_schedule, CronTrigger, Trigger};
pub use scheduler::{
    ScheduleOptions, ScheduleType, ScheduledTask, TaskExecution, TaskRunner, TaskScheduler,
    TaskStatus, TaskStore, TaskType,
};
pub use subscription::{SubscribeOptions, SubscriptionId, SubscriptionInfo};
