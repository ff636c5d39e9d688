//! Schedule-and-execute task engine layered on the event bus.

mod engine;
mod runner;
mod store;
mod task;

pub use engine::{ScheduleOptions, TaskScheduler, TaskSchedulerBuilder};
pub use runner::{RunnerRegistry, TaskRunner};
pub use store::TaskStore;
pub use task::{
    validate_args, ExecutionStatus, ScheduleType, ScheduledTask, TaskExecution, TaskStatus,
    TaskType,
};
