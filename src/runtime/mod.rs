pub mod scheduler;

pub use scheduler::{Context, Scheduler, SchedulerError, Step, Task, TaskId};
