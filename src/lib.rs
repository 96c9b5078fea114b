//! conveyor: a distributed task runner.
//!
//! Producers enqueue named tasks with a due time; fleets of lightweight
//! workers pull them from a shared backend under time-bounded leases,
//! execute them through a user-supplied [`TaskHandler`], and persist
//! results that producers await through a [`ResultHandle`]. A scheduler
//! materializes recurring entries with deterministic occurrence ids, so a
//! firing is enqueued exactly once even across failovers.
//!
//! All coordination goes through the [`Backend`] contract; the crate ships
//! [`MemoryBackend`] as the reference adapter.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod kit;
pub mod result;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod task;
pub mod worker;

pub use backend::{Backend, MemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KitConfig;
pub use error::{BackendError, ConveyorError, Result};
pub use handler::{HandlerError, RetryDecision, TaskHandler};
pub use kit::{Kit, ScheduleEntries, ServiceHandle};
pub use result::{ResultHandle, WaitError};
pub use scheduler::{
    occurrence_id, CustomSchedule, EntryRecord, RegularSchedule, Schedule, ScheduleEntry,
};
pub use task::{ErrorInfo, ResultBody, Task, TaskResult, TaskState};
