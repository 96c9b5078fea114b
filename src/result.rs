//! Client-side result waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::BackendError;
use crate::handler::TaskHandler;
use crate::task::{ErrorInfo, ResultBody, Task};

/// Why `ResultHandle::get` did not return a value.
///
/// `TimedOut` is not a task failure: the task keeps running and a later
/// `get` may succeed.
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("timed out waiting for task result")]
    TimedOut,

    #[error("task failed: {0}")]
    TaskFailed(ErrorInfo),

    #[error("task was discarded")]
    Discarded,

    #[error("failed to decode result: {0}")]
    Codec(ErrorInfo),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Handle bound to a submitted task's id; waits for its outcome anywhere in
/// the cluster.
pub struct ResultHandle {
    task: Task,
    backend: Arc<dyn Backend>,
    handler: Arc<dyn TaskHandler>,
    clock: Arc<dyn Clock>,
}

impl ResultHandle {
    pub(crate) fn new(
        task: Task,
        backend: Arc<dyn Backend>,
        handler: Arc<dyn TaskHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            backend,
            handler,
            clock,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// Wait up to `timeout` for the task's result and decode it through the
    /// handler.
    pub async fn get(&self, timeout: Duration) -> Result<Value, WaitError> {
        let deadline = self.deadline(timeout);
        match self.backend.get_result(&self.task.id, deadline).await? {
            None => Err(WaitError::TimedOut),
            Some(result) => match result.body {
                ResultBody::Success(payload) => self
                    .handler
                    .decode_result(&self.task, &payload)
                    .map_err(WaitError::Codec),
                ResultBody::Error(info) => Err(WaitError::TaskFailed(info)),
                ResultBody::Discarded => Err(WaitError::Discarded),
            },
        }
    }

    fn deadline(&self, timeout: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
