//! The user-supplied side of the runner.
//!
//! A [`TaskHandler`] carries the domain logic, the retry policy, and the
//! codec for task data and results. The core never interprets the bytes it
//! moves; encoding and decoding are delegated here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::task::{ErrorInfo, Task};

/// Why a handler did not produce a value.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Drop the task silently: no retry, no result row.
    Discard,
    /// The attempt failed; the retry policy decides what happens next.
    Error(ErrorInfo),
}

impl HandlerError {
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Error(ErrorInfo::new(kind, message))
    }
}

impl From<ErrorInfo> for HandlerError {
    fn from(info: ErrorInfo) -> Self {
        HandlerError::Error(info)
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back with `due_at = now + delay` and a bumped
    /// `retry_count`.
    After(Duration),
    /// Fail permanently; the stored result carries the error descriptor.
    GiveUp,
    /// Drop the task silently.
    Discard,
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run the task. Dispatch on `task.group` / `task.name`.
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError>;

    /// Retry policy for a failed attempt. `task.retry_count` is the number
    /// of attempts that have already failed, not counting this one.
    fn retry_interval(&self, task: &Task, error: &ErrorInfo) -> RetryDecision;

    /// Encode a caller-provided value into task data bytes.
    fn encode_data(&self, _group: &str, _name: &str, value: &Value) -> Result<Vec<u8>, ErrorInfo> {
        serde_json::to_vec(value).map_err(|e| ErrorInfo::new("EncodeError", e.to_string()))
    }

    /// Encode a handler return value into result payload bytes.
    fn encode_result(&self, _task: &Task, value: &Value) -> Result<Vec<u8>, ErrorInfo> {
        serde_json::to_vec(value).map_err(|e| ErrorInfo::new("EncodeError", e.to_string()))
    }

    /// Decode stored result payload bytes back into a value.
    fn decode_result(&self, _task: &Task, raw: &[u8]) -> Result<Value, ErrorInfo> {
        serde_json::from_slice(raw).map_err(|e| ErrorInfo::new("DecodeError", e.to_string()))
    }
}
