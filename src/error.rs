use thiserror::Error;

use crate::task::ErrorInfo;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("codec error: {0}")]
    Codec(ErrorInfo),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate schedule entry key: {0}")]
    DuplicateEntryKey(String),

    #[error("service failed to start: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Errors surfaced by backend adapters.
///
/// `Unavailable` (contention, lost connections) and `Io` (a read or write
/// that failed mid-flight) are transient: callers retry them with backoff
/// and never turn them into a task failure. `Corrupt` indicates a damaged
/// record and is not retried. The in-memory adapter is infallible; the
/// transient variants exist for adapters backed by real storage.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend i/o failed: {0}")]
    Io(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Io(_))
    }
}
