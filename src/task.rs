use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a finished task's result is retained before the janitor may
/// delete it.
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Upper bound on a stored error message. Backtraces are never persisted.
const MAX_ERROR_MESSAGE_LEN: usize = 4096;

/// A unit of work.
///
/// The backend owns the persistent row; everything in-process holds copies.
/// The lease is the pair `(assignee, lease_expires_at)`: at most one worker
/// holds an unexpired lease per task id, and every state-changing backend
/// call is a compare-and-swap on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// The occurrence instant when the task was materialized by a
    /// scheduler; `None` for ad-hoc tasks.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub assignee: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub ttl: Duration,
}

impl Task {
    /// Build a fresh ad-hoc task. `due_at` defaults to `now`.
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let group = group.into();
        let id = Self::make_id(&group, Uuid::new_v4());
        Self {
            id,
            group,
            name: name.into(),
            data,
            due_at: due_at.unwrap_or(now),
            created_at: now,
            scheduled_at: None,
            retry_count: 0,
            assignee: None,
            lease_expires_at: None,
            ttl: DEFAULT_TASK_TTL,
        }
    }

    /// Task ids are group-prefixed: `<group>_<uuid>`.
    pub fn make_id(group: &str, uuid: Uuid) -> String {
        format!("{}_{}", group, uuid.simple())
    }

    pub fn state(&self, now: DateTime<Utc>) -> TaskState {
        if self.lease_valid(now) {
            TaskState::Running
        } else if self.due_at <= now {
            TaskState::Ready
        } else {
            TaskState::Pending
        }
    }

    /// True while `assignee` holds an unexpired lease.
    pub fn lease_valid(&self, now: DateTime<Utc>) -> bool {
        self.assignee.is_some()
            && self.lease_expires_at.map(|at| at > now).unwrap_or(false)
    }

    pub fn held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.assignee.as_deref() == Some(worker_id) && self.lease_valid(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not yet due.
    Pending,
    /// Due and claimable (no assignee, or an expired lease).
    Ready,
    /// Held under an unexpired lease.
    Running,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
        }
    }
}

/// Bounded error descriptor stored with failed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut end = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            kind: kind.into(),
            message,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome persisted for a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub body: ResultBody,
    pub created_at: DateTime<Utc>,
    /// `created_at + task.ttl`; the janitor deletes the row after this.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultBody {
    Success(Vec<u8>),
    Error(ErrorInfo),
    Discarded,
}
