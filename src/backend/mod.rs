//! Backend contract and adapters.
//!
//! The backend is the single source of truth: tasks, results, schedule
//! entries, and scheduler locks all live there. Workers, schedulers, and
//! result waiters coordinate exclusively through these operations, so an
//! adapter must make the task-mutating calls linearizable with respect to
//! each other on a single task id.

pub mod memory;

pub use memory::MemoryBackend;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;
use crate::scheduler::EntryRecord;
use crate::task::{ErrorInfo, Task, TaskResult};

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Insert a task with no assignee. Idempotent on `id`: enqueueing a
    /// task whose id already exists (live or completed) is a no-op, which
    /// is what makes deterministic occurrence ids safe across scheduler
    /// failovers.
    async fn enqueue(&self, task: Task) -> Result<(), BackendError>;

    /// Atomically claim the eligible task in `group` with the smallest
    /// `(due_at, id)` among those with `due_at <= now` and either no
    /// assignee or an expired lease. Sets `assignee = worker_id` and
    /// `lease_expires_at = now + lease`.
    async fn assign(
        &self,
        group: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BackendError>;

    /// Extend the lease to `now + lease` iff `worker_id` still holds an
    /// unexpired lease. `false` means the lease was lost.
    async fn renew(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    /// Write a success result and delete the task row in one step, iff the
    /// lease is held. Results become visible atomically with task deletion.
    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        payload: Vec<u8>,
    ) -> Result<bool, BackendError>;

    /// Release the task for a later attempt: clear the assignee, set
    /// `due_at = new_due_at` and `retry_count`, iff the lease is held.
    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        new_due_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<bool, BackendError>;

    /// Delete the task row without writing a result, iff the lease is held.
    async fn discard(&self, task_id: &str, worker_id: &str) -> Result<bool, BackendError>;

    /// Write an error result and delete the task row, iff the lease is
    /// held.
    async fn fail_permanent(
        &self,
        task_id: &str,
        worker_id: &str,
        error: ErrorInfo,
    ) -> Result<bool, BackendError>;

    /// Return the result for `task_id`, blocking (by polling or
    /// notification) until it exists or `block_until` passes.
    async fn get_result(
        &self,
        task_id: &str,
        block_until: DateTime<Utc>,
    ) -> Result<Option<TaskResult>, BackendError>;

    /// Compare-and-swap acquisition of the per-name scheduler lock.
    /// Succeeds when there is no holder, the existing lease has expired, or
    /// `holder` already owns it.
    async fn acquire_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    async fn renew_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    async fn release_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
    ) -> Result<(), BackendError>;

    async fn list_schedule_entries(
        &self,
        scheduler_name: &str,
    ) -> Result<Vec<EntryRecord>, BackendError>;

    /// Insert or update an entry. When the incoming record carries no
    /// `last_fired_at`, any stored value is preserved, so re-declaring an
    /// entry does not replay old occurrences.
    async fn upsert_schedule_entry(
        &self,
        scheduler_name: &str,
        record: EntryRecord,
    ) -> Result<(), BackendError>;

    async fn delete_schedule_entry(
        &self,
        scheduler_name: &str,
        key: &str,
    ) -> Result<(), BackendError>;

    /// Persist `last_fired_at` for an entry after an occurrence was
    /// enqueued.
    async fn mark_fired(
        &self,
        scheduler_name: &str,
        key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;

    /// Delete up to `limit` result rows whose retention expired. Idempotent
    /// and safe to run concurrently on every replica. Returns the number
    /// deleted.
    async fn purge_expired_results(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, BackendError>;
}
