//! Reference in-memory backend.
//!
//! Single-process only: all state sits behind one mutex, which makes every
//! operation trivially linearizable. Result waiters are woken through a
//! [`Notify`] and fall back to a short poll so a manual test clock still
//! makes progress.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::error::BackendError;
use crate::scheduler::EntryRecord;
use crate::task::{ErrorInfo, ResultBody, Task, TaskResult};

const RESULT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct LockRow {
    holder: String,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Shared {
    tasks: HashMap<String, Task>,
    /// Assignment order index: `(group, due_at, id)` over all live tasks.
    by_due: BTreeSet<(String, DateTime<Utc>, String)>,
    results: HashMap<String, TaskResult>,
    locks: HashMap<String, LockRow>,
    entries: BTreeMap<(String, String), EntryRecord>,
}

impl Shared {
    fn unindex(&mut self, task: &Task) {
        self.by_due
            .remove(&(task.group.clone(), task.due_at, task.id.clone()));
    }

    fn index(&mut self, task: &Task) {
        self.by_due
            .insert((task.group.clone(), task.due_at, task.id.clone()));
    }

    fn remove_task(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.remove(task_id) {
            self.unindex(&task);
        }
    }

    /// The task iff `worker_id` holds an unexpired lease on it.
    fn held_task(&self, task_id: &str, worker_id: &str, now: DateTime<Utc>) -> Option<&Task> {
        self.tasks
            .get(task_id)
            .filter(|t| t.held_by(worker_id, now))
    }
}

pub struct MemoryBackend {
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    results_notify: Notify,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shared: Mutex::new(Shared::default()),
            results_notify: Notify::new(),
        }
    }

    fn finish(
        &self,
        task_id: &str,
        worker_id: &str,
        body: ResultBody,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let mut shared = self.lock();
        let Some(task) = shared.held_task(task_id, worker_id, now) else {
            return Ok(false);
        };
        let result = TaskResult {
            task_id: task.id.clone(),
            body,
            created_at: now,
            expires_at: now + task.ttl,
        };
        shared.remove_task(task_id);
        shared.results.insert(task_id.to_string(), result);
        drop(shared);
        self.results_notify.notify_waiters();
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        // Lock poisoning means a panic while holding the guard; the state
        // is a plain map and stays usable.
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Live tasks in a group, in assignment order. Inspection helper for
    /// tests and operational tooling; not part of the [`Backend`] contract.
    pub fn list_tasks(&self, group: &str) -> Vec<Task> {
        let shared = self.lock();
        shared
            .by_due
            .iter()
            .filter(|(g, _, _)| g == group)
            .filter_map(|(_, _, id)| shared.tasks.get(id).cloned())
            .collect()
    }

    pub fn lookup_task(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn enqueue(&self, task: Task) -> Result<(), BackendError> {
        let mut shared = self.lock();
        // A completed occurrence counts as present: re-enqueueing an id
        // whose result still exists must not re-run the task.
        if shared.tasks.contains_key(&task.id) || shared.results.contains_key(&task.id) {
            return Ok(());
        }
        shared.index(&task);
        shared.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn assign(
        &self,
        group: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, BackendError> {
        let mut shared = self.lock();
        let start = (group.to_string(), DateTime::<Utc>::MIN_UTC, String::new());
        let mut claimed: Option<String> = None;
        for (g, due_at, id) in shared.by_due.range(start..) {
            if g != group || *due_at > now {
                break;
            }
            if shared
                .tasks
                .get(id)
                .map(|t| !t.lease_valid(now))
                .unwrap_or(false)
            {
                claimed = Some(id.clone());
                break;
            }
        }
        let Some(task) = claimed.and_then(|id| shared.tasks.get_mut(&id)) else {
            return Ok(None);
        };
        task.assignee = Some(worker_id.to_string());
        task.lease_expires_at = Some(now + lease);
        Ok(Some(task.clone()))
    }

    async fn renew(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut shared = self.lock();
        if shared.held_task(task_id, worker_id, now).is_none() {
            return Ok(false);
        }
        if let Some(task) = shared.tasks.get_mut(task_id) {
            task.lease_expires_at = Some(now + lease);
        }
        Ok(true)
    }

    async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        payload: Vec<u8>,
    ) -> Result<bool, BackendError> {
        self.finish(task_id, worker_id, ResultBody::Success(payload))
    }

    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        new_due_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let mut shared = self.lock();
        let Some(mut task) = shared.held_task(task_id, worker_id, now).cloned() else {
            return Ok(false);
        };
        shared.unindex(&task);
        task.assignee = None;
        task.lease_expires_at = None;
        task.due_at = new_due_at;
        task.retry_count = retry_count;
        shared.index(&task);
        shared.tasks.insert(task_id.to_string(), task);
        Ok(true)
    }

    async fn discard(&self, task_id: &str, worker_id: &str) -> Result<bool, BackendError> {
        let now = self.clock.now();
        let mut shared = self.lock();
        if shared.held_task(task_id, worker_id, now).is_none() {
            return Ok(false);
        }
        shared.remove_task(task_id);
        Ok(true)
    }

    async fn fail_permanent(
        &self,
        task_id: &str,
        worker_id: &str,
        error: ErrorInfo,
    ) -> Result<bool, BackendError> {
        self.finish(task_id, worker_id, ResultBody::Error(error))
    }

    async fn get_result(
        &self,
        task_id: &str,
        block_until: DateTime<Utc>,
    ) -> Result<Option<TaskResult>, BackendError> {
        loop {
            let notified = self.results_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.lock().results.get(task_id) {
                return Ok(Some(result.clone()));
            }
            if self.clock.now() >= block_until {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(RESULT_POLL) => {}
            }
        }
    }

    async fn acquire_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut shared = self.lock();
        let free = match shared.locks.get(scheduler_name) {
            None => true,
            Some(row) => row.holder == holder || row.lease_expires_at <= now,
        };
        if free {
            shared.locks.insert(
                scheduler_name.to_string(),
                LockRow {
                    holder: holder.to_string(),
                    lease_expires_at: now + lease,
                },
            );
        }
        Ok(free)
    }

    async fn renew_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut shared = self.lock();
        match shared.locks.get_mut(scheduler_name) {
            Some(row) if row.holder == holder && row.lease_expires_at > now => {
                row.lease_expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_scheduler(
        &self,
        scheduler_name: &str,
        holder: &str,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        if shared
            .locks
            .get(scheduler_name)
            .map(|row| row.holder == holder)
            .unwrap_or(false)
        {
            shared.locks.remove(scheduler_name);
        }
        Ok(())
    }

    async fn list_schedule_entries(
        &self,
        scheduler_name: &str,
    ) -> Result<Vec<EntryRecord>, BackendError> {
        let shared = self.lock();
        Ok(shared
            .entries
            .range((scheduler_name.to_string(), String::new())..)
            .take_while(|((name, _), _)| name == scheduler_name)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn upsert_schedule_entry(
        &self,
        scheduler_name: &str,
        mut record: EntryRecord,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        let key = (scheduler_name.to_string(), record.key.clone());
        if record.last_fired_at.is_none() {
            if let Some(existing) = shared.entries.get(&key) {
                record.last_fired_at = existing.last_fired_at;
            }
        }
        shared.entries.insert(key, record);
        Ok(())
    }

    async fn delete_schedule_entry(
        &self,
        scheduler_name: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        self.lock()
            .entries
            .remove(&(scheduler_name.to_string(), key.to_string()));
        Ok(())
    }

    async fn mark_fired(
        &self,
        scheduler_name: &str,
        key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut shared = self.lock();
        if let Some(record) = shared
            .entries
            .get_mut(&(scheduler_name.to_string(), key.to_string()))
        {
            if record.last_fired_at.map(|at| at < fired_at).unwrap_or(true) {
                record.last_fired_at = Some(fired_at);
            }
        }
        Ok(())
    }

    async fn purge_expired_results(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, BackendError> {
        let mut shared = self.lock();
        let expired: Vec<String> = shared
            .results
            .values()
            .filter(|r| r.expires_at <= now)
            .take(limit)
            .map(|r| r.task_id.clone())
            .collect();
        for id in &expired {
            shared.results.remove(id);
        }
        Ok(expired.len())
    }
}
