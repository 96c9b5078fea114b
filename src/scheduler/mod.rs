//! Recurring-schedule materialization.
//!
//! A [`Scheduler`] owns the schedule entries declared under one scheduler
//! name. Replicas coordinate through a name-level lock in the backend: only
//! the lock holder ticks, and every materialized occurrence carries a
//! deterministic id, so a failover cannot double-enqueue a firing.

mod entry;
mod schedule;

pub use entry::{occurrence_id, EntryRecord, ScheduleEntry};
pub use schedule::{CustomSchedule, RegularSchedule, Schedule};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::KitConfig;
use crate::error::{BackendError, ConveyorError, Result};
use crate::worker::jittered;

pub struct Scheduler {
    name: String,
    holder: String,
    entries: Vec<ScheduleEntry>,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: Arc<KitConfig>,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        entries: Vec<ScheduleEntry>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        config: Arc<KitConfig>,
    ) -> Result<Self> {
        let name = name.into();
        let mut keys = HashSet::new();
        for entry in &entries {
            if !keys.insert(entry.key.as_str()) {
                return Err(ConveyorError::DuplicateEntryKey(entry.key.clone()));
            }
        }
        let holder = format!("sch_{}_{}", name, Uuid::new_v4().simple());
        Ok(Self {
            name,
            holder,
            entries,
            backend,
            clock,
            config,
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(scheduler = %self.name, holder = %self.holder, "scheduler started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.acquire().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    // Another replica holds the lock, or the backend is
                    // away; retry after a decorrelated sleep.
                    let pause = jittered(self.config.scheduler_lock_lease / 3);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            }
            tracing::info!(scheduler = %self.name, "scheduler lock acquired");

            let mut last_fired = match self.reconcile().await {
                Ok(last_fired) => last_fired,
                Err(error) => {
                    tracing::warn!(scheduler = %self.name, %error, "entry reconciliation failed");
                    let _ = self.backend.release_scheduler(&self.name, &self.holder).await;
                    continue;
                }
            };

            self.tick_loop(&shutdown, &mut last_fired).await;
            let _ = self.backend.release_scheduler(&self.name, &self.holder).await;
            if !shutdown.is_cancelled() {
                tracing::warn!(scheduler = %self.name, "scheduler lease lost, reacquiring");
            }
        }
        tracing::info!(scheduler = %self.name, "scheduler stopped");
    }

    async fn acquire(&self) -> std::result::Result<bool, BackendError> {
        self.backend
            .acquire_scheduler(
                &self.name,
                &self.holder,
                self.config.scheduler_lock_lease,
                self.clock.now(),
            )
            .await
    }

    /// Align backend entry state with the declared set: upsert every
    /// declared key (the backend preserves stored `last_fired_at`), delete
    /// keys that are no longer declared. Returns the per-key last-fired
    /// watermarks.
    async fn reconcile(
        &self,
    ) -> std::result::Result<HashMap<String, DateTime<Utc>>, BackendError> {
        let declared: HashSet<&str> = self.entries.iter().map(|e| e.key.as_str()).collect();
        let mut last_fired = HashMap::new();

        for record in self.backend.list_schedule_entries(&self.name).await? {
            if declared.contains(record.key.as_str()) {
                if let Some(at) = record.last_fired_at {
                    last_fired.insert(record.key, at);
                }
            } else {
                tracing::info!(
                    scheduler = %self.name,
                    key = %record.key,
                    "removing undeclared schedule entry"
                );
                self.backend
                    .delete_schedule_entry(&self.name, &record.key)
                    .await?;
            }
        }
        for entry in &self.entries {
            self.backend
                .upsert_schedule_entry(&self.name, EntryRecord::from_entry(entry))
                .await?;
        }
        Ok(last_fired)
    }

    /// Tick until shutdown or lease loss. Renews the lock every tick before
    /// materializing anything, so an occurrence is only enqueued while the
    /// lease is provably held.
    async fn tick_loop(
        &self,
        shutdown: &CancellationToken,
        last_fired: &mut HashMap<String, DateTime<Utc>>,
    ) {
        loop {
            let pause = self.until_next_tick();
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }

            let now = self.clock.now();
            match self
                .backend
                .renew_scheduler(
                    &self.name,
                    &self.holder,
                    self.config.scheduler_lock_lease,
                    now,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => return,
                Err(error) => {
                    tracing::warn!(scheduler = %self.name, %error, "scheduler lock renewal failed");
                    continue;
                }
            }

            for entry in &self.entries {
                self.fire_due(entry, now, last_fired).await;
            }
        }
    }

    /// Enqueue every occurrence of `entry` that is due by `now`, starting
    /// from the later of its last firing and the backfill floor.
    async fn fire_due(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
        last_fired: &mut HashMap<String, DateTime<Utc>>,
    ) {
        let floor = now
            - TimeDelta::from_std(self.config.max_backfill).unwrap_or(TimeDelta::zero());
        let mut cursor = match last_fired.get(&entry.key) {
            Some(&at) if at > floor => at,
            _ => floor,
        };

        loop {
            let Some(candidate) = entry.schedule.next_after(cursor, self.config.tz) else {
                return;
            };
            if candidate > now {
                return;
            }
            let task = entry.occurrence(candidate, now);
            let task_id = task.id.clone();
            let persisted = async {
                self.backend.enqueue(task).await?;
                self.backend.mark_fired(&self.name, &entry.key, candidate).await
            };
            if let Err(error) = persisted.await {
                // Retried next tick; the deterministic id absorbs the
                // replayed enqueue.
                tracing::warn!(
                    scheduler = %self.name,
                    key = %entry.key,
                    %error,
                    "failed to materialize occurrence"
                );
                return;
            }
            tracing::debug!(
                scheduler = %self.name,
                key = %entry.key,
                task_id = %task_id,
                occurrence = %candidate,
                "occurrence enqueued"
            );
            last_fired.insert(entry.key.clone(), candidate);
            cursor = candidate;
        }
    }

    /// Sleep span to the next tick boundary (ticks align to wall-clock
    /// multiples of the tick interval).
    fn until_next_tick(&self) -> std::time::Duration {
        let tick_ms = self.config.tick_interval.as_millis().max(1) as i64;
        let now_ms = self.clock.now().timestamp_millis();
        let rem = now_ms.rem_euclid(tick_ms);
        std::time::Duration::from_millis((tick_ms - rem) as u64)
    }
}
