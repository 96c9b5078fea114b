use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::Schedule;
use crate::task::Task;

/// Namespace for deterministic occurrence ids (uuid v5).
const OCCURRENCE_NAMESPACE: Uuid = Uuid::from_u128(0x8c9d_1f4a_73b2_4e06_9a51_c0de_5eed_f00d);

/// A recurring task template, declared at startup.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Unique within its scheduler name.
    pub key: String,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    pub schedule: Schedule,
}

impl ScheduleEntry {
    pub fn new(
        key: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
        schedule: impl Into<Schedule>,
    ) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            name: name.into(),
            data,
            schedule: schedule.into(),
        }
    }

    /// Materialize one firing of this entry as a task row.
    ///
    /// The id hashes `(key, occurrence instant)`, so every replica that
    /// computes the same occurrence produces the same id and the backend's
    /// idempotent enqueue absorbs the duplicates.
    pub fn occurrence(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(
            self.group.clone(),
            self.name.clone(),
            self.data.clone(),
            Some(at),
            now,
        );
        task.id = occurrence_id(&self.group, &self.key, at);
        task.scheduled_at = Some(at);
        task
    }
}

/// Deterministic task id for one firing of an entry.
pub fn occurrence_id(group: &str, key: &str, at: DateTime<Utc>) -> String {
    let seed = format!("{}@{}", key, at.timestamp());
    Task::make_id(group, Uuid::new_v5(&OCCURRENCE_NAMESPACE, seed.as_bytes()))
}

/// Persisted form of a schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    /// Serialized schedule description; informational (see
    /// [`Schedule::describe`]).
    pub schedule_blob: Vec<u8>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl EntryRecord {
    pub fn from_entry(entry: &ScheduleEntry) -> Self {
        Self {
            key: entry.key.clone(),
            group: entry.group.clone(),
            name: entry.name.clone(),
            data: entry.data.clone(),
            schedule_blob: entry.schedule.describe(),
            last_fired_at: None,
        }
    }
}
