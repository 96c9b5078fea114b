use std::collections::HashMap;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::{ConveyorError, Result};
use crate::task::DEFAULT_TASK_TTL;

/// Fleet configuration.
///
/// Defaults are sized for I/O-bound handlers: a lease comfortably above p99
/// task runtime, short polls with capped backoff, and a grace period long
/// enough to let in-flight handlers finish on shutdown.
#[derive(Debug, Clone)]
pub struct KitConfig {
    /// Workers per group; one pool per entry in every service.
    pub worker_counts: HashMap<String, usize>,
    /// Independent service instances (each runs one pool per group).
    pub num_services: usize,
    pub lease_duration: Duration,
    /// Poll backoff starts here and doubles up to `poll_interval_max`,
    /// with ±25% jitter; reset on any successful assignment.
    pub poll_interval: Duration,
    pub poll_interval_max: Duration,
    pub shutdown_grace: Duration,
    /// Scheduler tick, realigned to second boundaries.
    pub tick_interval: Duration,
    /// How far back missed occurrences are materialized after a pause or
    /// failover.
    pub max_backfill: Duration,
    pub scheduler_lock_lease: Duration,
    pub janitor_interval: Duration,
    /// Result retention for tasks submitted through the kit.
    pub task_ttl: Duration,
    /// Wall-clock timezone for schedule interpretation.
    pub tz: Tz,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            worker_counts: HashMap::new(),
            num_services: 1,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            poll_interval_max: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            max_backfill: Duration::from_secs(60),
            scheduler_lock_lease: Duration::from_secs(15),
            janitor_interval: Duration::from_secs(60),
            task_ttl: DEFAULT_TASK_TTL,
            tz: chrono_tz::UTC,
        }
    }
}

impl KitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>, workers: usize) -> Self {
        self.worker_counts.insert(group.into(), workers);
        self
    }

    pub fn with_num_services(mut self, num_services: usize) -> Self {
        self.num_services = num_services;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, base: Duration, max: Duration) -> Self {
        self.poll_interval = base;
        self.poll_interval_max = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    pub fn with_tz(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_services == 0 {
            return Err(ConveyorError::Config(
                "num_services must be at least 1".into(),
            ));
        }
        if let Some((group, _)) = self.worker_counts.iter().find(|(_, n)| **n == 0) {
            return Err(ConveyorError::Config(format!(
                "group `{group}` must have at least 1 worker"
            )));
        }
        if self.poll_interval.is_zero() || self.poll_interval_max < self.poll_interval {
            return Err(ConveyorError::Config(
                "poll intervals must satisfy 0 < base <= max".into(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(ConveyorError::Config("lease_duration must be non-zero".into()));
        }
        Ok(())
    }
}
