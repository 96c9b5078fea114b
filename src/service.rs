//! Service: one runnable slice of the fleet.
//!
//! A service owns one worker pool per configured group, optionally the
//! schedulers, and the result janitor. Several services can run in one
//! runtime or on separate threads; all coordination still goes through the
//! backend, so services are individually restartable.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::KitConfig;
use crate::error::Result;
use crate::handler::TaskHandler;
use crate::scheduler::{ScheduleEntry, Scheduler};
use crate::worker::{jittered, GroupPool};

/// Maximum results deleted per janitor sweep.
const JANITOR_BATCH: usize = 100;

pub struct Service {
    shutdown: CancellationToken,
    pools: Vec<GroupPool>,
    aux: Vec<JoinHandle<()>>,
    config: Arc<KitConfig>,
}

impl Service {
    /// Spawn pools, schedulers (when `run_schedulers`), and the janitor on
    /// the current runtime, under a child of `parent`.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        handler: Arc<dyn TaskHandler>,
        clock: Arc<dyn Clock>,
        config: Arc<KitConfig>,
        schedule_entries: &HashMap<String, Vec<ScheduleEntry>>,
        run_schedulers: bool,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let shutdown = parent.child_token();

        let pools = config
            .worker_counts
            .iter()
            .map(|(group, count)| {
                GroupPool::spawn(
                    group.clone(),
                    *count,
                    Arc::clone(&backend),
                    Arc::clone(&handler),
                    Arc::clone(&clock),
                    Arc::clone(&config),
                    &shutdown,
                )
            })
            .collect();

        let mut aux = Vec::new();
        if run_schedulers {
            for (name, entries) in schedule_entries {
                if entries.is_empty() {
                    continue;
                }
                let scheduler = Scheduler::new(
                    name.clone(),
                    entries.clone(),
                    Arc::clone(&backend),
                    Arc::clone(&clock),
                    Arc::clone(&config),
                )?;
                aux.push(tokio::spawn(scheduler.run(shutdown.clone())));
            }
        }
        aux.push(tokio::spawn(janitor_loop(
            Arc::clone(&backend),
            Arc::clone(&clock),
            Arc::clone(&config),
            shutdown.clone(),
        )));

        Ok(Self {
            shutdown,
            pools,
            aux,
            config,
        })
    }

    /// Pause assignment for the named groups, or all groups when `None`.
    pub fn pause(&self, groups: Option<&[String]>) {
        for pool in self.selected(groups) {
            pool.pause();
        }
    }

    pub fn resume(&self, groups: Option<&[String]>) {
        for pool in self.selected(groups) {
            pool.resume();
        }
    }

    fn selected<'a>(&'a self, groups: Option<&'a [String]>) -> impl Iterator<Item = &'a GroupPool> {
        self.pools
            .iter()
            .filter(move |pool| match groups {
                Some(groups) => groups.iter().any(|g| g == pool.group()),
                None => true,
            })
    }

    /// Drain all pools concurrently, then collect the auxiliary loops.
    pub async fn drain(self) {
        self.shutdown.cancel();
        let grace = self.config.shutdown_grace;
        let drains: Vec<_> = self
            .pools
            .into_iter()
            .map(|pool| tokio::spawn(pool.drain(grace)))
            .collect();
        for drain in drains {
            let _ = drain.await;
        }
        for handle in self.aux {
            let _ = handle.await;
        }
    }
}

/// Periodically delete result rows whose retention expired. Every service
/// runs one; the operation is idempotent so replicas do not need a lock.
async fn janitor_loop(
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: Arc<KitConfig>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(jittered(config.janitor_interval)) => {}
        }
        loop {
            match backend.purge_expired_results(clock.now(), JANITOR_BATCH).await {
                Ok(purged) => {
                    if purged > 0 {
                        tracing::debug!(purged, "purged expired results");
                    }
                    // A full batch means there is likely more to do.
                    if purged < JANITOR_BATCH {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "result purge failed");
                    break;
                }
            }
        }
    }
}
