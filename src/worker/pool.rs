//! Per-group worker pool.
//!
//! A pool owns a fixed number of workers for one group. Workers share no
//! mutable state beyond the backend handle; the pool only fans out
//! lifecycle signals (shutdown, pause/resume).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::KitConfig;
use crate::handler::TaskHandler;
use crate::worker::Worker;

pub struct GroupPool {
    group: String,
    shutdown: CancellationToken,
    pause_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl GroupPool {
    /// Spawn `count` workers for `group` under a child of `parent`.
    pub fn spawn(
        group: impl Into<String>,
        count: usize,
        backend: Arc<dyn Backend>,
        handler: Arc<dyn TaskHandler>,
        clock: Arc<dyn Clock>,
        config: Arc<KitConfig>,
        parent: &CancellationToken,
    ) -> Self {
        let group = group.into();
        let shutdown = parent.child_token();
        let (pause_tx, pause_rx) = watch::channel(false);

        let workers = (0..count)
            .map(|_| {
                let worker = Worker::new(
                    group.clone(),
                    Arc::clone(&backend),
                    Arc::clone(&handler),
                    Arc::clone(&clock),
                    Arc::clone(&config),
                );
                tokio::spawn(worker.run(shutdown.clone(), pause_rx.clone()))
            })
            .collect();

        tracing::info!(group = %group, workers = count, "worker pool started");
        Self {
            group,
            shutdown,
            pause_tx,
            workers,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stop taking new assignments. In-flight handlers run to completion.
    pub fn pause(&self) {
        if self.pause_tx.send(true).is_ok() {
            tracing::info!(group = %self.group, "worker pool paused");
        }
    }

    pub fn resume(&self) {
        if self.pause_tx.send(false).is_ok() {
            tracing::info!(group = %self.group, "worker pool resumed");
        }
    }

    /// Graceful drain: stop dispatching, wait up to `grace` for in-flight
    /// handlers, then abort whatever is left.
    pub async fn drain(self, grace: Duration) {
        self.shutdown.cancel();
        let aborts: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        let join_all = async {
            for handle in self.workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            tracing::warn!(group = %self.group, "grace deadline exceeded, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!(group = %self.group, "worker pool stopped");
    }
}
