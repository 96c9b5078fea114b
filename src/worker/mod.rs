//! Worker execution engine.
//!
//! A worker is a single concurrent actor bound to one group. Its loop:
//! poll for an assignment, run the handler under a renewed lease, and
//! finalize the attempt with exactly one backend compare-and-swap
//! (complete, reschedule, discard, or fail). Losing the lease suppresses
//! finalization: another replica owns the task by then.

pub mod pool;

pub use pool::GroupPool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::KitConfig;
use crate::error::BackendError;
use crate::handler::{HandlerError, RetryDecision, TaskHandler};
use crate::task::{ErrorInfo, Task};

/// Attempts before a finalization write is abandoned to lease expiry.
const FINALIZE_ATTEMPTS: u32 = 5;

/// ±25% jitter, to decorrelate replicas polling the same backend.
pub(crate) fn jittered(d: Duration) -> Duration {
    d.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
}

pub struct Worker {
    id: String,
    group: String,
    backend: Arc<dyn Backend>,
    handler: Arc<dyn TaskHandler>,
    clock: Arc<dyn Clock>,
    config: Arc<KitConfig>,
}

impl Worker {
    pub fn new(
        group: impl Into<String>,
        backend: Arc<dyn Backend>,
        handler: Arc<dyn TaskHandler>,
        clock: Arc<dyn Clock>,
        config: Arc<KitConfig>,
    ) -> Self {
        let group = group.into();
        let id = format!("wk_{}_{}", group, Uuid::new_v4().simple());
        Self {
            id,
            group,
            backend,
            handler,
            clock,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll-execute loop. Returns when `shutdown` fires; an in-flight
    /// handler is allowed to finish (the pool enforces the grace deadline).
    pub async fn run(self, shutdown: CancellationToken, mut paused: watch::Receiver<bool>) {
        tracing::debug!(worker_id = %self.id, "worker started");
        let mut backoff = self.config.poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if *paused.borrow() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self
                .backend
                .assign(
                    &self.group,
                    &self.id,
                    self.config.lease_duration,
                    self.clock.now(),
                )
                .await
            {
                Ok(Some(task)) => {
                    backoff = self.config.poll_interval;
                    self.execute(task).await;
                }
                Ok(None) => {
                    if !sleep_or_shutdown(jittered(backoff), &shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.poll_interval_max);
                }
                Err(error) => {
                    tracing::warn!(worker_id = %self.id, %error, "assign failed");
                    if !sleep_or_shutdown(jittered(backoff), &shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.poll_interval_max);
                }
            }
        }
        tracing::debug!(worker_id = %self.id, "worker stopped");
    }

    async fn execute(&self, task: Task) {
        tracing::info!(
            worker_id = %self.id,
            task_id = %task.id,
            name = %task.name,
            retry_count = task.retry_count,
            "handling task"
        );

        let lease_lost = Arc::new(AtomicBool::new(false));
        let renew_stop = CancellationToken::new();
        let renewer = tokio::spawn(renew_loop(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            task.id.clone(),
            self.id.clone(),
            self.config.lease_duration,
            renew_stop.clone(),
            Arc::clone(&lease_lost),
        ));

        let outcome = self.handler.handle(&task).await;

        renew_stop.cancel();
        let _ = renewer.await;

        if lease_lost.load(Ordering::Acquire) {
            // Side effects already happened; the attempt's outcome is
            // dropped because another worker now owns the task.
            tracing::warn!(
                worker_id = %self.id,
                task_id = %task.id,
                "lease lost during execution, dropping outcome"
            );
            return;
        }

        match outcome {
            Ok(value) => match self.handler.encode_result(&task, &value) {
                Ok(payload) => {
                    let committed = self
                        .finalize("complete", || {
                            self.backend.complete(&task.id, &self.id, payload.clone())
                        })
                        .await;
                    if committed {
                        tracing::info!(worker_id = %self.id, task_id = %task.id, "task completed");
                    }
                }
                // A result that cannot be encoded is a handler failure and
                // goes through the retry policy.
                Err(info) => self.retry_or_fail(&task, info).await,
            },
            Err(HandlerError::Discard) => {
                if self
                    .finalize("discard", || self.backend.discard(&task.id, &self.id))
                    .await
                {
                    tracing::info!(worker_id = %self.id, task_id = %task.id, "task discarded");
                }
            }
            Err(HandlerError::Error(info)) => self.retry_or_fail(&task, info).await,
        }
    }

    async fn retry_or_fail(&self, task: &Task, info: ErrorInfo) {
        match self.handler.retry_interval(task, &info) {
            RetryDecision::After(delay) => {
                let due = self.clock.now()
                    + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                let retry_count = task.retry_count + 1;
                if self
                    .finalize("reschedule", || {
                        self.backend.reschedule(&task.id, &self.id, due, retry_count)
                    })
                    .await
                {
                    tracing::info!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        retry_count,
                        due = %due,
                        error = %info,
                        "task rescheduled"
                    );
                }
            }
            RetryDecision::GiveUp => {
                if self
                    .finalize("fail", || {
                        self.backend.fail_permanent(&task.id, &self.id, info.clone())
                    })
                    .await
                {
                    tracing::info!(
                        worker_id = %self.id,
                        task_id = %task.id,
                        error = %info,
                        "task failed permanently"
                    );
                }
            }
            RetryDecision::Discard => {
                if self
                    .finalize("discard", || self.backend.discard(&task.id, &self.id))
                    .await
                {
                    tracing::info!(worker_id = %self.id, task_id = %task.id, "task discarded");
                }
            }
        }
    }

    /// Run one finalization CAS, absorbing transient backend errors with
    /// backoff. Returns whether the write was committed; `false` means the
    /// lease was lost (logged) or the backend stayed away long enough for
    /// expiry to hand the task elsewhere.
    async fn finalize<F, Fut>(&self, op: &str, mut call: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<bool, BackendError>>,
    {
        let mut delay = self.config.poll_interval;
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match call().await {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::warn!(worker_id = %self.id, op, "lease lost at finalization");
                    return false;
                }
                Err(error) if error.is_transient() && attempt < FINALIZE_ATTEMPTS => {
                    tracing::warn!(worker_id = %self.id, op, %error, attempt, "retrying finalization");
                    tokio::time::sleep(jittered(delay)).await;
                    delay = (delay * 2).min(self.config.poll_interval_max);
                }
                Err(error) => {
                    tracing::error!(worker_id = %self.id, op, %error, "finalization abandoned");
                    return false;
                }
            }
        }
        false
    }
}

/// Keep the lease alive while the handler runs: renew at a third of the
/// lease duration, flag `lease_lost` and stop on a failed CAS.
async fn renew_loop(
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    task_id: String,
    worker_id: String,
    lease: Duration,
    stop: CancellationToken,
    lease_lost: Arc<AtomicBool>,
) {
    let interval = lease / 3;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match backend.renew(&task_id, &worker_id, lease, clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                lease_lost.store(true, Ordering::Release);
                return;
            }
            Err(error) => {
                // Transient; the lease still has two thirds of its span.
                tracing::warn!(worker_id = %worker_id, task_id = %task_id, %error, "lease renewal failed");
            }
        }
    }
}

/// Sleep, unless shutdown fires first. Returns `false` on shutdown.
async fn sleep_or_shutdown(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
