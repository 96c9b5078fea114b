//! Shared helpers for integration tests: canned handlers, a fast fleet
//! configuration, and polling assertions.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use conveyor::{
    ErrorInfo, HandlerError, Kit, KitConfig, MemoryBackend, RetryDecision, Task, TaskHandler,
};

/// Fleet configuration with test-sized timings.
pub fn fast_config() -> KitConfig {
    KitConfig::new()
        .with_group("test", 1)
        .with_poll_interval(Duration::from_millis(5), Duration::from_millis(20))
        .with_lease_duration(Duration::from_millis(400))
        .with_shutdown_grace(Duration::from_secs(2))
}

pub fn kit_with(handler: Arc<dyn TaskHandler>, config: KitConfig) -> (Kit, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let kit = Kit::new(backend.clone(), handler, config);
    (kit, backend)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn assert_eventually<F, Fut>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Echoes the decoded task data back as the result.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError> {
        serde_json::from_slice(&task.data)
            .map_err(|e| HandlerError::failure("DecodeError", e.to_string()))
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Fails the first `failures` attempts, then succeeds; retries after
/// `retry_delay`. Records the `retry_count` of every attempt it sees.
pub struct FlakyHandler {
    remaining_failures: AtomicU32,
    pub retry_delay: Duration,
    pub seen_retry_counts: Mutex<Vec<u32>>,
}

impl FlakyHandler {
    pub fn new(failures: u32, retry_delay: Duration) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            retry_delay,
            seen_retry_counts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.seen_retry_counts.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError> {
        self.seen_retry_counts.lock().unwrap().push(task.retry_count);
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failure(
                "FlakyError",
                format!("intentional failure ({left} left)"),
            ));
        }
        Ok(json!("recovered"))
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::After(self.retry_delay)
    }
}

/// Always fails, never retries.
pub struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, _task: &Task) -> Result<Value, HandlerError> {
        Err(HandlerError::failure("BoomError", "it always breaks"))
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Raises the discard signal on every attempt.
pub struct DiscardHandler;

#[async_trait]
impl TaskHandler for DiscardHandler {
    async fn handle(&self, _task: &Task) -> Result<Value, HandlerError> {
        Err(HandlerError::Discard)
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Sleeps for a fixed span, counting invocations.
pub struct SleepHandler {
    pub sleep_for: Duration,
    pub calls: AtomicU32,
}

impl SleepHandler {
    pub fn new(sleep_for: Duration) -> Self {
        Self {
            sleep_for,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, _task: &Task) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.sleep_for).await;
        Ok(json!("slept"))
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Records the order in which task names are handled.
pub struct RecorderHandler {
    pub order: Mutex<Vec<String>>,
}

impl RecorderHandler {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl Default for RecorderHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for RecorderHandler {
    async fn handle(&self, task: &Task) -> Result<Value, HandlerError> {
        self.order.lock().unwrap().push(task.name.clone());
        Ok(json!(null))
    }

    fn retry_interval(&self, _task: &Task, _error: &ErrorInfo) -> RetryDecision {
        RetryDecision::GiveUp
    }
}
