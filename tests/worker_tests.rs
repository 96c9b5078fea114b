//! Worker and pool behavior against a live fleet:
//! - retry and permanent-failure finalization
//! - discard leaves nothing behind
//! - lease reclamation after a worker "crash", and renewal preventing it
//! - pause/resume and graceful drain

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conveyor::{Backend, Task, WaitError};
use test_harness::*;

#[tokio::test]
async fn test_retry_then_succeed() {
    let handler = Arc::new(FlakyHandler::new(1, Duration::from_millis(200)));
    let (kit, _backend) = kit_with(handler.clone(), fast_config());
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    let started = tokio::time::Instant::now();
    let handle = kit.submit("test", "flaky", &json!({}), None).await.unwrap();
    let value = handle.get(Duration::from_secs(5)).await.unwrap();

    assert_eq!(value, json!("recovered"));
    // One failed attempt plus the successful one, with the retry delay in
    // between and retry_count visible on the second attempt.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(handler.attempts(), 2);
    assert_eq!(*handler.seen_retry_counts.lock().unwrap(), vec![0, 1]);

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_permanent_failure_surfaces_descriptor() {
    let (kit, _backend) = kit_with(Arc::new(FailingHandler), fast_config());
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    let handle = kit.submit("test", "boom", &json!({}), None).await.unwrap();
    match handle.get(Duration::from_secs(5)).await {
        Err(WaitError::TaskFailed(info)) => {
            assert_eq!(info.kind, "BoomError");
            assert!(info.message.contains("always breaks"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_discard_removes_task_and_writes_no_result() {
    let (kit, backend) = kit_with(Arc::new(DiscardHandler), fast_config());
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    let handle = kit.submit("test", "junk", &json!({}), None).await.unwrap();
    let task_id = handle.task_id().to_string();
    assert_eventually(Duration::from_secs(2), "task row removed", || {
        let backend = backend.clone();
        let task_id = task_id.clone();
        async move { backend.lookup_task(&task_id).is_none() }
    })
    .await;

    // No result was ever written, so waiting times out rather than failing.
    match handle.get(Duration::from_millis(100)).await {
        Err(WaitError::TimedOut) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }
    assert_eq!(backend.result_count(), 0);

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abandoned_lease_is_reclaimed_and_rerun() {
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(10)));
    let (kit, backend) = kit_with(handler.clone(), fast_config());

    // A worker that crashed after assignment: claims the task under the
    // fleet's lease duration and never renews or finalizes.
    let value = json!({});
    let handle = kit.submit("test", "job", &value, None).await.unwrap();
    let claimed = backend
        .assign(
            "test",
            "wk_test_dead",
            kit.config().lease_duration,
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(claimed.unwrap().id, handle.task_id());

    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    // Nothing may run while the dead worker's lease is live.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handler.call_count(), 0);

    // After expiry (lease is 400ms) the fleet reclaims and finishes it.
    let value = handle.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!("slept"));
    assert_eq!(handler.call_count(), 1);

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_renewal_keeps_long_task_from_reassignment() {
    // Handler runs for 3x the lease duration; the renewal loop must keep
    // the lease alive so no second execution happens.
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(1200)));
    let config = fast_config().with_group("test", 2);
    let (kit, _backend) = kit_with(handler.clone(), config);
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    let handle = kit.submit("test", "slow", &json!({}), None).await.unwrap();
    let value = handle.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!("slept"));
    assert_eq!(handler.call_count(), 1);

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_drain_waits_for_inflight_handler() {
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(300)));
    let (kit, _backend) = kit_with(handler.clone(), fast_config());
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    let handle = kit.submit("test", "slow", &json!({}), None).await.unwrap();
    assert_eventually(Duration::from_secs(2), "handler started", || {
        let handler = handler.clone();
        async move { handler.call_count() == 1 }
    })
    .await;

    // Shut down mid-flight: the drain lets the handler finish and the
    // result still lands.
    shutdown.cancel();
    fleet.await.unwrap().unwrap();
    let value = handle.get(Duration::from_millis(100)).await.unwrap();
    assert_eq!(value, json!("slept"));
}

#[tokio::test]
async fn test_pause_and_resume_through_service_handles() {
    let handler = Arc::new(SleepHandler::new(Duration::from_millis(5)));
    let (kit, _backend) = kit_with(handler.clone(), fast_config());

    let handles = kit.launch(Default::default()).unwrap();
    assert_eq!(handles.len(), 1);
    handles[0].pause(None);
    // Give the pause a moment to reach the workers.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handle = kit.submit("test", "job", &json!({}), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.call_count(), 0);

    handles[0].resume(None);
    let value = handle.get(Duration::from_secs(5)).await.unwrap();
    assert_eq!(value, json!("slept"));

    for handle in handles {
        handle.stop_and_join();
    }
}

#[tokio::test]
async fn test_assignment_is_scoped_to_the_group() {
    let handler = Arc::new(RecorderHandler::new());
    let (kit, backend) = kit_with(handler.clone(), fast_config());
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn({
        let kit = kit.clone();
        let shutdown = shutdown.clone();
        async move { kit.run_until(Default::default(), shutdown).await }
    });

    // A task in a group with no pool stays queued.
    let other = Task::new("other", "ignored", vec![], None, chrono::Utc::now());
    let other_id = other.id.clone();
    backend.enqueue(other).await.unwrap();
    let handle = kit.submit("test", "mine", &json!({}), None).await.unwrap();
    handle.get(Duration::from_secs(5)).await.unwrap();

    assert_eq!(handler.names(), vec!["mine"]);
    assert!(backend.lookup_task(&other_id).is_some());

    shutdown.cancel();
    fleet.await.unwrap().unwrap();
}
