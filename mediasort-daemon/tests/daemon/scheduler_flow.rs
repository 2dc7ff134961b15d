//! Scheduler dispatch flows: dependency ordering, failure paths, callback
//! matching, and the fast-over-background priority guard.

use crate::helpers::*;
use mediasort_daemon::events::Event;
use mediasort_daemon::scheduler::{TaskStatus, NO_HEALTHY_INSTANCE};
use mediasort_worker_sdk::protocol::QueueKind;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn happy_path_respects_dependency_ordering() {
    let a = accepting_worker(json!({"id": "a", "version": "1.0.0"})).await;
    let b = accepting_worker(json!({"id": "b", "version": "1.0.0"})).await;
    let c = accepting_worker(json!({
        "id": "c", "version": "1.0.0", "dependencies": ["b"]
    }))
    .await;
    let h = harness(vec![
        ("a", a.uri()),
        ("b", b.uri()),
        ("c", c.uri()),
    ])
    .await;
    let mut rx = h.events.subscribe();

    let enqueued = h
        .scheduler
        .dispatch_all("h1", "/library/file.mkv", json!({ "size": 1024 }));
    assert_eq!(enqueued, 3);

    // c declares a dependency on b, so it parks on the fence
    wait_for_event(&mut rx, Duration::from_secs(2), |event| {
        matches!(event, Event::TaskWaiting { plugin_id, .. } if plugin_id == "c")
    })
    .await;

    // a and b dispatch freely
    let req_a = wait_for_process(&a, 1).await;
    let req_b = wait_for_process(&b, 1).await;

    // b has not settled: c must not have been handed to its worker
    assert!(process_requests(&c).await.is_empty());

    assert!(h.scheduler.handle_callback(completed(&req_a[0], "a", 40)));
    assert!(h.scheduler.handle_callback(completed(&req_b[0], "b", 55)));

    // b settled: c dispatches and completes
    let req_c = wait_for_process(&c, 1).await;
    assert!(h.scheduler.handle_callback(completed(&req_c[0], "c", 12)));

    let event = wait_for_event(&mut rx, Duration::from_secs(2), |event| {
        matches!(event, Event::FileComplete { .. })
    })
    .await;
    match event {
        Event::FileComplete {
            file_hash,
            file_path,
        } => {
            assert_eq!(file_hash, "h1");
            assert_eq!(file_path, "/library/file.mkv");
        }
        _ => unreachable!(),
    }

    let stats = h.scheduler.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending_tasks, 0);

    // Completion fires exactly once per file
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, Event::FileComplete { ref file_hash, .. } if file_hash == "h1"),
            "second file:complete for h1"
        );
    }
    h.workers.shutdown().await;
}

#[tokio::test]
async fn task_without_healthy_instance_fails_and_file_still_completes() {
    let a = accepting_worker(json!({"id": "a", "version": "1.0.0"})).await;
    let h = harness(vec![("a", a.uri())]).await;
    let mut rx = h.events.subscribe();

    let task = h.scheduler.create_task(
        "ghost",
        "h2",
        "/library/orphan.mkv",
        vec![],
        QueueKind::Fast,
        json!(null),
    );
    assert!(h.scheduler.enqueue_task(&task));

    let event = wait_for_event(&mut rx, Duration::from_secs(2), |event| {
        matches!(event, Event::TaskFailed { .. })
    })
    .await;
    match event {
        Event::TaskFailed { error, .. } => assert_eq!(error, NO_HEALTHY_INSTANCE),
        _ => unreachable!(),
    }

    // The failed task was the file's only task, so completion still fires
    wait_for_event(&mut rx, Duration::from_secs(2), |event| {
        matches!(event, Event::FileComplete { file_hash, .. } if file_hash == "h2")
    })
    .await;

    assert_eq!(h.scheduler.task(task.id).unwrap().status, TaskStatus::Failed);
    h.workers.shutdown().await;
}

#[tokio::test]
async fn second_callback_for_same_task_is_dropped() {
    let a = accepting_worker(json!({"id": "a", "version": "1.0.0"})).await;
    let h = harness(vec![("a", a.uri())]).await;

    h.scheduler
        .dispatch_all("h3", "/library/file.mkv", json!(null));
    let requests = wait_for_process(&a, 1).await;

    assert!(h.scheduler.handle_callback(completed(&requests[0], "a", 30)));
    assert!(!h.scheduler.handle_callback(completed(&requests[0], "a", 30)));
    h.workers.shutdown().await;
}

#[tokio::test]
async fn callback_after_timeout_is_dropped_without_state_change() {
    // The manifest's own deadline governs the callback wait
    let a = accepting_worker(json!({
        "id": "a", "version": "1.0.0", "timeoutMs": 200
    }))
    .await;
    let h = harness(vec![("a", a.uri())]).await;
    let mut rx = h.events.subscribe();

    h.scheduler
        .dispatch_all("h4", "/library/file.mkv", json!(null));
    let requests = wait_for_process(&a, 1).await;

    wait_for_event(&mut rx, Duration::from_secs(3), |event| {
        matches!(event, Event::TaskTimeout { .. })
    })
    .await;
    wait_for_event(&mut rx, Duration::from_secs(2), |event| {
        matches!(event, Event::FileComplete { file_hash, .. } if file_hash == "h4")
    })
    .await;

    // The worker answers late; nothing must change
    assert!(!h.scheduler.handle_callback(completed(&requests[0], "a", 999)));
    let task = h.scheduler.task(requests[0].task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Timeout);
    h.workers.shutdown().await;
}

#[tokio::test]
async fn background_task_only_runs_once_fast_queue_is_idle() {
    let quick = accepting_worker(json!({"id": "quick", "version": "1.0.0"})).await;
    let slow = accepting_worker(json!({
        "id": "slow", "version": "1.0.0", "defaultQueue": "background"
    }))
    .await;
    let h = harness(vec![("quick", quick.uri()), ("slow", slow.uri())]).await;

    h.scheduler
        .dispatch_all("h5", "/library/file.mkv", json!(null));

    // The fast task is dispatched and holds its slot awaiting a callback;
    // the background tier must not move while the fast queue is busy.
    let req_quick = wait_for_process(&quick, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(process_requests(&slow).await.is_empty());
    assert!(h.scheduler.stats().fast.pending > 0);

    // Settle the fast task; the coordinator resumes the background queue
    assert!(h
        .scheduler
        .handle_callback(completed(&req_quick[0], "quick", 20)));
    let req_slow = wait_for_process(&slow, 1).await;
    assert!(h
        .scheduler
        .handle_callback(completed(&req_slow[0], "slow", 20)));

    // Both tasks settled; the file must be gone from tracking
    for _ in 0..100 {
        if !h.scheduler.has_pending_tasks("h5") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.scheduler.has_pending_tasks("h5"));
    h.workers.shutdown().await;
}

#[tokio::test]
async fn cancel_file_reaps_outstanding_tasks() {
    let a = accepting_worker(json!({"id": "a", "version": "1.0.0"})).await;
    let h = harness(vec![("a", a.uri())]).await;

    h.scheduler
        .dispatch_all("h6", "/library/file.mkv", json!(null));
    let requests = wait_for_process(&a, 1).await;

    h.scheduler.cancel_file("h6");
    assert!(!h.scheduler.has_pending_tasks("h6"));

    // The in-flight dispatch observes the reap; a late callback is dropped
    assert!(!h.scheduler.handle_callback(completed(&requests[0], "a", 10)));
    assert_eq!(
        h.scheduler.task(requests[0].task_id).unwrap().status,
        TaskStatus::Cancelled
    );

    // The queue slot is released even though no callback ever arrived
    assert!(h.scheduler.wait_for_empty(Duration::from_secs(5)).await);
    h.workers.shutdown().await;
}

#[tokio::test]
async fn dependency_wait_timeout_dispatches_with_stale_metadata() {
    let mut config = mediasort_daemon::config::SchedulerConfig::default();
    config.dependency_timeout = Duration::from_millis(300);

    let never = accepting_worker(json!({"id": "never", "version": "1.0.0"})).await;
    let dependent = accepting_worker(json!({
        "id": "dependent", "version": "1.0.0", "dependencies": ["never"]
    }))
    .await;
    let h = harness_with_config(
        vec![("never", never.uri()), ("dependent", dependent.uri())],
        config,
    )
    .await;

    // Only the dependent task is created; its dependency never settles
    let task = h.scheduler.create_task(
        "dependent",
        "h7",
        "/library/file.mkv",
        vec!["never".to_string()],
        QueueKind::Fast,
        json!(null),
    );
    assert!(h.scheduler.enqueue_task(&task));

    // After the dependency timeout the task proceeds anyway
    let requests = wait_for_process(&dependent, 1).await;
    assert!(h
        .scheduler
        .handle_callback(completed(&requests[0], "dependent", 15)));
    h.workers.shutdown().await;
}
