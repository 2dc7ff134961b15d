//! Gate and drain semantics: a closed gate rejects new tasks while
//! in-flight work runs to completion.

use crate::helpers::*;
use mediasort_daemon::events::Event;
use mediasort_worker_sdk::protocol::QueueKind;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn closed_gate_rejects_new_tasks_and_drain_completes() {
    let worker = Arc::new(accepting_worker(json!({"id": "meta", "version": "1.0.0"})).await);
    let h = harness(vec![("meta", worker.uri())]).await;
    let mut rx = h.events.subscribe();

    // Put several files in flight; no callbacks yet
    for i in 0..5 {
        h.scheduler
            .dispatch_all(&format!("hash-{i}"), &format!("/library/{i}.mkv"), json!(null));
    }
    wait_for_process(&worker, 5).await;

    h.scheduler.set_gate(false);
    assert!(!h.scheduler.is_gate_open());

    // Every subsequent enqueue is refused and the task untracked
    let rejected = h.scheduler.create_task(
        "meta",
        "hash-late",
        "/library/late.mkv",
        vec![],
        QueueKind::Fast,
        json!(null),
    );
    assert!(!h.scheduler.enqueue_task(&rejected));
    assert!(h.scheduler.task(rejected.id).is_none());
    assert!(!h.scheduler.has_pending_tasks("hash-late"));

    // In-flight tasks keep running; answer them and the queues drain
    auto_respond(Arc::clone(&worker), "meta", Arc::clone(&h.scheduler));
    assert!(h.scheduler.wait_for_empty(Duration::from_secs(10)).await);

    let stats = h.scheduler.stats();
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.pending_callbacks, 0);

    // Each file completed exactly once
    let mut completions: HashMap<String, usize> = HashMap::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::FileComplete { file_hash, .. } = event {
            *completions.entry(file_hash).or_default() += 1;
        }
    }
    assert_eq!(completions.len(), 5);
    assert!(completions.values().all(|&count| count == 1));

    // Reopening restores admission
    h.scheduler.set_gate(true);
    let accepted = h.scheduler.create_task(
        "meta",
        "hash-after",
        "/library/after.mkv",
        vec![],
        QueueKind::Fast,
        json!(null),
    );
    assert!(h.scheduler.enqueue_task(&accepted));
    assert!(h.scheduler.wait_for_empty(Duration::from_secs(10)).await);
    h.workers.shutdown().await;
}

#[tokio::test]
async fn wait_for_empty_times_out_while_work_is_outstanding() {
    let worker = Arc::new(accepting_worker(json!({"id": "meta", "version": "1.0.0"})).await);
    let h = harness(vec![("meta", worker.uri())]).await;

    h.scheduler
        .dispatch_all("hash-wait", "/library/wait.mkv", json!(null));
    wait_for_process(&worker, 1).await;

    // No callback: the dispatch future still holds its slot
    assert!(!h.scheduler.wait_for_empty(Duration::from_millis(700)).await);

    auto_respond(Arc::clone(&worker), "meta", Arc::clone(&h.scheduler));
    assert!(h.scheduler.wait_for_empty(Duration::from_secs(10)).await);
    h.workers.shutdown().await;
}
