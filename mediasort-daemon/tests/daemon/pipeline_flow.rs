//! Pipeline-to-scheduler handoff, including the identity-collision path
//! where the second file's task set is grouped under its full hash.

use crate::helpers::*;
use mediasort_daemon::config::PipelineConfig;
use mediasort_daemon::notifier::{ChangeBatcher, LogNotifier};
use mediasort_daemon::pipeline::StreamingPipeline;
use mediasort_daemon::state::{FilePhase, StateManager};
use mediasort_daemon::store::MemoryMetadataStore;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_phase(state: &StateManager, path: &str, phase: FilePhase) {
    for _ in 0..500 {
        if state.get(path).map(|record| record.phase) == Some(phase) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{path} never reached {phase:?}, currently {:?}",
        state.get(path).map(|record| record.phase)
    );
}

#[tokio::test]
async fn file_completes_through_scheduler() {
    let worker = Arc::new(accepting_worker(json!({"id": "meta", "version": "1.0.0"})).await);
    let h = harness(vec![("meta", worker.uri())]).await;
    auto_respond(Arc::clone(&worker), "meta", Arc::clone(&h.scheduler));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mkv");
    tokio::fs::write(&path, b"some media payload").await.unwrap();
    let path = path.to_string_lossy().into_owned();

    let state = Arc::new(StateManager::new());
    let pipeline = StreamingPipeline::new(
        PipelineConfig::default(),
        Some(Arc::clone(&h.scheduler)),
        Arc::new(MemoryMetadataStore::new()),
        Arc::clone(&state),
        ChangeBatcher::new(Arc::new(LogNotifier), Duration::from_secs(60)),
    );

    pipeline.ingest(path.clone());
    wait_for_phase(&state, &path, FilePhase::Done).await;

    // The plugin ran exactly once, grouped under the identity hash
    let requests = process_requests(&worker).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(
        Some(requests[0].cid.clone()),
        state.get(&path).unwrap().file_hash
    );
    h.workers.shutdown().await;
}

#[tokio::test]
async fn collision_suppresses_second_file_but_still_processes_it() {
    let worker = Arc::new(accepting_worker(json!({"id": "meta", "version": "1.0.0"})).await);
    let h = harness(vec![("meta", worker.uri())]).await;
    auto_respond(Arc::clone(&worker), "meta", Arc::clone(&h.scheduler));

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("one.mkv");
    let second = dir.path().join("two.mkv");
    // Identical size and content fabricate an identity-hash collision
    tokio::fs::write(&first, b"identical payload").await.unwrap();
    tokio::fs::write(&second, b"identical payload").await.unwrap();
    let first = first.to_string_lossy().into_owned();
    let second = second.to_string_lossy().into_owned();

    let state = Arc::new(StateManager::new());
    let pipeline = StreamingPipeline::new(
        PipelineConfig::default(),
        Some(Arc::clone(&h.scheduler)),
        Arc::new(MemoryMetadataStore::new()),
        Arc::clone(&state),
        ChangeBatcher::new(Arc::new(LogNotifier), Duration::from_secs(60)),
    );

    pipeline.ingest(first.clone());
    wait_for_phase(&state, &first, FilePhase::Done).await;
    pipeline.ingest(second.clone());
    wait_for_phase(&state, &second, FilePhase::Done).await;

    assert_eq!(pipeline.stats().suppressed, 1);

    // Both files ran their task set, under different grouping keys: the
    // identity hash for the first, the full hash for the second
    let requests = process_requests(&worker).await;
    assert_eq!(requests.len(), 2);
    let cids: HashSet<String> = requests.iter().map(|r| r.cid.clone()).collect();
    assert_eq!(cids.len(), 2);

    let identity = state.get(&first).unwrap().file_hash.unwrap();
    assert!(cids.contains(&identity));
    h.workers.shutdown().await;
}
