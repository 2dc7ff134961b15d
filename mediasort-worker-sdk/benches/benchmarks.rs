use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mediasort_worker_sdk::protocol::{PluginManifest, ProcessRequest, QueueKind};
use mediasort_worker_sdk::{activation_order, graph};
use std::collections::HashSet;
use uuid::Uuid;

fn chain(len: usize) -> Vec<PluginManifest> {
    (0..len)
        .map(|i| PluginManifest {
            id: format!("plugin-{i}"),
            version: "1.0.0".to_string(),
            priority: i as i32,
            default_queue: QueueKind::Fast,
            dependencies: if i == 0 {
                vec![]
            } else {
                vec![format!("plugin-{}", i - 1)]
            },
            timeout_ms: None,
            instances: None,
            filter: None,
            config_schema: None,
            output_schema: None,
        })
        .collect()
}

fn bench_activation_order(c: &mut Criterion) {
    let manifests = chain(64);
    c.bench_function("activation_order_chain_64", |b| {
        b.iter(|| activation_order(black_box(&manifests)).unwrap());
    });

    let active: HashSet<String> = manifests.iter().map(|m| m.id.clone()).collect();
    c.bench_function("active_dependencies", |b| {
        b.iter(|| graph::active_dependencies(black_box(&manifests[63]), black_box(&active)));
    });
}

fn bench_process_request_serialization(c: &mut Criterion) {
    let request = ProcessRequest {
        task_id: Uuid::new_v4(),
        cid: "b3a1f09c".to_string(),
        file_path: "/library/show/episode-01.mkv".to_string(),
        callback_url: "http://core:3000/api/plugins/callback".to_string(),
        meta_core_url: "http://core:3000".to_string(),
        existing_meta: serde_json::json!({ "size": 731906048, "ext": "mkv" }),
    };

    c.bench_function("process_request_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&request)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_activation_order,
    bench_process_request_serialization
);
criterion_main!(benches);
