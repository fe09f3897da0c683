use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quotaring::{
    EngineConfig, EventId, InMemoryShardCluster, LocalEvaluator, NodeId, QuotaEngine,
    ShardRouter, TierRegistry, Timestamp, WindowConfig, WindowKey,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn nodes(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::from(format!("shard-{i}"))).collect()
}

fn local_evaluate(c: &mut Criterion) {
    let tiers = TierRegistry::new();
    tiers.configure("per_user", WindowConfig::new(1_000, Duration::from_secs(60)).unwrap()).unwrap();
    let local = LocalEvaluator::new(tiers, Duration::from_millis(50));
    let tick = AtomicU64::new(0);

    c.bench_function("local_evaluate_1k_subjects", |b| {
        b.iter(|| {
            let n = tick.fetch_add(1, Ordering::Relaxed);
            let subject = format!("user{}", n % 1_000);
            let _ = black_box(local.allow(&subject, "gpt-4", "per_user", Timestamp::from_millis(n)));
        });
    });
}

fn engine_evaluate_two_tiers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = EngineConfig::builder()
        .skew_tolerance(Duration::from_millis(50))
        .remote_timeout(Duration::from_millis(100))
        .failure_threshold(5)
        .observation_interval(Duration::from_secs(10))
        .recovery_successes(3)
        .build()
        .unwrap();
    let cluster = InMemoryShardCluster::new(nodes(4));
    let engine = QuotaEngine::new(config, Arc::new(cluster), nodes(4));
    engine.configure("per_user", 100, Duration::from_secs(60)).unwrap();
    engine.configure("per_minute", 10_000, Duration::from_secs(60)).unwrap();
    let tick = AtomicU64::new(0);

    c.bench_function("engine_evaluate_two_tiers", |b| {
        b.to_async(&rt).iter(|| async {
            let n = tick.fetch_add(1, Ordering::Relaxed);
            let subject = format!("user{}", n % 1_000);
            let decision = engine
                .evaluate(
                    &subject,
                    "gpt-4",
                    &["per_user", "per_minute"],
                    Timestamp::from_millis(n),
                    &EventId::generate(),
                )
                .await;
            black_box(decision);
        });
    });
}

fn route_keys(c: &mut Criterion) {
    let router = ShardRouter::new(nodes(16), 128);
    let keys: Vec<String> =
        (0..1_024).map(|i| WindowKey::new(format!("user{i}"), "gpt-4", "per_user").storage_key()).collect();
    let mut i = 0;

    c.bench_function("route_16_nodes", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(router.route(black_box(&keys[i])));
        });
    });
}

criterion_group!(benches, local_evaluate, engine_evaluate_two_tiers, route_keys);
criterion_main!(benches);
