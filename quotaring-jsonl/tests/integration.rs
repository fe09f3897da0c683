use quotaring::{
    EngineConfig, EventId, FailoverMode, InMemoryShardCluster, NodeId, QuotaEngine, QuotaEvent,
    Timestamp,
};
use quotaring_jsonl::JsonlSink;
use std::sync::Arc;
use std::time::Duration;
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(QuotaEvent::ModeChanged {
        from: FailoverMode::RemoteHealthy,
        to: FailoverMode::DegradedLocal,
    })
    .await
    .unwrap();
    sink.call(QuotaEvent::TopologyChanged { node: NodeId::from("n1"), joined: true, node_count: 2 })
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<serde_json::Value> =
        contents.lines().map(|l| serde_json::from_str(l).expect("valid json")).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "mode_changed");
    assert_eq!(lines[0]["to"], "degraded-local");
    assert_eq!(lines[1]["node"], "n1");
}

#[tokio::test]
async fn engine_decisions_are_appended() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("decisions.jsonl");

    let config = EngineConfig::builder()
        .skew_tolerance(Duration::ZERO)
        .remote_timeout(Duration::from_millis(100))
        .failure_threshold(3)
        .observation_interval(Duration::from_secs(10))
        .recovery_successes(1)
        .build()
        .unwrap();
    let nodes = vec![NodeId::from("shard-0")];
    let engine = QuotaEngine::new(config, Arc::new(InMemoryShardCluster::new(nodes.clone())), nodes)
        .with_sink(JsonlSink::new(&path));
    engine.configure("per_user", 1, Duration::from_secs(60)).unwrap();

    for _ in 0..2 {
        engine
            .evaluate("alice", "gpt-4", &["per_user"], Timestamp::from_secs(1), &EventId::generate())
            .await;
    }

    let contents = std::fs::read_to_string(&path).expect("file");
    let decisions: Vec<serde_json::Value> =
        contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0]["admitted"], true);
    assert_eq!(decisions[1]["admitted"], false);
    assert_eq!(decisions[1]["reason"], "quota_exceeded");
}
