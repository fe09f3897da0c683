#![allow(dead_code)]

use quotaring::{
    DegradedPolicy, EngineConfig, InMemoryShardCluster, ManualClock, MemorySink, NodeId,
    QuotaEngine,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub const REMOTE_TIMEOUT: Duration = Duration::from_millis(100);

pub fn nodes(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::from(format!("shard-{i}"))).collect()
}

pub fn config(failure_threshold: usize, recovery_successes: usize) -> EngineConfig {
    EngineConfig::builder()
        .skew_tolerance(Duration::ZERO)
        .remote_timeout(REMOTE_TIMEOUT)
        .failure_threshold(failure_threshold)
        .observation_interval(Duration::from_secs(30))
        .recovery_successes(recovery_successes)
        .probe_interval(Duration::from_secs(1))
        .degraded_policy(DegradedPolicy::FailOpen)
        .build()
        .expect("valid config")
}

pub struct Harness {
    pub engine: QuotaEngine<MemorySink>,
    pub cluster: InMemoryShardCluster,
    pub clock: ManualClock,
    pub sink: MemorySink,
}

pub fn harness(node_count: usize, config: EngineConfig) -> Harness {
    let nodes = nodes(node_count);
    let cluster = InMemoryShardCluster::new(nodes.clone());
    let clock = ManualClock::default();
    let sink = MemorySink::new();
    let engine = QuotaEngine::new(config, Arc::new(cluster.clone()), nodes)
        .with_clock(Arc::new(clock.clone()))
        .with_sink(sink.clone());
    Harness { engine, cluster, clock, sink }
}

/// Log capture for `tracing_subscriber::fmt().with_writer(..)`.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
