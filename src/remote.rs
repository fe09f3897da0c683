//! Remote atomic evaluation on the shard node that owns a key.
//!
//! The remote store is a capability, not a dependency: anything that can run a [`ScriptCall`]
//! against one key without interleaving another call on the same key can implement
//! [`ShardBackend`] (a Redis-compatible store running a server-side script, a replicated KV with
//! per-key transactions, ...). The call carries everything the algorithm needs, including the
//! caller's `now`, so the node never reads its own clock and two callers with the same inputs get
//! the same answer.
//!
//! [`InMemoryShardCluster`] implements the contract in-process. Each node executes calls one at a
//! time, the way a single-threaded store does, and records expire `window + skew + grace` after
//! their last write so idle keys disappear without engine action.

use crate::config::{TierRegistry, WindowConfig};
use crate::decision::Decision;
use crate::error::{BackendError, QuotaError};
use crate::evaluator::WindowEvaluator;
use crate::key::WindowKey;
use crate::ring::{NodeId, ShardRouter};
use crate::timeout::TimeoutPolicy;
use crate::window::{EventId, Timestamp, WindowState};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// One indivisible operation executed by a shard node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptCall {
    /// Purge, count, append-if-under-quota, refresh the record expiry.
    Evaluate {
        key: WindowKey,
        config: WindowConfig,
        now: Timestamp,
        event: EventId,
        skew_tolerance: Duration,
        record_ttl: Duration,
    },
    /// Purge and count; records nothing.
    Count { key: WindowKey, config: WindowConfig, now: Timestamp, skew_tolerance: Duration },
    /// Delete the record.
    Reset { key: WindowKey },
    /// Delete every record of a subject held by the node.
    ResetSubject { subject: String },
    /// Liveness check.
    Probe,
    /// Live record count per tier.
    TrackedKeys,
}

impl ScriptCall {
    fn name(&self) -> &'static str {
        match self {
            ScriptCall::Evaluate { .. } => "evaluate",
            ScriptCall::Count { .. } => "count",
            ScriptCall::Reset { .. } => "reset",
            ScriptCall::ResetSubject { .. } => "reset_subject",
            ScriptCall::Probe => "probe",
            ScriptCall::TrackedKeys => "tracked_keys",
        }
    }
}

/// Reply to a [`ScriptCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum ScriptReply {
    Decision(Decision),
    Count(usize),
    Reset,
    Cleared(usize),
    Pong,
    TrackedKeys(BTreeMap<String, usize>),
}

/// Transport to shard nodes. Implementations must execute each call on `node` atomically with
/// respect to every other call touching the same key.
#[async_trait]
pub trait ShardBackend: Send + Sync + std::fmt::Debug {
    async fn execute(&self, node: &NodeId, call: ScriptCall) -> Result<ScriptReply, BackendError>;
}

/// Evaluator that runs every operation on the key's owning shard node.
#[derive(Debug, Clone)]
pub struct RemoteEvaluator {
    router: ShardRouter,
    backend: Arc<dyn ShardBackend>,
    timeout: TimeoutPolicy,
    tiers: TierRegistry,
    skew_tolerance: Duration,
    record_grace: Duration,
}

impl RemoteEvaluator {
    pub fn new(
        router: ShardRouter,
        backend: Arc<dyn ShardBackend>,
        tiers: TierRegistry,
        timeout: Duration,
        skew_tolerance: Duration,
        record_grace: Duration,
    ) -> Self {
        Self {
            router,
            backend,
            timeout: TimeoutPolicy::new(timeout),
            tiers,
            skew_tolerance,
            record_grace,
        }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    async fn call_node(&self, node: &NodeId, call: ScriptCall) -> Result<ScriptReply, BackendError> {
        let op = call.name();
        let result = self.timeout.execute(self.backend.execute(node, call)).await;
        if let Err(err) = &result {
            tracing::warn!(node = %node, op, error = %err, "remote call failed");
        }
        result
    }

    async fn call_owner(&self, key: &WindowKey, call: ScriptCall) -> Result<(NodeId, ScriptReply), BackendError> {
        let node = self.router.route(&key.storage_key()).ok_or(BackendError::NoNodes)?;
        let reply = self.call_node(&node, call).await?;
        Ok((node, reply))
    }

    /// Run `call` on every ring node concurrently; fails with the first error.
    async fn broadcast(&self, call: ScriptCall) -> Result<Vec<(NodeId, ScriptReply)>, BackendError> {
        let ring = self.router.snapshot();
        if ring.is_empty() {
            return Err(BackendError::NoNodes);
        }
        let calls = ring.nodes().map(|node| {
            let call = call.clone();
            async move { self.call_node(node, call).await.map(|reply| (node.clone(), reply)) }
        });
        try_join_all(calls).await
    }

    /// Probe every node on the ring; any node that does not answer fails the probe.
    pub async fn probe(&self) -> Result<(), BackendError> {
        for (node, reply) in self.broadcast(ScriptCall::Probe).await? {
            if reply != ScriptReply::Pong {
                return Err(BackendError::UnexpectedReply { node });
            }
        }
        Ok(())
    }

    /// Delete every window of `subject` on every node. Returns records cleared.
    pub async fn reset_subject(&self, subject: &str) -> Result<usize, BackendError> {
        let call = ScriptCall::ResetSubject { subject: subject.to_string() };
        let mut cleared = 0;
        for (node, reply) in self.broadcast(call).await? {
            match reply {
                ScriptReply::Cleared(n) => cleared += n,
                _ => return Err(BackendError::UnexpectedReply { node }),
            }
        }
        Ok(cleared)
    }

    /// Live record counts per tier, summed over every node.
    pub async fn tracked_keys(&self) -> Result<BTreeMap<String, usize>, BackendError> {
        let mut totals = BTreeMap::new();
        for (node, reply) in self.broadcast(ScriptCall::TrackedKeys).await? {
            match reply {
                ScriptReply::TrackedKeys(counts) => {
                    for (tier, n) in counts {
                        *totals.entry(tier).or_insert(0) += n;
                    }
                }
                _ => return Err(BackendError::UnexpectedReply { node }),
            }
        }
        Ok(totals)
    }

    /// Admit or deny one event on the owning shard.
    pub async fn allow(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, QuotaError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        let decision = WindowEvaluator::evaluate(self, &key, &config, now, event).await?;
        Ok(decision.for_tier(tier))
    }

    /// In-window count on the owning shard.
    pub async fn count(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
    ) -> Result<usize, QuotaError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        Ok(WindowEvaluator::count(self, &key, &config, now).await?)
    }

    /// Delete the window on the owning shard.
    pub async fn reset(&self, subject: &str, resource: &str, tier: &str) -> Result<(), QuotaError> {
        let (key, _) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        Ok(WindowEvaluator::reset(self, &key).await?)
    }
}

#[async_trait]
impl WindowEvaluator for RemoteEvaluator {
    async fn evaluate(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, BackendError> {
        let call = ScriptCall::Evaluate {
            key: key.clone(),
            config: config.clone(),
            now,
            event: event.clone(),
            skew_tolerance: self.skew_tolerance,
            record_ttl: config
                .window()
                .saturating_add(self.skew_tolerance)
                .saturating_add(self.record_grace),
        };
        match self.call_owner(key, call).await? {
            (_, ScriptReply::Decision(decision)) => Ok(decision),
            (node, _) => Err(BackendError::UnexpectedReply { node }),
        }
    }

    async fn count(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
    ) -> Result<usize, BackendError> {
        let call = ScriptCall::Count {
            key: key.clone(),
            config: config.clone(),
            now,
            skew_tolerance: self.skew_tolerance,
        };
        match self.call_owner(key, call).await? {
            (_, ScriptReply::Count(n)) => Ok(n),
            (node, _) => Err(BackendError::UnexpectedReply { node }),
        }
    }

    async fn reset(&self, key: &WindowKey) -> Result<(), BackendError> {
        match self.call_owner(key, ScriptCall::Reset { key: key.clone() }).await? {
            (_, ScriptReply::Reset) => Ok(()),
            (node, _) => Err(BackendError::UnexpectedReply { node }),
        }
    }
}

#[derive(Debug)]
struct Record {
    state: WindowState,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct NodeRecords {
    records: HashMap<WindowKey, Record>,
    // Latest caller time seen; expiry is judged against it for calls that carry no `now`.
    high_water: Timestamp,
}

/// One simulated shard node.
#[derive(Debug)]
struct ShardNode {
    data: Mutex<NodeRecords>,
    reachable: AtomicBool,
    latency_millis: AtomicU64,
    calls: AtomicU64,
}

impl ShardNode {
    fn new() -> Self {
        Self {
            data: Mutex::new(NodeRecords::default()),
            reachable: AtomicBool::new(true),
            latency_millis: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    fn run(&self, call: ScriptCall) -> ScriptReply {
        let mut data = self.data.lock().expect("shard node poisoned");
        match call {
            ScriptCall::Evaluate { key, config, now, event, skew_tolerance, record_ttl } => {
                data.high_water = data.high_water.max(now);
                let live = data.records.get(&key).is_some_and(|r| r.expires_at > now);
                if !live {
                    data.records.remove(&key);
                }
                let record = data
                    .records
                    .entry(key)
                    .or_insert_with(|| Record { state: WindowState::new(), expires_at: now });
                let decision = record.state.evaluate(&config, now, &event, skew_tolerance);
                record.expires_at = record.expires_at.max(now.saturating_add(record_ttl));
                ScriptReply::Decision(decision)
            }
            ScriptCall::Count { key, config, now, skew_tolerance } => {
                data.high_water = data.high_water.max(now);
                let count = match data.records.get_mut(&key) {
                    Some(record) if record.expires_at > now => {
                        record.state.count(&config, now, skew_tolerance)
                    }
                    _ => 0,
                };
                ScriptReply::Count(count)
            }
            ScriptCall::Reset { key } => {
                data.records.remove(&key);
                ScriptReply::Reset
            }
            ScriptCall::ResetSubject { subject } => {
                let before = data.records.len();
                data.records.retain(|k, _| k.subject() != subject);
                ScriptReply::Cleared(before - data.records.len())
            }
            ScriptCall::Probe => ScriptReply::Pong,
            ScriptCall::TrackedKeys => {
                let high_water = data.high_water;
                data.records.retain(|_, r| r.expires_at > high_water);
                let mut counts = BTreeMap::new();
                for key in data.records.keys() {
                    *counts.entry(key.tier().to_string()).or_insert(0) += 1;
                }
                ScriptReply::TrackedKeys(counts)
            }
        }
    }
}

/// In-process shard cluster implementing [`ShardBackend`], with knobs to make nodes slow or
/// unreachable. Clones share the same nodes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShardCluster {
    nodes: Arc<RwLock<HashMap<NodeId, Arc<ShardNode>>>>,
}

impl InMemoryShardCluster {
    /// Cluster with the given nodes, all reachable.
    pub fn new<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let cluster = Self::default();
        for node in nodes {
            cluster.add_node(node);
        }
        cluster
    }

    /// Start an empty node (no-op when present).
    pub fn add_node(&self, node: NodeId) {
        let mut map = self.nodes.write().expect("shard cluster poisoned");
        map.entry(node).or_insert_with(|| Arc::new(ShardNode::new()));
    }

    /// Stop a node, discarding everything it held.
    pub fn remove_node(&self, node: &NodeId) {
        self.nodes.write().expect("shard cluster poisoned").remove(node);
    }

    fn node(&self, node: &NodeId) -> Option<Arc<ShardNode>> {
        self.nodes.read().expect("shard cluster poisoned").get(node).cloned()
    }

    /// Make `node` refuse (`false`) or accept (`true`) calls.
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(n) = self.node(node) {
            n.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Make every node refuse or accept calls.
    pub fn set_all_reachable(&self, reachable: bool) {
        for n in self.nodes.read().expect("shard cluster poisoned").values() {
            n.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Delay every call to every node by `latency` before it executes.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        for n in self.nodes.read().expect("shard cluster poisoned").values() {
            n.latency_millis.store(millis, Ordering::SeqCst);
        }
    }

    /// Records held by `node`, expired or not.
    pub fn record_count(&self, node: &NodeId) -> usize {
        self.node(node)
            .map(|n| n.data.lock().expect("shard node poisoned").records.len())
            .unwrap_or(0)
    }

    /// Calls `node` has received, including refused ones.
    pub fn calls(&self, node: &NodeId) -> u64 {
        self.node(node).map(|n| n.calls.load(Ordering::SeqCst)).unwrap_or(0)
    }
}

#[async_trait]
impl ShardBackend for InMemoryShardCluster {
    async fn execute(&self, node: &NodeId, call: ScriptCall) -> Result<ScriptReply, BackendError> {
        let shard = self.node(node).ok_or_else(|| BackendError::Unreachable {
            node: node.clone(),
            reason: "unknown node".into(),
        })?;
        shard.calls.fetch_add(1, Ordering::SeqCst);

        let latency = shard.latency_millis.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !shard.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable {
                node: node.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(shard.run(call))
    }
}
