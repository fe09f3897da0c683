//! The admission engine: tiers, routing, failover and telemetry in one handle.
//!
//! Every remote-scoped tier goes to its shard node while the failover controller reports
//! `remote-healthy`. A failed or timed-out remote call is a failure signal: that tier falls back
//! to the degraded policy for this event, and enough consecutive failures degrade the engine.
//! While degraded or recovering, fail-open engines evaluate against a process-local fallback
//! store and fail-closed engines deny with [`DenyReason::BackendUnavailable`]. Recovery is a hard
//! cutover: the fallback store is discarded when the engine returns to `remote-healthy`.
//!
//! Instance-scoped tiers always use a separate process-local store, in every mode.
//!
//! ```rust
//! use quotaring::{EngineConfig, EventId, InMemoryShardCluster, NodeId, QuotaEngine, Timestamp};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::builder()
//!     .skew_tolerance(Duration::ZERO)
//!     .remote_timeout(Duration::from_millis(50))
//!     .failure_threshold(3)
//!     .observation_interval(Duration::from_secs(10))
//!     .recovery_successes(2)
//!     .build()
//!     .unwrap();
//! let nodes = vec![NodeId::from("shard-0"), NodeId::from("shard-1")];
//! let cluster = InMemoryShardCluster::new(nodes.clone());
//! let engine = QuotaEngine::new(config, Arc::new(cluster), nodes);
//! engine.configure("per_user", 2, Duration::from_secs(60)).unwrap();
//!
//! let now = Timestamp::from_secs(1);
//! let decision = engine.evaluate("alice", "gpt-4", &["per_user"], now, &EventId::generate()).await;
//! assert!(decision.admitted);
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{DegradedPolicy, EngineConfig, TierRegistry, TierScope, WindowConfig};
use crate::decision::{Decision, DenyReason};
use crate::error::{BackendError, ConfigError, QuotaError};
use crate::evaluator::WindowEvaluator;
use crate::failover::{FailoverController, FailoverMode, ModeChange};
use crate::local::LocalEvaluator;
use crate::remote::{RemoteEvaluator, ShardBackend};
use crate::ring::{NodeId, ShardRouter};
use crate::telemetry::{emit_best_effort, NullSink, QuotaEvent, TelemetrySink};
use crate::tiers::{TierRun, TierStep};
use crate::window::{EventId, Timestamp};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Metrics {
    admitted: AtomicU64,
    denied: AtomicU64,
}

impl Metrics {
    fn record(&self, decision: &Decision) {
        if decision.admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.admitted.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
    }
}

/// Decision counters since start or the last [`QuotaEngine::reset_metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub denied: u64,
}

impl MetricsSnapshot {
    pub fn total(&self) -> u64 {
        self.admitted + self.denied
    }

    /// Fraction of decisions that denied, `0.0` when there were none.
    pub fn deny_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.denied as f64 / total as f64,
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub mode: FailoverMode,
    /// Active window keys per tier.
    pub per_tier_counts: BTreeMap<String, usize>,
    pub metrics: MetricsSnapshot,
}

/// Multi-tier sliding-window admission control over a sharded store.
///
/// Clones share all state.
#[derive(Debug, Clone)]
pub struct QuotaEngine<S = NullSink> {
    config: EngineConfig,
    tiers: TierRegistry,
    remote: RemoteEvaluator,
    fallback: LocalEvaluator,
    instance: LocalEvaluator,
    failover: FailoverController,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl QuotaEngine<NullSink> {
    /// Engine over `backend` with `nodes` on the ring and no tiers configured.
    pub fn new<I>(config: EngineConfig, backend: Arc<dyn ShardBackend>, nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let tiers = TierRegistry::new();
        let router = ShardRouter::new(nodes, config.virtual_nodes());
        let remote = RemoteEvaluator::new(
            router,
            backend,
            tiers.clone(),
            config.remote_timeout(),
            config.skew_tolerance(),
            config.record_grace(),
        );
        Self {
            fallback: LocalEvaluator::new(tiers.clone(), config.skew_tolerance()),
            instance: LocalEvaluator::new(tiers.clone(), config.skew_tolerance()),
            failover: FailoverController::new(config.failover().clone()),
            tiers,
            remote,
            metrics: Arc::new(Metrics::default()),
            clock: Arc::new(SystemClock),
            sink: NullSink,
            config,
        }
    }
}

impl<S> QuotaEngine<S> {
    /// Send telemetry to `sink` instead.
    pub fn with_sink<T: TelemetrySink>(self, sink: T) -> QuotaEngine<T> {
        QuotaEngine {
            config: self.config,
            tiers: self.tiers,
            remote: self.remote,
            fallback: self.fallback,
            instance: self.instance,
            failover: self.failover,
            metrics: self.metrics,
            clock: self.clock,
            sink,
        }
    }

    /// Override both the wall clock behind [`QuotaEngine::evaluate_now`] and the failover
    /// controller's clock.
    ///
    /// By default `evaluate_now` reads [`SystemClock`], so processes sharing one remote store
    /// stamp events on a common time line, while failover timing runs on a monotonic clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.failover = self.failover.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared tier registry.
    pub fn tiers(&self) -> &TierRegistry {
        &self.tiers
    }

    pub fn router(&self) -> &ShardRouter {
        self.remote.router()
    }

    pub fn mode(&self) -> FailoverMode {
        self.failover.mode()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register or replace a subject-and-resource tier.
    pub fn configure(&self, tier: &str, max_events: u32, window: Duration) -> Result<(), ConfigError> {
        self.configure_tier(tier, WindowConfig::new(max_events, window)?).map(|_| ())
    }

    /// Register or replace a tier with an explicit scope. Returns the replaced policy.
    pub fn configure_tier(
        &self,
        tier: &str,
        config: WindowConfig,
    ) -> Result<Option<WindowConfig>, ConfigError> {
        let (max_events, window, scope) = (config.max_events(), config.window(), config.scope());
        let previous = self.tiers.configure(tier, config)?;
        tracing::info!(
            tier,
            max_events,
            window_ms = window.as_millis() as u64,
            ?scope,
            replaced = previous.is_some(),
            "tier configured"
        );
        Ok(previous)
    }

    /// Assign `resource` to a class for resource-class tiers.
    pub fn set_resource_class(&self, resource: &str, class: &str) {
        self.tiers.set_resource_class(resource, class);
        tracing::info!(resource, class, "resource class assigned");
    }

    /// Decision counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Reclaim idle keys from the process-local stores. Returns keys reclaimed.
    ///
    /// The fallback store is also swept whenever a recovery probe runs during evaluation.
    pub fn sweep_idle(&self, now: Timestamp) -> usize {
        self.instance.store().sweep_idle(now) + self.fallback.store().sweep_idle(now)
    }
}

impl<S> QuotaEngine<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Admit or deny one event of `subject` on `resource` against `tiers`, in order.
    ///
    /// Never fails: backend trouble is absorbed by failover. Retrying with the same `event` is
    /// safe; a replay returns the original decision without counting twice.
    pub async fn evaluate<T>(
        &self,
        subject: &str,
        resource: &str,
        tiers: &[T],
        now: Timestamp,
        event: &EventId,
    ) -> Decision
    where
        T: AsRef<str> + Sync,
    {
        if self.failover.try_claim_probe() {
            self.run_probe().await;
            let reclaimed = self.fallback.store().sweep_idle(now);
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "swept fallback store");
            }
        }
        let mode = self.failover.mode();

        let mut run = TierRun::plan(&self.tiers.snapshot(), subject, resource, tiers);
        while let Some(step) = run.next_step() {
            let decision = self.evaluate_step(&step, now, event).await;
            if decision.reason == Some(DenyReason::AmbiguousClock) {
                tracing::warn!(subject, resource, tier = %step.tier, now = now.as_millis(), "ambiguous clock");
                self.emit(QuotaEvent::ClockAmbiguous {
                    subject: subject.to_string(),
                    resource: resource.to_string(),
                    tier: step.tier.clone(),
                })
                .await;
            }
            run.record(&step, decision);
        }
        let decision = run.into_decision();

        self.metrics.record(&decision);
        tracing::debug!(
            subject,
            resource,
            admitted = decision.admitted,
            tier = decision.tier.as_deref(),
            %mode,
            "admission decision"
        );
        self.emit(QuotaEvent::Decision {
            subject: subject.to_string(),
            resource: resource.to_string(),
            admitted: decision.admitted,
            tier: decision.tier.clone(),
            reason: decision.reason,
            mode,
        })
        .await;
        decision
    }

    /// [`QuotaEngine::evaluate`] at the engine clock's current time with a fresh event id.
    pub async fn evaluate_now<T>(&self, subject: &str, resource: &str, tiers: &[T]) -> Decision
    where
        T: AsRef<str> + Sync,
    {
        let now = self.clock.now();
        self.evaluate(subject, resource, tiers, now, &EventId::generate()).await
    }

    async fn evaluate_step(&self, step: &TierStep, now: Timestamp, event: &EventId) -> Decision {
        let skew = self.config.skew_tolerance();
        if step.scope() == TierScope::Instance {
            return self.instance.store().evaluate(&step.key, &step.config, now, event, skew);
        }
        if self.failover.uses_remote() {
            match WindowEvaluator::evaluate(&self.remote, &step.key, &step.config, now, event).await {
                Ok(decision) => {
                    self.failover.record_success();
                    return decision;
                }
                Err(err) => self.on_backend_failure(Some(&step.tier), &err).await,
            }
        }
        match self.config.degraded_policy() {
            DegradedPolicy::FailOpen => {
                self.fallback.store().evaluate(&step.key, &step.config, now, event, skew)
            }
            DegradedPolicy::FailClosed => Decision::denied(
                DenyReason::BackendUnavailable,
                Some(self.config.failover().probe_interval()),
            ),
        }
    }

    /// Events currently inside the tier's window for `subject` on `resource`, from the store
    /// the current mode evaluates against.
    pub async fn count(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
    ) -> Result<usize, QuotaError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        let skew = self.config.skew_tolerance();
        if config.scope() == TierScope::Instance {
            return Ok(self.instance.store().count(&key, &config, now, skew));
        }
        if self.failover.uses_remote() {
            return Ok(WindowEvaluator::count(&self.remote, &key, &config, now).await?);
        }
        Ok(self.fallback.store().count(&key, &config, now, skew))
    }

    /// Clear one window in every store that may hold it.
    ///
    /// Local stores are always cleared; a remote failure is returned after that.
    pub async fn reset(&self, subject: &str, resource: &str, tier: &str) -> Result<(), QuotaError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        self.instance.store().reset(&key);
        self.fallback.store().reset(&key);
        if config.scope() != TierScope::Instance {
            WindowEvaluator::reset(&self.remote, &key).await?;
        }
        tracing::info!(subject, resource, tier, "window reset");
        Ok(())
    }

    /// Clear every window keyed by `subject`. Shared resource tiers (subject `*`) are untouched.
    /// Returns windows cleared.
    pub async fn reset_subject(&self, subject: &str) -> Result<usize, QuotaError> {
        let local = self.instance.store().reset_subject(subject)
            + self.fallback.store().reset_subject(subject);
        let remote = self.remote.reset_subject(subject).await?;
        tracing::info!(subject, cleared = local + remote, "subject reset");
        Ok(local + remote)
    }

    /// Mode, active keys per tier, and decision counters.
    ///
    /// Instance keys are always counted. Remote keys are counted while remote-healthy, fallback
    /// keys otherwise; a failed remote count is logged and left out.
    pub async fn status(&self) -> Status {
        let mut per_tier_counts = self.instance.store().tracked_keys();
        let shared = if self.failover.uses_remote() {
            match self.remote.tracked_keys().await {
                Ok(remote) => remote,
                Err(err) => {
                    tracing::warn!(error = %err, "remote key count unavailable");
                    BTreeMap::new()
                }
            }
        } else {
            self.fallback.store().tracked_keys()
        };
        for (tier, n) in shared {
            *per_tier_counts.entry(tier).or_insert(0) += n;
        }
        Status { mode: self.failover.mode(), per_tier_counts, metrics: self.metrics.snapshot() }
    }

    /// Probe every ring node now, regardless of probe pacing, and feed the result to failover.
    pub async fn probe(&self) -> Result<(), BackendError> {
        let result = self.remote.probe().await;
        self.apply_probe(&result).await;
        result
    }

    async fn run_probe(&self) {
        let result = self.remote.probe().await;
        self.apply_probe(&result).await;
    }

    async fn apply_probe(&self, result: &Result<(), BackendError>) {
        if let Err(err) = result {
            self.emit(QuotaEvent::BackendFailure {
                tier: None,
                timeout: err.is_timeout(),
                error: err.to_string(),
            })
            .await;
        }
        for change in self.failover.record_probe(result.is_ok()) {
            self.on_mode_change(change).await;
        }
    }

    /// Add a shard node to the ring. Returns `false` when already present.
    ///
    /// Only routing changes; the backend must already accept calls for `node`.
    pub async fn add_node(&self, node: NodeId) -> bool {
        let added = self.router().add_node(node.clone());
        if added {
            let node_count = self.router().snapshot().node_count();
            self.emit(QuotaEvent::TopologyChanged { node, joined: true, node_count }).await;
        }
        added
    }

    /// Remove a shard node from the ring. Returns `false` when absent.
    pub async fn remove_node(&self, node: &NodeId) -> bool {
        let removed = self.router().remove_node(node);
        if removed {
            let node_count = self.router().snapshot().node_count();
            self.emit(QuotaEvent::TopologyChanged { node: node.clone(), joined: false, node_count })
                .await;
        }
        removed
    }

    async fn on_backend_failure(&self, tier: Option<&str>, err: &BackendError) {
        self.emit(QuotaEvent::BackendFailure {
            tier: tier.map(str::to_string),
            timeout: err.is_timeout(),
            error: err.to_string(),
        })
        .await;
        if let Some(change) = self.failover.record_failure() {
            self.on_mode_change(change).await;
        }
    }

    async fn on_mode_change(&self, change: ModeChange) {
        if change.from == FailoverMode::Recovering && change.to == FailoverMode::RemoteHealthy {
            let discarded = self.fallback.store().len();
            self.fallback.store().clear();
            tracing::info!(discarded, "fallback windows discarded on return to remote");
        }
        self.emit(QuotaEvent::ModeChanged { from: change.from, to: change.to }).await;
    }

    async fn emit(&self, event: QuotaEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key::WindowKey;
    use crate::remote::InMemoryShardCluster;
    use crate::telemetry::MemorySink;

    fn config(policy: DegradedPolicy) -> EngineConfig {
        EngineConfig::builder()
            .skew_tolerance(Duration::ZERO)
            .remote_timeout(Duration::from_millis(100))
            .failure_threshold(2)
            .observation_interval(Duration::from_secs(10))
            .recovery_successes(2)
            .probe_interval(Duration::from_secs(1))
            .degraded_policy(policy)
            .build()
            .unwrap()
    }

    fn engine(policy: DegradedPolicy) -> (QuotaEngine<MemorySink>, InMemoryShardCluster, ManualClock, MemorySink) {
        let nodes: Vec<NodeId> = (0..3).map(|i| NodeId::from(format!("shard-{i}"))).collect();
        let cluster = InMemoryShardCluster::new(nodes.clone());
        let clock = ManualClock::default();
        let sink = MemorySink::new();
        let engine = QuotaEngine::new(config(policy), Arc::new(cluster.clone()), nodes)
            .with_clock(Arc::new(clock.clone()))
            .with_sink(sink.clone());
        engine.configure("per_user", 2, Duration::from_secs(60)).unwrap();
        (engine, cluster, clock, sink)
    }

    #[tokio::test]
    async fn fail_closed_denies_while_degraded() {
        let (engine, cluster, _, _) = engine(DegradedPolicy::FailClosed);
        cluster.set_all_reachable(false);
        let t = Timestamp::from_secs(1);
        for _ in 0..2 {
            let d = engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
            assert_eq!(d.reason, Some(DenyReason::BackendUnavailable));
        }
        assert_eq!(engine.mode(), FailoverMode::DegradedLocal);

        let d = engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        assert!(!d.admitted);
        assert_eq!(d.tier.as_deref(), Some("per_user"));
        assert_eq!(d.retry_after, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn inline_probe_recovers_and_discards_fallback() {
        let (engine, cluster, clock, sink) = engine(DegradedPolicy::FailOpen);
        cluster.set_all_reachable(false);
        let t = Timestamp::from_secs(1);
        for _ in 0..3 {
            engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        }
        assert_eq!(engine.mode(), FailoverMode::DegradedLocal);
        assert_eq!(engine.count("alice", "gpt-4", "per_user", t).await.unwrap(), 2);

        cluster.set_all_reachable(true);
        clock.advance(1_000);
        engine.evaluate("bob", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        assert_eq!(engine.mode(), FailoverMode::Recovering);
        clock.advance(1_000);
        engine.evaluate("bob", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        assert_eq!(engine.mode(), FailoverMode::RemoteHealthy);

        // Hard cutover: the remote store never saw the degraded-mode events.
        assert_eq!(engine.count("alice", "gpt-4", "per_user", t).await.unwrap(), 0);
        assert_eq!(engine.fallback.store().len(), 0);

        let modes: Vec<(FailoverMode, FailoverMode)> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                QuotaEvent::ModeChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            modes,
            vec![
                (FailoverMode::RemoteHealthy, FailoverMode::DegradedLocal),
                (FailoverMode::DegradedLocal, FailoverMode::Recovering),
                (FailoverMode::Recovering, FailoverMode::RemoteHealthy),
            ]
        );
    }

    #[tokio::test]
    async fn instance_tiers_stay_local() {
        let (engine, cluster, _, _) = engine(DegradedPolicy::FailOpen);
        engine
            .configure_tier(
                "burst",
                WindowConfig::new(1, Duration::from_secs(1)).unwrap().with_scope(TierScope::Instance),
            )
            .unwrap();
        let t = Timestamp::from_secs(1);
        assert!(engine.evaluate("alice", "gpt-4", &["burst"], t, &EventId::generate()).await.admitted);
        let d = engine.evaluate("alice", "gpt-4", &["burst"], t, &EventId::generate()).await;
        assert_eq!(d.tier.as_deref(), Some("burst"));
        for i in 0..3 {
            assert_eq!(cluster.calls(&NodeId::from(format!("shard-{i}"))), 0);
        }
    }

    #[tokio::test]
    async fn metrics_and_status() {
        let (engine, _, _, _) = engine(DegradedPolicy::FailOpen);
        let t = Timestamp::from_secs(1);
        for _ in 0..4 {
            engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        }
        let status = engine.status().await;
        assert_eq!(status.mode, FailoverMode::RemoteHealthy);
        assert_eq!(status.per_tier_counts.get("per_user"), Some(&1));
        assert_eq!(status.metrics, MetricsSnapshot { admitted: 2, denied: 2 });
        assert!((status.metrics.deny_rate() - 0.5).abs() < f64::EPSILON);

        engine.reset_metrics();
        assert_eq!(engine.metrics().total(), 0);
    }

    #[tokio::test]
    async fn reset_subject_clears_remote_and_local() {
        let (engine, _, _, _) = engine(DegradedPolicy::FailOpen);
        let t = Timestamp::from_secs(1);
        for resource in ["a", "b", "c"] {
            engine.evaluate("alice", resource, &["per_user"], t, &EventId::generate()).await;
        }
        assert_eq!(engine.reset_subject("alice").await.unwrap(), 3);
        assert_eq!(engine.count("alice", "a", "per_user", t).await.unwrap(), 0);
    }

    fn burst() -> WindowConfig {
        WindowConfig::new(1, Duration::from_secs(1)).unwrap().with_scope(TierScope::Instance)
    }

    #[tokio::test]
    async fn reset_clears_remote_and_instance_windows() {
        let (engine, cluster, _, _) = engine(DegradedPolicy::FailOpen);
        engine.configure_tier("burst", burst()).unwrap();
        let t = Timestamp::from_secs(1);
        for _ in 0..2 {
            engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        }
        engine.evaluate("alice", "gpt-4", &["burst"], t, &EventId::generate()).await;
        let key = WindowKey::new("alice", "gpt-4", "per_user");
        let owner = engine.router().route(&key.storage_key()).unwrap();
        assert_eq!(cluster.record_count(&owner), 1);

        engine.reset("alice", "gpt-4", "per_user").await.unwrap();
        engine.reset("alice", "gpt-4", "burst").await.unwrap();
        assert_eq!(cluster.record_count(&owner), 0);
        assert_eq!(engine.count("alice", "gpt-4", "burst", t).await.unwrap(), 0);
        let d = engine.evaluate("alice", "gpt-4", &["per_user", "burst"], t, &EventId::generate()).await;
        assert!(d.admitted);
    }

    #[tokio::test]
    async fn reset_clears_local_state_before_reporting_remote_failure() {
        let (engine, cluster, _, _) = engine(DegradedPolicy::FailOpen);
        cluster.set_all_reachable(false);
        let t = Timestamp::from_secs(1);
        for _ in 0..3 {
            engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        }
        assert_eq!(engine.mode(), FailoverMode::DegradedLocal);
        assert_eq!(engine.count("alice", "gpt-4", "per_user", t).await.unwrap(), 2);

        let err = engine.reset("alice", "gpt-4", "per_user").await.unwrap_err();
        assert!(err.is_backend());
        assert_eq!(engine.count("alice", "gpt-4", "per_user", t).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_idle_reclaims_instance_windows() {
        let (engine, _, _, _) = engine(DegradedPolicy::FailOpen);
        engine.configure_tier("burst", burst()).unwrap();
        engine.evaluate("alice", "gpt-4", &["burst"], Timestamp::from_millis(1_000), &EventId::generate()).await;
        assert_eq!(engine.sweep_idle(Timestamp::from_millis(1_500)), 0);
        assert_eq!(engine.sweep_idle(Timestamp::from_millis(2_001)), 1);
        assert!(engine.status().await.per_tier_counts.get("burst").is_none());
    }

    #[tokio::test]
    async fn recovery_checks_sweep_idle_fallback_windows() {
        let (engine, cluster, clock, _) = engine(DegradedPolicy::FailOpen);
        cluster.set_all_reachable(false);
        for _ in 0..3 {
            engine.evaluate("alice", "gpt-4", &["per_user"], Timestamp::from_secs(1), &EventId::generate()).await;
        }
        assert_eq!(engine.fallback.store().len(), 1);

        clock.advance(1_000);
        engine.evaluate("bob", "gpt-4", &["per_user"], Timestamp::from_secs(200), &EventId::generate()).await;
        assert_eq!(engine.mode(), FailoverMode::DegradedLocal);
        assert_eq!(engine.fallback.store().len(), 1);
        assert_eq!(engine.count("alice", "gpt-4", "per_user", Timestamp::from_secs(200)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_does_not_count_fallback_keys_while_remote_healthy() {
        let (engine, cluster, _, _) = engine(DegradedPolicy::FailOpen);
        let t = Timestamp::from_secs(1);
        // One failure below the threshold puts alice in the fallback store only.
        cluster.set_all_reachable(false);
        engine.evaluate("alice", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        cluster.set_all_reachable(true);
        engine.evaluate("bob", "gpt-4", &["per_user"], t, &EventId::generate()).await;
        assert_eq!(engine.mode(), FailoverMode::RemoteHealthy);
        assert_eq!(engine.fallback.store().len(), 1);

        let status = engine.status().await;
        assert_eq!(status.per_tier_counts.get("per_user"), Some(&1));
    }

    #[tokio::test]
    async fn engines_sharing_a_cluster_agree_on_time_by_default() {
        let nodes = vec![NodeId::from("shard-0"), NodeId::from("shard-1")];
        let cluster = InMemoryShardCluster::new(nodes.clone());
        let make = || {
            let engine = QuotaEngine::new(
                config(DegradedPolicy::FailOpen),
                Arc::new(cluster.clone()),
                nodes.clone(),
            );
            engine.configure("per_user", 2, Duration::from_secs(60)).unwrap();
            engine
        };
        let a = make();
        let b = make();
        assert!(a.clock().now() > Timestamp::from_secs(1_600_000_000));

        assert!(a.evaluate_now("alice", "gpt-4", &["per_user"]).await.admitted);
        let d = b.evaluate_now("alice", "gpt-4", &["per_user"]).await;
        assert!(d.admitted, "second process was denied: {d:?}");
        let d = b.evaluate_now("alice", "gpt-4", &["per_user"]).await;
        assert_eq!(d.reason, Some(DenyReason::QuotaExceeded));
    }

    #[tokio::test]
    async fn unknown_tier_in_admin_calls_is_a_config_error() {
        let (engine, _, _, _) = engine(DegradedPolicy::FailOpen);
        let err = engine.reset("alice", "gpt-4", "nope").await.unwrap_err();
        assert!(matches!(err, QuotaError::Config(ConfigError::UnknownTier { .. })));
    }
}
