//! Tier policies and engine configuration.
//!
//! Tier policies are immutable values; `configure` swaps a new tier table in atomically, so an
//! evaluation sees either the old policy or the new one for a tier, never a mix.

use crate::adaptive::DynamicConfig;
use crate::error::ConfigError;
use crate::key::{WindowKey, ANY_SUBJECT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Resource class used when a resource has no explicit class.
pub const DEFAULT_RESOURCE_CLASS: &str = "standard";

/// How a tier forms its key from the event's subject and resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierScope {
    /// One window per (subject, resource).
    #[default]
    SubjectResource,
    /// One window per resource, shared by all subjects.
    Resource,
    /// One window per resource class, shared by all subjects and resources of the class.
    ResourceClass,
    /// One window per (subject, resource), enforced by this process only, in every mode.
    Instance,
}

/// Validated quota for one tier: at most `max_events` per sliding `window`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    max_events: u32,
    window: Duration,
    #[serde(default)]
    scope: TierScope,
}

impl WindowConfig {
    /// Create a config with validation. `max_events == 0` is valid and always denies.
    pub fn new(max_events: u32, window: Duration) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::InvalidWindow { window });
        }
        Ok(Self { max_events, window, scope: TierScope::default() })
    }

    /// Same quota with a different key scope.
    pub fn with_scope(mut self, scope: TierScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn scope(&self) -> TierScope {
        self.scope
    }
}

/// Immutable snapshot of all tier policies and resource classes.
#[derive(Debug, Clone, Default)]
pub struct TierTable {
    tiers: HashMap<String, WindowConfig>,
    classes: HashMap<String, String>,
}

impl TierTable {
    /// Policy for `tier`.
    pub fn get(&self, tier: &str) -> Option<&WindowConfig> {
        self.tiers.get(tier)
    }

    /// Class of `resource`, [`DEFAULT_RESOURCE_CLASS`] when unassigned.
    pub fn class_of(&self, resource: &str) -> &str {
        self.classes.get(resource).map(String::as_str).unwrap_or(DEFAULT_RESOURCE_CLASS)
    }

    /// Registered tier names, sorted.
    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tiers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the key and policy `tier` applies to an event of `subject` on `resource`.
    pub fn resolve(
        &self,
        tier: &str,
        subject: &str,
        resource: &str,
    ) -> Result<(WindowKey, WindowConfig), ConfigError> {
        let config =
            self.tiers.get(tier).ok_or_else(|| ConfigError::UnknownTier { tier: tier.into() })?;
        let key = match config.scope() {
            TierScope::SubjectResource | TierScope::Instance => {
                WindowKey::new(subject, resource, tier)
            }
            TierScope::Resource => WindowKey::new(ANY_SUBJECT, resource, tier),
            TierScope::ResourceClass => {
                WindowKey::new(ANY_SUBJECT, self.class_of(resource), tier)
            }
        };
        Ok((key, config.clone()))
    }
}

/// Shared, atomically replaced tier table.
#[derive(Debug, Clone)]
pub struct TierRegistry {
    table: DynamicConfig<TierTable>,
}

impl Default for TierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TierRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { table: DynamicConfig::new(TierTable::default()) }
    }

    /// Register or replace a tier. Returns the policy it replaced, if any.
    pub fn configure(
        &self,
        tier: &str,
        config: WindowConfig,
    ) -> Result<Option<WindowConfig>, ConfigError> {
        if tier.is_empty() {
            return Err(ConfigError::EmptyTierName);
        }
        let previous = self.table.update(|table| {
            let mut next = table.clone();
            next.tiers.insert(tier.to_string(), config.clone());
            next
        });
        Ok(previous.tiers.get(tier).cloned())
    }

    /// Assign `resource` to a class used by [`TierScope::ResourceClass`] tiers.
    pub fn set_resource_class(&self, resource: &str, class: &str) {
        self.table.update(|table| {
            let mut next = table.clone();
            next.classes.insert(resource.to_string(), class.to_string());
            next
        });
    }

    /// Current policy of `tier`.
    pub fn get(&self, tier: &str) -> Option<WindowConfig> {
        self.table.get().get(tier).cloned()
    }

    /// Consistent snapshot of every tier.
    pub fn snapshot(&self) -> Arc<TierTable> {
        self.table.get()
    }
}

/// What to do with evaluations while the remote store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Enforce quotas against this process's local state (approximate; may under-count usage
    /// from other processes for the length of the outage).
    #[default]
    FailOpen,
    /// Deny every event that needs the remote store.
    FailClosed,
}

/// Failover controller thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverConfig {
    failure_threshold: usize,
    observation_interval: Duration,
    recovery_successes: usize,
    probe_interval: Duration,
}

impl FailoverConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        observation_interval: Duration,
        recovery_successes: usize,
        probe_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold { setting: "failure_threshold" });
        }
        if recovery_successes == 0 {
            return Err(ConfigError::ZeroThreshold { setting: "recovery_successes" });
        }
        if observation_interval.is_zero() {
            return Err(ConfigError::ZeroThreshold { setting: "observation_interval" });
        }
        Ok(Self { failure_threshold, observation_interval, recovery_successes, probe_interval })
    }

    /// Consecutive failures that degrade the engine.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Window the consecutive failures must fall within.
    pub fn observation_interval(&self) -> Duration {
        self.observation_interval
    }

    /// Consecutive successful probes needed to return to remote evaluation.
    pub fn recovery_successes(&self) -> usize {
        self.recovery_successes
    }

    /// Minimum spacing between recovery probes.
    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }
}

/// Validated engine configuration. Build with [`EngineConfig::builder`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    skew_tolerance: Duration,
    remote_timeout: Duration,
    failover: FailoverConfig,
    virtual_nodes: u32,
    degraded_policy: DegradedPolicy,
    record_grace: Duration,
}

impl EngineConfig {
    /// Construct a new builder. Skew tolerance, remote timeout and the failover thresholds have
    /// no defaults and must be set.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn skew_tolerance(&self) -> Duration {
        self.skew_tolerance
    }

    pub fn remote_timeout(&self) -> Duration {
        self.remote_timeout
    }

    pub fn failover(&self) -> &FailoverConfig {
        &self.failover
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    pub fn degraded_policy(&self) -> DegradedPolicy {
        self.degraded_policy
    }

    /// Extra lifetime given to remote records beyond their tier window.
    pub fn record_grace(&self) -> Duration {
        self.record_grace
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    skew_tolerance: Option<Duration>,
    remote_timeout: Option<Duration>,
    failure_threshold: Option<usize>,
    observation_interval: Option<Duration>,
    recovery_successes: Option<usize>,
    probe_interval: Duration,
    virtual_nodes: u32,
    degraded_policy: DegradedPolicy,
    record_grace: Duration,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            skew_tolerance: None,
            remote_timeout: None,
            failure_threshold: None,
            observation_interval: None,
            recovery_successes: None,
            probe_interval: Duration::from_secs(1),
            virtual_nodes: 128,
            degraded_policy: DegradedPolicy::FailOpen,
            record_grace: Duration::from_secs(60),
        }
    }
}

impl EngineConfigBuilder {
    /// Boundary ambiguity allowed between caller clocks and recorded history.
    pub fn skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.skew_tolerance = Some(tolerance);
        self
    }

    /// Deadline for each remote call.
    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    /// Consecutive remote failures that switch to local evaluation.
    pub fn failure_threshold(mut self, failures: usize) -> Self {
        self.failure_threshold = Some(failures);
        self
    }

    /// Interval within which the consecutive failures must occur.
    pub fn observation_interval(mut self, interval: Duration) -> Self {
        self.observation_interval = Some(interval);
        self
    }

    /// Consecutive successful probes required to return to remote evaluation.
    pub fn recovery_successes(mut self, successes: usize) -> Self {
        self.recovery_successes = Some(successes);
        self
    }

    /// Minimum spacing between inline recovery probes.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Ring positions per shard node.
    pub fn virtual_nodes(mut self, positions: u32) -> Self {
        self.virtual_nodes = positions;
        self
    }

    /// Fail open (local fallback) or fail closed while degraded.
    pub fn degraded_policy(mut self, policy: DegradedPolicy) -> Self {
        self.degraded_policy = policy;
        self
    }

    /// Remote record lifetime beyond the tier window.
    pub fn record_grace(mut self, grace: Duration) -> Self {
        self.record_grace = grace;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let skew_tolerance =
            self.skew_tolerance.ok_or(ConfigError::MissingSetting { setting: "skew_tolerance" })?;
        let remote_timeout =
            self.remote_timeout.ok_or(ConfigError::MissingSetting { setting: "remote_timeout" })?;
        if remote_timeout.is_zero() {
            return Err(ConfigError::ZeroThreshold { setting: "remote_timeout" });
        }
        if remote_timeout == Duration::MAX {
            return Err(ConfigError::UnboundedDuration { setting: "remote_timeout" });
        }
        let failure_threshold = self
            .failure_threshold
            .ok_or(ConfigError::MissingSetting { setting: "failure_threshold" })?;
        let observation_interval = self
            .observation_interval
            .ok_or(ConfigError::MissingSetting { setting: "observation_interval" })?;
        let recovery_successes = self
            .recovery_successes
            .ok_or(ConfigError::MissingSetting { setting: "recovery_successes" })?;
        if self.virtual_nodes == 0 {
            return Err(ConfigError::ZeroThreshold { setting: "virtual_nodes" });
        }
        let failover = FailoverConfig::new(
            failure_threshold,
            observation_interval,
            recovery_successes,
            self.probe_interval,
        )?;
        Ok(EngineConfig {
            skew_tolerance,
            remote_timeout,
            failover,
            virtual_nodes: self.virtual_nodes,
            degraded_policy: self.degraded_policy,
            record_grace: self.record_grace,
        })
    }
}
