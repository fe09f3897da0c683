//! Remote-store health tracking with lock-free atomics.
//!
//! ```text
//! RemoteHealthy --N consecutive failures within the observation interval--> DegradedLocal
//! DegradedLocal --successful probe--> Recovering
//! Recovering    --failed probe--> DegradedLocal
//! Recovering    --M consecutive successful probes--> RemoteHealthy
//! ```
//!
//! The first successful probe counts toward `M`. Mode changes are single compare-exchange
//! transitions, so concurrent callers observing the same failure streak produce exactly one
//! [`ModeChange`].

use crate::clock::{Clock, MonotonicClock};
use crate::config::FailoverConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const MODE_REMOTE_HEALTHY: u8 = 0;
const MODE_DEGRADED_LOCAL: u8 = 1;
const MODE_RECOVERING: u8 = 2;

/// Where evaluations are currently served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverMode {
    /// The shard cluster serves every remote-scoped tier.
    RemoteHealthy,
    /// The remote store is considered down; evaluations follow the degraded policy.
    DegradedLocal,
    /// Probes are succeeding; still serving locally until enough of them have.
    Recovering,
}

impl FailoverMode {
    fn to_u8(self) -> u8 {
        match self {
            FailoverMode::RemoteHealthy => MODE_REMOTE_HEALTHY,
            FailoverMode::DegradedLocal => MODE_DEGRADED_LOCAL,
            FailoverMode::Recovering => MODE_RECOVERING,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            MODE_DEGRADED_LOCAL => FailoverMode::DegradedLocal,
            MODE_RECOVERING => FailoverMode::Recovering,
            _ => FailoverMode::RemoteHealthy,
        }
    }

    /// Stable lowercase name, e.g. `"degraded-local"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverMode::RemoteHealthy => "remote-healthy",
            FailoverMode::DegradedLocal => "degraded-local",
            FailoverMode::Recovering => "recovering",
        }
    }
}

impl fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition performed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub from: FailoverMode,
    pub to: FailoverMode,
}

#[derive(Debug)]
struct FailoverState {
    mode: AtomicU8,
    consecutive_failures: AtomicUsize,
    streak_started_at: AtomicU64,
    consecutive_probe_successes: AtomicUsize,
    next_probe_at: AtomicU64,
}

/// Tracks remote health and decides when to degrade and when to return.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct FailoverController {
    state: Arc<FailoverState>,
    config: FailoverConfig,
    clock: Arc<dyn Clock>,
}

impl FailoverController {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            state: Arc::new(FailoverState {
                mode: AtomicU8::new(MODE_REMOTE_HEALTHY),
                consecutive_failures: AtomicUsize::new(0),
                streak_started_at: AtomicU64::new(0),
                consecutive_probe_successes: AtomicUsize::new(0),
                next_probe_at: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock measuring the observation interval and probe spacing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> FailoverMode {
        FailoverMode::from_u8(self.state.mode.load(Ordering::Acquire))
    }

    /// True while remote-scoped tiers should go to the shard cluster.
    pub fn uses_remote(&self) -> bool {
        self.mode() == FailoverMode::RemoteHealthy
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Consecutive failures in the current streak.
    pub fn consecutive_failures(&self) -> usize {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }

    /// A remote call completed; only consecutive failures degrade the engine.
    pub fn record_success(&self) {
        if self.mode() == FailoverMode::RemoteHealthy {
            self.state.consecutive_failures.store(0, Ordering::Release);
        }
    }

    /// A remote call failed or timed out.
    ///
    /// A failure arriving more than one observation interval after the streak started begins a
    /// new streak.
    pub fn record_failure(&self) -> Option<ModeChange> {
        if self.mode() != FailoverMode::RemoteHealthy {
            return None;
        }
        let now = self.clock.now_millis();
        let interval = self.observation_interval_millis();
        let started = self.state.streak_started_at.load(Ordering::Acquire);
        let current = self.state.consecutive_failures.load(Ordering::Acquire);
        let failures = if current == 0 || now.saturating_sub(started) > interval {
            match self.state.consecutive_failures.compare_exchange(
                current,
                1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.state.streak_started_at.store(now, Ordering::Release);
                    1
                }
                Err(_) => self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1,
            }
        } else {
            self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
        };

        if failures < self.config.failure_threshold() {
            tracing::debug!(failures, threshold = self.config.failure_threshold(), "remote failure");
            return None;
        }
        let change = self.transition(FailoverMode::RemoteHealthy, FailoverMode::DegradedLocal)?;
        self.state.consecutive_probe_successes.store(0, Ordering::Release);
        self.state
            .next_probe_at
            .store(now.saturating_add(self.probe_interval_millis()), Ordering::Release);
        tracing::error!(
            failures,
            threshold = self.config.failure_threshold(),
            "remote store → degraded-local"
        );
        Some(change)
    }

    /// Claim the next probe slot. At most one caller succeeds per probe interval, and only
    /// while degraded or recovering.
    pub fn try_claim_probe(&self) -> bool {
        if self.uses_remote() {
            return false;
        }
        let now = self.clock.now_millis();
        let due = self.state.next_probe_at.load(Ordering::Acquire);
        if now < due {
            return false;
        }
        self.state
            .next_probe_at
            .compare_exchange(
                due,
                now.saturating_add(self.probe_interval_millis()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Feed a probe outcome. Outside degraded/recovering, probes count as ordinary calls.
    pub fn record_probe(&self, ok: bool) -> Vec<ModeChange> {
        let mut changes = Vec::new();
        match (self.mode(), ok) {
            (FailoverMode::RemoteHealthy, true) => self.record_success(),
            (FailoverMode::RemoteHealthy, false) => changes.extend(self.record_failure()),
            (FailoverMode::DegradedLocal, true) => {
                if let Some(change) =
                    self.transition(FailoverMode::DegradedLocal, FailoverMode::Recovering)
                {
                    self.state.consecutive_probe_successes.store(1, Ordering::Release);
                    tracing::info!("remote store → recovering");
                    changes.push(change);
                    changes.extend(self.maybe_recover(1));
                }
            }
            (FailoverMode::DegradedLocal, false) => {
                tracing::debug!("recovery probe failed; staying degraded");
            }
            (FailoverMode::Recovering, true) => {
                let successes =
                    self.state.consecutive_probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
                changes.extend(self.maybe_recover(successes));
            }
            (FailoverMode::Recovering, false) => {
                if let Some(change) =
                    self.transition(FailoverMode::Recovering, FailoverMode::DegradedLocal)
                {
                    self.state.consecutive_probe_successes.store(0, Ordering::Release);
                    tracing::warn!("recovery probe failed → degraded-local");
                    changes.push(change);
                }
            }
        }
        changes
    }

    fn maybe_recover(&self, successes: usize) -> Option<ModeChange> {
        if successes < self.config.recovery_successes() {
            tracing::debug!(successes, needed = self.config.recovery_successes(), "probe ok");
            return None;
        }
        let change = self.transition(FailoverMode::Recovering, FailoverMode::RemoteHealthy)?;
        self.clear_counters();
        tracing::info!(successes, "remote store → remote-healthy");
        Some(change)
    }

    fn transition(&self, from: FailoverMode, to: FailoverMode) -> Option<ModeChange> {
        self.state
            .mode
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ModeChange { from, to })
    }

    fn clear_counters(&self) {
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.streak_started_at.store(0, Ordering::Release);
        self.state.consecutive_probe_successes.store(0, Ordering::Release);
        self.state.next_probe_at.store(0, Ordering::Release);
    }

    fn observation_interval_millis(&self) -> u64 {
        u64::try_from(self.config.observation_interval().as_millis()).unwrap_or(u64::MAX)
    }

    fn probe_interval_millis(&self) -> u64 {
        u64::try_from(self.config.probe_interval().as_millis()).unwrap_or(u64::MAX)
    }
}
