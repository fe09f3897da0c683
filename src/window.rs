//! Sliding-window accounting: the one algorithm every evaluator runs.
//!
//! Semantics of [`WindowState::evaluate`], in this order and with no exceptions:
//! 1. Purge every timestamp older than `now - window - skew_tolerance`.
//! 2. Count what remains.
//! 3. Append `now` and admit if the count is below `max_events`; otherwise deny with
//!    `retry_after = oldest + window + skew_tolerance - now`.
//!
//! Invariants:
//! - Recorded timestamps are non-decreasing.
//! - After any call, the window holds at most `max_events` timestamps.
//! - A replayed event id returns its original decision and never appends twice.
//!
//! The skew tolerance widens the window on both ends: timestamps close to the boundary stay
//! counted (ambiguity resolves toward denial), and a `now` that runs behind recorded history by
//! more than the tolerance is denied as [`DenyReason::AmbiguousClock`]. A zero tolerance gives the
//! plain sliding-window log.

use crate::config::WindowConfig;
use crate::decision::{Decision, DenyReason};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Cap on remembered denied event ids per key; the oldest are forgotten first.
pub const MAX_REMEMBERED_DENIALS: usize = 256;

/// Point in time, in milliseconds, as supplied by the caller's trusted clock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Timestamp from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Timestamp from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Milliseconds represented by this timestamp.
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// `self + d`, saturating.
    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(d)))
    }

    /// `self - d`, saturating at zero.
    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(d)))
    }

    /// Time elapsed from `earlier` to `self`; zero when `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Caller-generated identity of one logical event. Retries must reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    at: Timestamp,
    event: EventId,
}

#[derive(Debug, Clone)]
struct Denial {
    at: Timestamp,
    event: EventId,
    decision: Decision,
}

/// Per-key window: admitted events still inside the window, plus recently denied event ids so
/// replays of a denial stay denied.
#[derive(Debug, Clone, Default)]
pub struct WindowState {
    entries: VecDeque<Entry>,
    admitted_ids: HashSet<EventId>,
    denials: VecDeque<Denial>,
    last_activity: Timestamp,
}

impl WindowState {
    /// Empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one admission decision for `event` at `now`.
    pub fn evaluate(
        &mut self,
        config: &WindowConfig,
        now: Timestamp,
        event: &EventId,
        skew_tolerance: Duration,
    ) -> Decision {
        self.purge(config.window(), now, skew_tolerance);
        self.last_activity = self.last_activity.max(now);

        if let Some(previous) = self.replay(event) {
            tracing::debug!(event = %event, "replayed event; returning original decision");
            return previous;
        }

        let newest = self.entries.back().map(|e| e.at);
        if let Some(newest) = newest {
            if now.saturating_add(skew_tolerance) < newest {
                let decision = Decision::denied(
                    DenyReason::AmbiguousClock,
                    Some(newest.duration_since(now)),
                );
                self.remember_denial(now, event, &decision);
                return decision;
            }
        }

        if config.max_events() == 0 {
            let decision = Decision::denied(DenyReason::QuotaExceeded, Some(config.window()));
            self.remember_denial(now, event, &decision);
            return decision;
        }

        if self.entries.len() < config.max_events() as usize {
            // Clamp to the newest entry so a slightly-behind caller keeps the log ordered.
            let at = newest.map_or(now, |n| n.max(now));
            self.entries.push_back(Entry { at, event: event.clone() });
            self.admitted_ids.insert(event.clone());
            return Decision::admitted();
        }

        let decision =
            Decision::denied(DenyReason::QuotaExceeded, Some(self.retry_after(config, now, skew_tolerance)));
        self.remember_denial(now, event, &decision);
        decision
    }

    /// Purge, then count, without recording anything.
    pub fn count(&mut self, config: &WindowConfig, now: Timestamp, skew_tolerance: Duration) -> usize {
        self.purge(config.window(), now, skew_tolerance);
        self.entries.len()
    }

    /// Drop every recorded event and remembered denial.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.admitted_ids.clear();
        self.denials.clear();
    }

    /// Number of admitted events currently held (no purge).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no admitted event is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest admitted timestamp held.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.at)
    }

    /// Newest admitted timestamp held.
    pub fn newest(&self) -> Option<Timestamp> {
        self.entries.back().map(|e| e.at)
    }

    /// Whether this window carries nothing worth keeping at `now`: every entry has expired under
    /// the same skew tolerance evaluations use, and the key has seen no activity for a full
    /// window plus that tolerance.
    pub fn is_reclaimable(&mut self, window: Duration, skew_tolerance: Duration, now: Timestamp) -> bool {
        self.purge(window, now, skew_tolerance);
        self.entries.is_empty()
            && now.duration_since(self.last_activity) >= window.saturating_add(skew_tolerance)
    }

    fn purge(&mut self, window: Duration, now: Timestamp, skew_tolerance: Duration) {
        let boundary = now.saturating_sub(window).saturating_sub(skew_tolerance);
        while let Some(front) = self.entries.front() {
            if front.at < boundary {
                if let Some(expired) = self.entries.pop_front() {
                    self.admitted_ids.remove(&expired.event);
                }
            } else {
                break;
            }
        }
        while self.denials.front().is_some_and(|d| d.at < boundary) {
            self.denials.pop_front();
        }
    }

    fn replay(&self, event: &EventId) -> Option<Decision> {
        if self.admitted_ids.contains(event) {
            return Some(Decision::admitted());
        }
        self.denials.iter().find(|d| &d.event == event).map(|d| d.decision.clone())
    }

    fn remember_denial(&mut self, now: Timestamp, event: &EventId, decision: &Decision) {
        if self.denials.len() >= MAX_REMEMBERED_DENIALS {
            self.denials.pop_front();
        }
        self.denials.push_back(Denial { at: now, event: event.clone(), decision: decision.clone() });
    }

    fn retry_after(&self, config: &WindowConfig, now: Timestamp, skew_tolerance: Duration) -> Duration {
        match self.oldest() {
            Some(oldest) => {
                let frees_at = oldest.saturating_add(config.window()).saturating_add(skew_tolerance);
                // The boundary itself is still inside the window, so never hint "retry now".
                frees_at.duration_since(now).max(Duration::from_millis(1))
            }
            None => config.window(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max: u32, window_ms: u64) -> WindowConfig {
        WindowConfig::new(max, Duration::from_millis(window_ms)).expect("valid config")
    }

    fn eval(state: &mut WindowState, config: &WindowConfig, at_ms: u64) -> Decision {
        state.evaluate(config, Timestamp::from_millis(at_ms), &EventId::generate(), Duration::ZERO)
    }

    #[test]
    fn expired_events_free_capacity() {
        let config = cfg(2, 60_000);
        let mut state = WindowState::new();
        assert!(eval(&mut state, &config, 0).admitted);
        assert!(eval(&mut state, &config, 10_000).admitted);

        let denied = eval(&mut state, &config, 30_000);
        assert!(!denied.admitted);
        assert_eq!(denied.reason, Some(DenyReason::QuotaExceeded));
        assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));

        assert!(eval(&mut state, &config, 61_000).admitted);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let config = cfg(1, 1_000);
        let mut state = WindowState::new();
        assert!(eval(&mut state, &config, 0).admitted);
        assert!(!eval(&mut state, &config, 999).admitted);
        let at_boundary = eval(&mut state, &config, 1_000);
        assert!(!at_boundary.admitted);
        assert_eq!(at_boundary.retry_after, Some(Duration::from_millis(1)));
        assert!(eval(&mut state, &config, 1_001).admitted);
    }

    #[test]
    fn zero_max_always_denies_with_full_window_wait() {
        let config = cfg(0, 5_000);
        let mut state = WindowState::new();
        for t in [0, 10_000, 1_000_000] {
            let d = eval(&mut state, &config, t);
            assert!(!d.admitted);
            assert_eq!(d.retry_after, Some(Duration::from_secs(5)));
        }
        assert!(state.is_empty());
    }

    #[test]
    fn replayed_admission_does_not_append() {
        let config = cfg(3, 1_000);
        let mut state = WindowState::new();
        let id = EventId::from("req-1");
        let first = state.evaluate(&config, Timestamp::from_millis(0), &id, Duration::ZERO);
        let second = state.evaluate(&config, Timestamp::from_millis(5), &id, Duration::ZERO);
        assert_eq!(first, second);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn replayed_denial_stays_denied_after_capacity_frees() {
        let config = cfg(1, 1_000);
        let mut state = WindowState::new();
        assert!(eval(&mut state, &config, 0).admitted);
        let id = EventId::from("retry-me");
        let first = state.evaluate(&config, Timestamp::from_millis(500), &id, Duration::ZERO);
        assert!(!first.admitted);
        // Same id within its own window: still the original decision.
        let replay = state.evaluate(&config, Timestamp::from_millis(900), &id, Duration::ZERO);
        assert_eq!(first, replay);
    }

    #[test]
    fn tolerance_keeps_boundary_events_counted() {
        let config = cfg(1, 1_000);
        let mut state = WindowState::new();
        let tol = Duration::from_millis(50);
        assert!(state.evaluate(&config, Timestamp::from_millis(0), &EventId::generate(), tol).admitted);
        let d = state.evaluate(&config, Timestamp::from_millis(1_020), &EventId::generate(), tol);
        assert!(!d.admitted);
        assert_eq!(d.retry_after, Some(Duration::from_millis(30)));
        assert!(state.evaluate(&config, Timestamp::from_millis(1_051), &EventId::generate(), tol).admitted);
    }

    #[test]
    fn clock_far_behind_history_is_ambiguous() {
        let config = cfg(10, 60_000);
        let mut state = WindowState::new();
        let tol = Duration::from_millis(100);
        assert!(state.evaluate(&config, Timestamp::from_millis(5_000), &EventId::generate(), tol).admitted);

        let behind = state.evaluate(&config, Timestamp::from_millis(4_000), &EventId::generate(), tol);
        assert_eq!(behind.reason, Some(DenyReason::AmbiguousClock));

        // Slightly behind is tolerated and recorded at the newest timestamp.
        let close = state.evaluate(&config, Timestamp::from_millis(4_950), &EventId::generate(), tol);
        assert!(close.admitted);
        assert_eq!(state.newest(), Some(Timestamp::from_millis(5_000)));
    }

    #[test]
    fn count_purges_without_recording() {
        let config = cfg(5, 1_000);
        let mut state = WindowState::new();
        eval(&mut state, &config, 0);
        eval(&mut state, &config, 500);
        assert_eq!(state.count(&config, Timestamp::from_millis(900), Duration::ZERO), 2);
        assert_eq!(state.count(&config, Timestamp::from_millis(1_200), Duration::ZERO), 1);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn idle_windows_become_reclaimable_after_one_window() {
        let config = cfg(5, 1_000);
        let mut state = WindowState::new();
        eval(&mut state, &config, 100);
        assert!(!state.is_reclaimable(config.window(), Duration::ZERO, Timestamp::from_millis(900)));
        assert!(!state.is_reclaimable(config.window(), Duration::ZERO, Timestamp::from_millis(1_050)));
        assert!(state.is_reclaimable(config.window(), Duration::ZERO, Timestamp::from_millis(1_101)));
    }

    #[test]
    fn entries_held_by_skew_tolerance_are_not_reclaimable() {
        let config = cfg(1, 1_000);
        let tol = Duration::from_millis(50);
        let mut state = WindowState::new();
        eval(&mut state, &config, 0);
        assert!(!state.is_reclaimable(config.window(), tol, Timestamp::from_millis(1_020)));
        assert_eq!(state.len(), 1);
        assert!(state.is_reclaimable(config.window(), tol, Timestamp::from_millis(1_051)));
    }

    #[test]
    fn remembered_denials_are_capped() {
        let config = cfg(0, 60_000);
        let mut state = WindowState::new();
        for i in 0..(MAX_REMEMBERED_DENIALS + 10) {
            state.evaluate(&config, Timestamp::from_millis(i as u64), &EventId::generate(), Duration::ZERO);
        }
        assert_eq!(state.denials.len(), MAX_REMEMBERED_DENIALS);
    }
}
