//! In-process window store and the local evaluator built on it.
//!
//! Locking: the key map sits behind an `RwLock` that is held only long enough to find or insert
//! a key's slot; each slot has its own `Mutex` covering exactly the purge-count-append sequence.
//! Callers on different keys never wait on each other; callers on one key serialise.
//!
//! Idle reclamation marks a slot retired under its own lock before unlinking it, and an
//! evaluation that finds its slot retired starts over, so no admitted event is ever recorded into
//! a slot that has already been dropped from the map.

use crate::config::{TierRegistry, WindowConfig};
use crate::decision::Decision;
use crate::error::{BackendError, ConfigError};
use crate::evaluator::WindowEvaluator;
use crate::key::WindowKey;
use crate::window::{EventId, Timestamp, WindowState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    state: WindowState,
    window: Duration,
    skew_tolerance: Duration,
    retired: bool,
}

/// Map of window key to per-key locked state. Create one per engine (or per test); there is no
/// process-wide instance.
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: RwLock<HashMap<WindowKey, Arc<Mutex<Slot>>>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &WindowKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.windows.read().expect("window store poisoned").get(key) {
            return slot.clone();
        }
        let mut map = self.windows.write().expect("window store poisoned");
        map.entry(key.clone()).or_default().clone()
    }

    fn existing(&self, key: &WindowKey) -> Option<Arc<Mutex<Slot>>> {
        self.windows.read().expect("window store poisoned").get(key).cloned()
    }

    /// Run one admission decision for `key` under its lock.
    pub fn evaluate(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
        event: &EventId,
        skew_tolerance: Duration,
    ) -> Decision {
        loop {
            let slot = self.slot(key);
            let mut guard = slot.lock().expect("window slot poisoned");
            if guard.retired {
                continue;
            }
            guard.window = config.window();
            guard.skew_tolerance = skew_tolerance;
            return guard.state.evaluate(config, now, event, skew_tolerance);
        }
    }

    /// In-window count for `key`; unknown keys count zero and are not created.
    pub fn count(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
        skew_tolerance: Duration,
    ) -> usize {
        match self.existing(key) {
            Some(slot) => {
                let mut guard = slot.lock().expect("window slot poisoned");
                guard.state.count(config, now, skew_tolerance)
            }
            None => 0,
        }
    }

    /// Clear `key`. Returns whether it held any state.
    pub fn reset(&self, key: &WindowKey) -> bool {
        let removed = self.windows.write().expect("window store poisoned").remove(key);
        match removed {
            Some(slot) => {
                let mut guard = slot.lock().expect("window slot poisoned");
                guard.retired = true;
                guard.state.clear();
                true
            }
            None => false,
        }
    }

    /// Clear every key of `subject`, across all tiers and resources. Returns keys cleared.
    pub fn reset_subject(&self, subject: &str) -> usize {
        let mut map = self.windows.write().expect("window store poisoned");
        let doomed: Vec<WindowKey> = map.keys().filter(|k| k.subject() == subject).cloned().collect();
        for key in &doomed {
            if let Some(slot) = map.remove(key) {
                let mut guard = slot.lock().expect("window slot poisoned");
                guard.retired = true;
                guard.state.clear();
            }
        }
        doomed.len()
    }

    /// Drop every key.
    pub fn clear(&self) {
        let mut map = self.windows.write().expect("window store poisoned");
        for slot in map.values() {
            if let Ok(mut guard) = slot.lock() {
                guard.retired = true;
            }
        }
        map.clear();
    }

    /// Reclaim keys that are empty and have been idle for a full window plus the skew tolerance
    /// they were evaluated with. Keys whose lock is busy are skipped until the next sweep.
    /// Returns keys reclaimed.
    pub fn sweep_idle(&self, now: Timestamp) -> usize {
        let mut map = self.windows.write().expect("window store poisoned");
        let before = map.len();
        map.retain(|_, slot| match slot.try_lock() {
            Ok(mut guard) => {
                let (window, skew_tolerance) = (guard.window, guard.skew_tolerance);
                if guard.state.is_reclaimable(window, skew_tolerance, now) {
                    guard.retired = true;
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        });
        let reclaimed = before - map.len();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, remaining = map.len(), "reclaimed idle windows");
        }
        reclaimed
    }

    /// Tracked key count per tier.
    pub fn tracked_keys(&self) -> BTreeMap<String, usize> {
        let map = self.windows.read().expect("window store poisoned");
        let mut counts = BTreeMap::new();
        for key in map.keys() {
            *counts.entry(key.tier().to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.read().expect("window store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-process evaluator: [`WindowStore`] plus the tier table.
#[derive(Debug, Clone)]
pub struct LocalEvaluator {
    store: Arc<WindowStore>,
    tiers: TierRegistry,
    skew_tolerance: Duration,
}

impl LocalEvaluator {
    /// Evaluator over a fresh store.
    pub fn new(tiers: TierRegistry, skew_tolerance: Duration) -> Self {
        Self::with_store(Arc::new(WindowStore::new()), tiers, skew_tolerance)
    }

    /// Evaluator over an existing store.
    pub fn with_store(store: Arc<WindowStore>, tiers: TierRegistry, skew_tolerance: Duration) -> Self {
        Self { store, tiers, skew_tolerance }
    }

    /// Admit or deny one event of `subject` on `resource` under `tier` at `now`.
    pub fn allow(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
    ) -> Result<Decision, ConfigError> {
        self.allow_event(subject, resource, tier, now, &EventId::generate())
    }

    /// [`LocalEvaluator::allow`] with a caller-supplied event id, so retries are not
    /// double-counted.
    pub fn allow_event(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, ConfigError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        Ok(self.store.evaluate(&key, &config, now, event, self.skew_tolerance).for_tier(tier))
    }

    /// Events currently inside the window, without recording one.
    pub fn count(
        &self,
        subject: &str,
        resource: &str,
        tier: &str,
        now: Timestamp,
    ) -> Result<usize, ConfigError> {
        let (key, config) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        Ok(self.store.count(&key, &config, now, self.skew_tolerance))
    }

    /// Clear the window unconditionally.
    pub fn reset(&self, subject: &str, resource: &str, tier: &str) -> Result<(), ConfigError> {
        let (key, _) = self.tiers.snapshot().resolve(tier, subject, resource)?;
        self.store.reset(&key);
        Ok(())
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }
}

#[async_trait]
impl WindowEvaluator for LocalEvaluator {
    async fn evaluate(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, BackendError> {
        Ok(self.store.evaluate(key, config, now, event, self.skew_tolerance))
    }

    async fn count(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
    ) -> Result<usize, BackendError> {
        Ok(self.store.count(key, config, now, self.skew_tolerance))
    }

    async fn reset(&self, key: &WindowKey) -> Result<(), BackendError> {
        self.store.reset(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DenyReason;
    use std::thread;

    fn evaluator(max: u32, window: Duration) -> LocalEvaluator {
        let tiers = TierRegistry::new();
        tiers.configure("per_user", WindowConfig::new(max, window).unwrap()).unwrap();
        LocalEvaluator::new(tiers, Duration::ZERO)
    }

    #[test]
    fn separate_subjects_and_resources_are_independent() {
        let local = evaluator(1, Duration::from_secs(60));
        let t = Timestamp::from_secs(1);
        assert!(local.allow("alice", "gpt-4", "per_user", t).unwrap().admitted);
        assert!(local.allow("bob", "gpt-4", "per_user", t).unwrap().admitted);
        assert!(local.allow("alice", "llama", "per_user", t).unwrap().admitted);

        let denied = local.allow("alice", "gpt-4", "per_user", t).unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.tier.as_deref(), Some("per_user"));
        assert_eq!(denied.reason, Some(DenyReason::QuotaExceeded));
    }

    #[test]
    fn unknown_tier_is_a_configuration_error() {
        let local = evaluator(1, Duration::from_secs(60));
        let err = local.allow("alice", "gpt-4", "nope", Timestamp::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTier { .. }));
    }

    #[test]
    fn count_is_read_only() {
        let local = evaluator(3, Duration::from_secs(60));
        let t = Timestamp::from_secs(1);
        assert_eq!(local.count("alice", "m", "per_user", t).unwrap(), 0);
        local.allow("alice", "m", "per_user", t).unwrap();
        local.allow("alice", "m", "per_user", t).unwrap();
        assert_eq!(local.count("alice", "m", "per_user", t).unwrap(), 2);
        assert_eq!(local.count("alice", "m", "per_user", t).unwrap(), 2);
    }

    #[test]
    fn reset_clears_unconditionally() {
        let local = evaluator(1, Duration::from_secs(60));
        let t = Timestamp::from_secs(1);
        assert!(local.allow("alice", "m", "per_user", t).unwrap().admitted);
        assert!(!local.allow("alice", "m", "per_user", t).unwrap().admitted);
        local.reset("alice", "m", "per_user").unwrap();
        assert!(local.allow("alice", "m", "per_user", t).unwrap().admitted);
    }

    #[test]
    fn reset_subject_clears_all_resources() {
        let local = evaluator(1, Duration::from_secs(60));
        let t = Timestamp::from_secs(1);
        local.allow("alice", "a", "per_user", t).unwrap();
        local.allow("alice", "b", "per_user", t).unwrap();
        local.allow("bob", "a", "per_user", t).unwrap();
        assert_eq!(local.store().reset_subject("alice"), 2);
        assert_eq!(local.store().len(), 1);
        assert!(local.allow("alice", "a", "per_user", t).unwrap().admitted);
    }

    #[test]
    fn sweep_reclaims_only_idle_keys() {
        let local = evaluator(5, Duration::from_secs(1));
        local.allow("alice", "m", "per_user", Timestamp::from_millis(0)).unwrap();
        local.allow("bob", "m", "per_user", Timestamp::from_millis(1_500)).unwrap();
        assert_eq!(local.store().sweep_idle(Timestamp::from_millis(2_000)), 1);
        assert_eq!(local.store().tracked_keys().get("per_user"), Some(&1));
    }

    #[test]
    fn sweep_keeps_keys_still_inside_skew_tolerance() {
        let tiers = TierRegistry::new();
        tiers.configure("per_user", WindowConfig::new(1, Duration::from_secs(1)).unwrap()).unwrap();
        let swept = LocalEvaluator::new(tiers.clone(), Duration::from_millis(50));
        let untouched = LocalEvaluator::new(tiers, Duration::from_millis(50));
        for local in [&swept, &untouched] {
            assert!(local.allow("alice", "m", "per_user", Timestamp::from_millis(0)).unwrap().admitted);
        }

        assert_eq!(swept.store().sweep_idle(Timestamp::from_millis(1_020)), 0);
        let t = Timestamp::from_millis(1_020);
        let a = swept.allow("alice", "m", "per_user", t).unwrap();
        let b = untouched.allow("alice", "m", "per_user", t).unwrap();
        assert!(!a.admitted);
        assert_eq!(a, b);

        assert_eq!(swept.store().sweep_idle(Timestamp::from_millis(2_100)), 1);
    }

    #[test]
    fn concurrent_callers_never_over_admit() {
        let local = evaluator(50, Duration::from_secs(60));
        let admitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let local = local.clone();
                let admitted = admitted.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let d = local.allow("alice", "m", "per_user", Timestamp::from_secs(1)).unwrap();
                        if d.admitted {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 50);
        assert_eq!(local.count("alice", "m", "per_user", Timestamp::from_secs(1)).unwrap(), 50);
    }
}
