//! Admission decisions returned by every evaluator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why an event was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The key's window already holds `max_events` events.
    QuotaExceeded,
    /// The caller's `now` disagrees with recorded history by more than the skew tolerance.
    AmbiguousClock,
    /// The tier named by the caller was never configured.
    UnknownTier,
    /// The remote store is unavailable and the engine is configured to fail closed.
    BackendUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::QuotaExceeded => "quota_exceeded",
            DenyReason::AmbiguousClock => "ambiguous_clock",
            DenyReason::UnknownTier => "unknown_tier",
            DenyReason::BackendUnavailable => "backend_unavailable",
        };
        f.write_str(s)
    }
}

/// Outcome of an admission check.
///
/// `tier` names the tier that denied the event; `retry_after` is the time until the oldest event
/// in that tier's window expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub admitted: bool,
    pub tier: Option<String>,
    pub retry_after: Option<Duration>,
    pub reason: Option<DenyReason>,
}

impl Decision {
    /// An admitting decision.
    pub fn admitted() -> Self {
        Self { admitted: true, tier: None, retry_after: None, reason: None }
    }

    /// A denial with the given reason and retry hint.
    pub fn denied(reason: DenyReason, retry_after: Option<Duration>) -> Self {
        Self { admitted: false, tier: None, retry_after, reason: Some(reason) }
    }

    /// Attribute the decision to a tier. Admissions stay unattributed.
    pub fn for_tier(mut self, tier: &str) -> Self {
        if !self.admitted {
            self.tier = Some(tier.to_string());
        }
        self
    }

    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.admitted {
            return f.write_str("admitted");
        }
        write!(f, "denied")?;
        if let Some(reason) = self.reason {
            write!(f, " ({})", reason)?;
        }
        if let Some(tier) = &self.tier {
            write!(f, " at tier '{}'", tier)?;
        }
        if let Some(wait) = self.retry_after {
            write!(f, ", retry after {:?}", wait)?;
        }
        Ok(())
    }
}
