//! Error types for the admission engine.
//!
//! `evaluate` never returns an error: backend trouble is absorbed by failover and surfaces only
//! through [`crate::engine::Status`]. Errors here come from configuration and admin operations.
use std::time::Duration;

use crate::ring::NodeId;

/// Invalid tier policy or engine configuration, rejected synchronously.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Tier windows must be longer than zero.
    #[error("window duration must be > 0 (got {window:?})")]
    InvalidWindow {
        /// Value provided by caller.
        window: Duration,
    },
    /// Tier names must be non-empty.
    #[error("tier name must not be empty")]
    EmptyTierName,
    /// The tier was never configured.
    #[error("tier '{tier}' is not configured")]
    UnknownTier {
        /// Name looked up.
        tier: String,
    },
    /// A required engine setting was not supplied.
    #[error("engine setting '{setting}' is required")]
    MissingSetting {
        /// Builder field name.
        setting: &'static str,
    },
    /// A threshold that must be positive was zero.
    #[error("{setting} must be > 0")]
    ZeroThreshold {
        /// Builder field name.
        setting: &'static str,
    },
    /// A duration that must be finite was `Duration::MAX`.
    #[error("{setting} must be finite")]
    UnboundedDuration {
        /// Builder field name.
        setting: &'static str,
    },
}

/// Failure talking to the remote store. Always treated as "not decided", never as admitted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call exceeded its deadline.
    #[error("remote call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The owning node could not be reached.
    #[error("shard node '{node}' unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },
    /// The ring has no nodes to route to.
    #[error("shard ring is empty")]
    NoNodes,
    /// The node answered with a reply that does not match the call.
    #[error("unexpected reply from shard node '{node}'")]
    UnexpectedReply { node: NodeId },
}

impl BackendError {
    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Access timeout details if this is a timeout error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Errors from administrative operations (`configure`, `reset`, topology changes).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl QuotaError {
    /// Check if this error came from configuration validation.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this error came from the remote store.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
