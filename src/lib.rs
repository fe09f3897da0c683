#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaring
//!
//! Sliding-window admission control for shared, rate-limited resources.
//!
//! ## Features
//!
//! - **Sliding-window log** per (subject, resource, tier) key, with exact expiry
//! - **Multi-tier evaluation** that stops at the first denying tier
//! - **Sharded atomic evaluation** over a consistent-hash ring of store nodes
//! - **Failover** to a local store when the remote store is slow or down, with probed recovery
//! - **Idempotent retries** via caller-supplied event ids
//! - **Tower middleware** and pluggable telemetry sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaring::{LocalEvaluator, TierRegistry, Timestamp, WindowConfig};
//! use std::time::Duration;
//!
//! let tiers = TierRegistry::new();
//! tiers.configure("per_user", WindowConfig::new(2, Duration::from_secs(60)).unwrap()).unwrap();
//! let local = LocalEvaluator::new(tiers, Duration::ZERO);
//!
//! assert!(local.allow("alice", "gpt-4", "per_user", Timestamp::from_secs(0)).unwrap().admitted);
//! assert!(local.allow("alice", "gpt-4", "per_user", Timestamp::from_secs(10)).unwrap().admitted);
//!
//! let denied = local.allow("alice", "gpt-4", "per_user", Timestamp::from_secs(30)).unwrap();
//! assert_eq!(denied.retry_after, Some(Duration::from_secs(30)));
//! ```
//!
//! For the sharded engine with failover see [`QuotaEngine`].

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod failover;
pub mod key;
pub mod local;
pub mod middleware;
pub mod remote;
pub mod ring;
pub mod telemetry;
pub mod tiers;
pub mod timeout;
pub mod window;

// Re-exports
pub use adaptive::DynamicConfig;
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{
    DegradedPolicy, EngineConfig, EngineConfigBuilder, FailoverConfig, TierRegistry, TierScope,
    TierTable, WindowConfig, DEFAULT_RESOURCE_CLASS,
};
pub use decision::{Decision, DenyReason};
pub use engine::{MetricsSnapshot, QuotaEngine, Status};
pub use error::{BackendError, ConfigError, QuotaError};
pub use evaluator::WindowEvaluator;
pub use failover::{FailoverController, FailoverMode, ModeChange};
pub use key::{WindowKey, ANY_SUBJECT};
pub use local::{LocalEvaluator, WindowStore};
pub use middleware::{AdmissionError, AdmissionLayer, AdmissionRequest, AdmissionService};
pub use remote::{InMemoryShardCluster, RemoteEvaluator, ScriptCall, ScriptReply, ShardBackend};
pub use ring::{stable_hash, NodeId, RingSnapshot, ShardRouter};
pub use telemetry::{
    emit_best_effort, LogSink, MemorySink, NullSink, QuotaEvent, StreamingSink, TelemetrySink,
};
pub use tiers::{TierRun, TierState, TierStep};
pub use timeout::TimeoutPolicy;
pub use window::{EventId, Timestamp, WindowState};

/// Convenient re-exports for applications.
pub mod prelude {
    pub use crate::{
        AdmissionLayer, AdmissionRequest, Decision, DegradedPolicy, DenyReason, EngineConfig,
        EventId, FailoverMode, NodeId, QuotaEngine, TierScope, Timestamp, WindowConfig,
    };
}
