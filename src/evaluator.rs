//! The seam between the tier combinator and where window state lives.
//!
//! Both evaluators run the same [`crate::window::WindowState`] algorithm; they differ only in who
//! serialises access to a key: a per-key lock in this process, or the owning shard node.

use crate::config::WindowConfig;
use crate::decision::Decision;
use crate::error::BackendError;
use crate::key::WindowKey;
use crate::window::{EventId, Timestamp};
use async_trait::async_trait;

/// Per-key admission operations.
#[async_trait]
pub trait WindowEvaluator: Send + Sync {
    /// Purge, count, and record `event` at `now` if under quota, as one indivisible step.
    async fn evaluate(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
        event: &EventId,
    ) -> Result<Decision, BackendError>;

    /// Events currently inside the key's window; records nothing.
    async fn count(
        &self,
        key: &WindowKey,
        config: &WindowConfig,
        now: Timestamp,
    ) -> Result<usize, BackendError>;

    /// Clear the key unconditionally.
    async fn reset(&self, key: &WindowKey) -> Result<(), BackendError>;
}
