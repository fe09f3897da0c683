//! Telemetry for the admission engine.
//!
//! The engine describes what it does as [`QuotaEvent`]s and hands them to a sink. Sinks are plain
//! `tower::Service<QuotaEvent>` implementations, so they compose with ordinary tower combinators
//! and can forward events anywhere (see the `quotaring-jsonl` crate for a file sink).
//!
//! # Event Types
//!
//! - **Decision**: every evaluation outcome
//! - **ModeChanged**: failover transitions
//! - **BackendFailure**: a remote call failed or timed out
//! - **ClockAmbiguous**: a caller's `now` ran backwards past the skew tolerance
//! - **TopologyChanged**: a node joined or left the ring
//!
//! Emission is best effort: a sink that is not ready or errors loses the event, and the
//! evaluation that produced it is unaffected.

use crate::decision::DenyReason;
use crate::failover::FailoverMode;
use crate::ring::NodeId;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower_service::Service;

/// A telemetry sink that consumes quota events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use quotaring::telemetry::{QuotaEvent, TelemetrySink};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<QuotaEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: QuotaEvent) -> Self::Future {
///         println!("{event}");
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    Service<QuotaEvent, Response = (), Error = Self::SinkError>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: QuotaEvent)
where
    S: Service<QuotaEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaEvent {
    /// An event was admitted or denied.
    Decision {
        subject: String,
        resource: String,
        admitted: bool,
        /// Denying tier.
        tier: Option<String>,
        reason: Option<DenyReason>,
        /// Mode the evaluation ran in.
        mode: FailoverMode,
    },
    /// The failover controller changed mode.
    ModeChanged { from: FailoverMode, to: FailoverMode },
    /// A remote call failed; `timeout` separates deadline expiry from refusals.
    BackendFailure { tier: Option<String>, timeout: bool, error: String },
    /// The caller's clock moved backwards by more than the skew tolerance.
    ClockAmbiguous { subject: String, resource: String, tier: String },
    /// Ring membership changed.
    TopologyChanged { node: NodeId, joined: bool, node_count: usize },
}

impl QuotaEvent {
    /// Short stable name of the variant, e.g. `"mode_changed"`.
    pub fn kind(&self) -> &'static str {
        match self {
            QuotaEvent::Decision { .. } => "decision",
            QuotaEvent::ModeChanged { .. } => "mode_changed",
            QuotaEvent::BackendFailure { .. } => "backend_failure",
            QuotaEvent::ClockAmbiguous { .. } => "clock_ambiguous",
            QuotaEvent::TopologyChanged { .. } => "topology_changed",
        }
    }
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Decision { subject, resource, admitted: true, .. } => {
                write!(f, "Decision: {subject}/{resource} admitted")
            }
            QuotaEvent::Decision { subject, resource, tier, reason, .. } => write!(
                f,
                "Decision: {subject}/{resource} denied at {} ({})",
                tier.as_deref().unwrap_or("-"),
                reason.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            QuotaEvent::ModeChanged { from, to } => write!(f, "Failover: {from} → {to}"),
            QuotaEvent::BackendFailure { tier, timeout, error } => write!(
                f,
                "Backend failure{} on tier {}: {error}",
                if *timeout { " (timeout)" } else { "" },
                tier.as_deref().unwrap_or("-")
            ),
            QuotaEvent::ClockAmbiguous { subject, resource, tier } => {
                write!(f, "Ambiguous clock: {subject}/{resource} tier {tier}")
            }
            QuotaEvent::TopologyChanged { node, joined, node_count } => write!(
                f,
                "Topology: {node} {} ({node_count} nodes)",
                if *joined { "joined" } else { "left" }
            ),
        }
    }
}

/// Serialize an event as one JSON object.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &QuotaEvent) -> serde_json::Value {
    serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({ "kind": event.kind() }))
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event. The engine's default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<QuotaEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: QuotaEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<QuotaEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        tracing::info!(kind = event.kind(), "{}", event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past `capacity`. Clones share storage.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<QuotaEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<QuotaEvent> {
        self.events.lock().expect("memory sink poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory sink poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<QuotaEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        let mut guard = self.events.lock().expect("memory sink poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers; slow subscribers miss events.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<QuotaEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    /// Sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QuotaEvent> {
        self.sender.subscribe()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<QuotaEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_change() -> QuotaEvent {
        QuotaEvent::ModeChanged { from: FailoverMode::RemoteHealthy, to: FailoverMode::DegradedLocal }
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for node in ["a", "b", "c"] {
            emit_best_effort(
                sink.clone(),
                QuotaEvent::TopologyChanged { node: NodeId::from(node), joined: true, node_count: 1 },
            )
            .await;
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert!(matches!(&events[0], QuotaEvent::TopologyChanged { node, .. } if node.as_str() == "b"));
    }

    #[tokio::test]
    async fn streaming_sink_delivers_to_subscribers() {
        let sink = StreamingSink::new(8);
        emit_best_effort(sink.clone(), mode_change()).await;
        assert_eq!(sink.dropped_count(), 1);

        let mut rx = sink.subscribe();
        emit_best_effort(sink.clone(), mode_change()).await;
        assert_eq!(rx.recv().await.unwrap(), mode_change());
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(mode_change().to_string(), "Failover: remote-healthy → degraded-local");
        let denied = QuotaEvent::Decision {
            subject: "alice".into(),
            resource: "gpt-4".into(),
            admitted: false,
            tier: Some("per_user".into()),
            reason: Some(DenyReason::QuotaExceeded),
            mode: FailoverMode::RemoteHealthy,
        };
        assert!(denied.to_string().contains("denied at per_user"));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let event =
            QuotaEvent::TopologyChanged { node: NodeId::from("redis-2"), joined: false, node_count: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "topology_changed");
        assert_eq!(json["node"], "redis-2");
        assert_eq!(event.kind(), "topology_changed");
    }

    #[cfg(feature = "telemetry-json")]
    #[test]
    fn event_to_json_matches_serde() {
        let json = event_to_json(&mode_change());
        assert_eq!(json["to"], "degraded-local");
    }
}
