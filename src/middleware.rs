//! Tower middleware that asks a [`QuotaEngine`] before forwarding each request.

use crate::decision::Decision;
use crate::engine::QuotaEngine;
use crate::telemetry::{NullSink, TelemetrySink};
use crate::window::EventId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Requests the admission layer can classify.
pub trait AdmissionRequest {
    /// Who is making the request (user, tenant, API key).
    fn subject(&self) -> &str;

    /// What is being consumed (model, endpoint).
    fn resource(&self) -> &str;

    /// Caller-supplied id for idempotent retries. `None` generates a fresh id per call.
    fn event_id(&self) -> Option<EventId> {
        None
    }
}

/// Error returned by [`AdmissionService`].
#[derive(thiserror::Error, Debug)]
pub enum AdmissionError<E> {
    /// The engine denied the request; the inner service was not called.
    #[error("admission denied: {0}")]
    Denied(Decision),
    /// The inner service failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> AdmissionError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, AdmissionError::Denied(_))
    }

    /// Retry hint of a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::Denied(decision) => decision.retry_after,
            AdmissionError::Inner(_) => None,
        }
    }
}

/// A layer that admits requests against a fixed, ordered list of tiers.
#[derive(Debug)]
pub struct AdmissionLayer<Sink = NullSink> {
    engine: Arc<QuotaEngine<Sink>>,
    tiers: Arc<[String]>,
}

impl<Sink> Clone for AdmissionLayer<Sink> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), tiers: self.tiers.clone() }
    }
}

impl<Sink> AdmissionLayer<Sink> {
    pub fn new<I, T>(engine: Arc<QuotaEngine<Sink>>, tiers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self { engine, tiers: tiers.into_iter().map(Into::into).collect() }
    }
}

impl<S, Sink> Layer<S> for AdmissionLayer<Sink> {
    type Service = AdmissionService<S, Sink>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, engine: self.engine.clone(), tiers: self.tiers.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<S, Sink = NullSink> {
    inner: S,
    engine: Arc<QuotaEngine<Sink>>,
    tiers: Arc<[String]>,
}

impl<S: Clone, Sink> Clone for AdmissionService<S, Sink> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone(), tiers: self.tiers.clone() }
    }
}

impl<S, Sink, Req> Service<Req> for AdmissionService<S, Sink>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Sink: TelemetrySink,
    Sink::Future: Send + 'static,
    Req: AdmissionRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let engine = self.engine.clone();
        let tiers = self.tiers.clone();
        let subject = req.subject().to_string();
        let resource = req.resource().to_string();
        let event = req.event_id().unwrap_or_else(EventId::generate);

        Box::pin(async move {
            let now = engine.clock().now();
            let decision = engine.evaluate(&subject, &resource, &tiers[..], now, &event).await;
            if !decision.admitted {
                return Err(AdmissionError::Denied(decision));
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}
