//! Deadline for remote calls.
//!
//! A timed-out call is reported as [`BackendError::Timeout`]; the caller treats it as a failure,
//! never as a possible admission.

use crate::error::BackendError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Panics if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Self {
        assert!(
            duration > Duration::ZERO && duration < Duration::MAX,
            "timeout duration must be non-zero and finite",
        );
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, BackendError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                Err(BackendError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}
