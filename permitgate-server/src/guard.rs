//! Admission guards for upstream calls and streamed responses
//!
//! A request first passes the rate limiter, then the admission gate. The
//! permit it receives is held for the entire upstream operation:
//!
//! - [`AdmissionGuard::call`] holds it across one future, bounded by the
//!   upstream timeout.
//! - [`AdmissionGuard::stream`] moves it into a [`PermitStream`], which holds
//!   it until the stream ends, is dropped, or reaches its maximum hold time.
//!
//! Dropping either future or stream at any point (for example because the
//! client went away) releases the permit.

use crate::config::GuardConfig;
use crate::metrics::Metrics;
use futures::Stream;
use permitgate::{AdmissionGate, AdmissionPermit, GateError, RateLimitKey, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tracing::warn;

/// Why a guarded upstream call did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// Turned away by the rate limiter or the admission gate
    #[error("rejected: {0}")]
    Rejected(#[from] GateError),
    #[error("upstream call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("upstream call failed: {0}")]
    Upstream(E),
}

impl<E> CallError<E> {
    /// Whether the caller should answer "busy, retry later"
    pub fn is_busy(&self) -> bool {
        matches!(self, CallError::Rejected(e) if e.is_retryable())
    }
}

/// Rate limiting and admission in front of upstream calls
#[derive(Clone)]
pub struct AdmissionGuard {
    gate: Arc<AdmissionGate>,
    limiter: Arc<RateLimiter>,
    upstream_timeout: Duration,
    stream_max_hold: Duration,
    metrics: Arc<Metrics>,
}

impl AdmissionGuard {
    pub fn new(
        gate: Arc<AdmissionGate>,
        limiter: Arc<RateLimiter>,
        config: &GuardConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gate,
            limiter,
            upstream_timeout: config.upstream_timeout,
            stream_max_hold: config.stream_max_hold,
            metrics,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// Check the call rate of `rate_key`, then admit `identity`
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RateLimited`] or [`GateError::OverCapacity`].
    /// A rate-limited request never touches the gate.
    pub fn admit_request(
        &self,
        rate_key: &RateLimitKey,
        identity: &str,
        request_type: &str,
    ) -> Result<AdmissionPermit, GateError> {
        self.limiter.check(&rate_key.to_string())?;
        self.gate.admit(identity, request_type)
    }

    /// Run `call` while holding a permit, bounded by the upstream timeout
    ///
    /// # Errors
    ///
    /// See [`CallError`].
    pub async fn call<F, T, E>(
        &self,
        rate_key: &RateLimitKey,
        identity: &str,
        request_type: &str,
        call: F,
    ) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.admit_request(rate_key, identity, request_type)?;
        let result = tokio::time::timeout(self.upstream_timeout, call).await;
        drop(permit);

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.metrics.calls_failed.fetch_add(1, Ordering::Relaxed);
                Err(CallError::Upstream(e))
            }
            Err(_) => {
                self.metrics.calls_timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    identity,
                    request_type,
                    timeout_secs = self.upstream_timeout.as_secs(),
                    "Upstream call timed out"
                );
                Err(CallError::TimedOut(self.upstream_timeout))
            }
        }
    }

    /// Admit a request and tie its permit to `stream`, for at most the
    /// configured maximum hold time
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RateLimited`] or [`GateError::OverCapacity`]; the
    /// stream is not polled in that case.
    pub fn stream<S>(
        &self,
        rate_key: &RateLimitKey,
        identity: &str,
        request_type: &str,
        stream: S,
    ) -> Result<PermitStream<S>, GateError>
    where
        S: Stream + Unpin,
    {
        let permit = self.admit_request(rate_key, identity, request_type)?;
        Ok(PermitStream::new(stream, permit)
            .with_max_hold(self.stream_max_hold)
            .with_metrics(Arc::clone(&self.metrics)))
    }
}

/// A stream that holds an admission permit until it is finished
///
/// The permit is released exactly once: when the inner stream ends, when the
/// maximum hold time (if any) elapses, or when this value is dropped. The
/// inner stream is dropped along with the permit, and nothing more is
/// yielded.
pub struct PermitStream<S> {
    inner: Option<S>,
    permit: Option<AdmissionPermit>,
    deadline: Option<Pin<Box<Sleep>>>,
    metrics: Option<Arc<Metrics>>,
}

impl<S> PermitStream<S>
where
    S: Stream + Unpin,
{
    pub fn new(inner: S, permit: AdmissionPermit) -> Self {
        Self {
            inner: Some(inner),
            permit: Some(permit),
            deadline: None,
            metrics: None,
        }
    }

    /// End the stream and release the permit after `max_hold`
    pub fn with_max_hold(mut self, max_hold: Duration) -> Self {
        self.deadline = Some(Box::pin(tokio::time::sleep(max_hold)));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether the permit is still held
    pub fn is_holding(&self) -> bool {
        self.permit.is_some()
    }

    fn finish(&mut self) {
        self.inner = None;
        self.permit = None;
        self.deadline = None;
    }
}

impl<S> Stream for PermitStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(permit) = &this.permit else {
            return Poll::Ready(None);
        };

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                warn!(
                    identity = permit.identity(),
                    request_type = permit.request_type(),
                    "Stream reached its maximum hold time, releasing permit"
                );
                if let Some(metrics) = &this.metrics {
                    metrics.streams_expired.fetch_add(1, Ordering::Relaxed);
                }
                this.finish();
                return Poll::Ready(None);
            }
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
