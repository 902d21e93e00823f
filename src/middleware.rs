//! Tower middleware enforcing admission in front of a service.
//!
//! [`AdmissionLayer`] wraps a service; per request it extracts the account
//! identity (with a caller-supplied [`ExtractAccount`]), asks the gate, and
//! either forwards the request or fails with an error carrying the full
//! [`AdmissionDecision`]. Rendering the rejection (status code, `Retry-After`
//! header) stays the surrounding layer's concern.

use crate::account::AccountId;
use crate::error::GateError;
use crate::gate::{AdmissionDecision, AdmissionGate};
use crate::telemetry::{GateSink, NullSink};
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Maps a request to the account it should be admitted as.
///
/// Implemented for closures, so an HTTP integration is typically one line
/// reading a header or an auth extension.
pub trait ExtractAccount<Req>: Send + Sync {
    /// The request's account identity, or `None` when it carries none.
    fn account(&self, req: &Req) -> Option<AccountId>;
}

impl<Req, F> ExtractAccount<Req> for F
where
    F: Fn(&Req) -> Option<AccountId> + Send + Sync,
{
    fn account(&self, req: &Req) -> Option<AccountId> {
        self(req)
    }
}

/// Error type of [`AdmissionService`].
#[derive(Debug)]
pub enum AdmissionError<E> {
    /// The gate denied the request; the decision carries the reason,
    /// retry-after hint, and remaining figures.
    Denied {
        /// The full denial decision.
        decision: AdmissionDecision,
    },
    /// The gate could not decide (lookup failure, unknown tier, store outage
    /// under fail-closed).
    Gate(GateError),
    /// The extractor found no account identity on the request.
    MissingAccount,
    /// The wrapped service failed after admission.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { decision } => {
                write!(f, "request denied: {}", decision.reason())?;
                if let Some(wait) = decision.retry_after() {
                    write!(f, " (retry after {:?})", wait)?;
                }
                Ok(())
            }
            Self::Gate(error) => write!(f, "admission gate failed: {}", error),
            Self::MissingAccount => write!(f, "request carried no account identity"),
            Self::Inner(error) => write!(f, "{}", error),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gate(error) => Some(error),
            Self::Inner(error) => Some(error),
            _ => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this is a rate-limit denial (as opposed to a failure).
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// The denial decision, if this is a denial.
    pub fn decision(&self) -> Option<&AdmissionDecision> {
        match self {
            Self::Denied { decision } => Some(decision),
            _ => None,
        }
    }

    /// Check if this wraps an inner service error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Extract the inner service error, if present.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(error) => Some(error),
            _ => None,
        }
    }
}

/// A layer that gates requests through an [`AdmissionGate`].
pub struct AdmissionLayer<X, S = NullSink> {
    gate: Arc<AdmissionGate<S>>,
    extractor: Arc<X>,
}

impl<X, S> AdmissionLayer<X, S> {
    /// Create a layer around a gate and an account extractor.
    pub fn new(gate: AdmissionGate<S>, extractor: X) -> Self {
        Self { gate: Arc::new(gate), extractor: Arc::new(extractor) }
    }

    /// Create a layer sharing an already-shared gate.
    pub fn from_arc(gate: Arc<AdmissionGate<S>>, extractor: Arc<X>) -> Self {
        Self { gate, extractor }
    }
}

impl<X, S> Clone for AdmissionLayer<X, S> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), extractor: self.extractor.clone() }
    }
}

impl<X, S> fmt::Debug for AdmissionLayer<X, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").finish_non_exhaustive()
    }
}

impl<Svc, X, S> Layer<Svc> for AdmissionLayer<X, S> {
    type Service = AdmissionService<Svc, X, S>;

    fn layer(&self, inner: Svc) -> Self::Service {
        AdmissionService { inner, gate: self.gate.clone(), extractor: self.extractor.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Svc, X, S = NullSink> {
    inner: Svc,
    gate: Arc<AdmissionGate<S>>,
    extractor: Arc<X>,
}

impl<Svc: Clone, X, S> Clone for AdmissionService<Svc, X, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: self.gate.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<Svc, X, S> fmt::Debug for AdmissionService<Svc, X, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").finish_non_exhaustive()
    }
}

type AdmitFuture = Pin<Box<dyn Future<Output = Result<AdmissionDecision, GateError>> + Send>>;

impl<Svc, Req, X, S> Service<Req> for AdmissionService<Svc, X, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send,
    X: ExtractAccount<Req>,
    S: GateSink + Sync,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = AdmissionError<Svc::Error>;
    type Future = ResponseFuture<Svc, Req>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let Some(account) = self.extractor.account(&req) else {
            return ResponseFuture {
                state: State::Reject { error: Some(AdmissionError::MissingAccount) },
            };
        };
        let gate = self.gate.clone();
        let admit: AdmitFuture = Box::pin(async move { gate.admit(&account).await });
        ResponseFuture {
            state: State::Admitting { admit, ctx: Some((self.inner.clone(), req)) },
        }
    }
}

/// Response future of [`AdmissionService`].
///
/// The only allocation per call is the boxed admission future; the inner
/// service's future is driven in place.
#[pin_project]
pub struct ResponseFuture<Svc, Req>
where
    Svc: Service<Req>,
{
    #[pin]
    state: State<Svc, Req>,
}

#[pin_project(project = StateProj)]
enum State<Svc, Req>
where
    Svc: Service<Req>,
{
    Reject { error: Option<AdmissionError<Svc::Error>> },
    Admitting { admit: AdmitFuture, ctx: Option<(Svc, Req)> },
    Calling { #[pin] future: Svc::Future },
}

impl<Svc, Req> Future for ResponseFuture<Svc, Req>
where
    Svc: Service<Req>,
{
    type Output = Result<Svc::Response, AdmissionError<Svc::Error>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.state.as_mut().project() {
                StateProj::Reject { error } => {
                    let error = error.take().expect("ResponseFuture polled after completion");
                    return Poll::Ready(Err(error));
                }
                StateProj::Admitting { admit, ctx } => {
                    let decision = match admit.as_mut().poll(cx) {
                        Poll::Ready(result) => result,
                        Poll::Pending => return Poll::Pending,
                    };
                    match decision {
                        Ok(decision) if decision.is_allowed() => {
                            let (mut inner, req) =
                                ctx.take().expect("ResponseFuture polled after completion");
                            let future = inner.call(req);
                            this.state.set(State::Calling { future });
                        }
                        Ok(decision) => {
                            return Poll::Ready(Err(AdmissionError::Denied { decision }))
                        }
                        Err(error) => return Poll::Ready(Err(AdmissionError::Gate(error))),
                    }
                }
                StateProj::Calling { future } => {
                    return future.poll(cx).map_err(AdmissionError::Inner);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{DecisionReason, Remaining};
    use std::time::Duration;

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError")
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn denied_error_displays_reason_and_wait() {
        let err: AdmissionError<TestError> = AdmissionError::Denied {
            decision: AdmissionDecision::Denied {
                reason: DecisionReason::MinuteLimitExceeded,
                retry_after: Some(Duration::from_secs(9)),
                remaining_minute: Remaining::Exact(0),
                remaining_month: Remaining::Exact(12),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("minute_limit_exceeded"));
        assert!(msg.contains("9s"));
        assert!(err.is_denied());
        assert_eq!(err.decision().unwrap().remaining_month(), Remaining::Exact(12));
    }

    #[test]
    fn inner_error_is_extractable() {
        let err: AdmissionError<TestError> = AdmissionError::Inner(TestError);
        assert!(err.is_inner());
        assert!(!err.is_denied());
        assert!(err.into_inner().is_some());
    }
}
