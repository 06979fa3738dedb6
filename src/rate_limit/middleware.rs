//! Tower middleware that gates an inner service behind the fixed-window
//! limiter.
//!
//! The layer does not know how to find a rate-limit subject in a request, so
//! the caller supplies an extractor closure mapping each request to a
//! [`GateSubject`] (traffic class + identity). Requests with no subject pass
//! through ungated, which is how exempt routes opt out.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::rate_limit::{Decision, FixedWindowLimiter};
use crate::store::AccountingStore;

/// The `(traffic class, identity)` pair a request is limited under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSubject {
    /// Configured traffic class name.
    pub class: String,
    /// Caller identity within that class (phone number, user id, address).
    pub identity: String,
}

impl GateSubject {
    /// Build a subject.
    pub fn new(class: impl Into<String>, identity: impl Into<String>) -> Self {
        Self { class: class.into(), identity: identity.into() }
    }
}

/// Error type of [`GateService`].
///
/// A rejection is an intentional decision carrying full quota metadata for
/// response headers; `Inner` wraps the gated service's own error.
#[derive(Debug)]
pub enum GateError<E> {
    /// The limiter rejected the request.
    Rejected(Decision),
    /// The inner service failed.
    Inner(E),
}

impl<E> GateError<E> {
    /// The rejection decision, if this is a rejection.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(d) => Some(d),
            Self::Inner(_) => None,
        }
    }

    /// Check if this error is a quota rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(d) => write!(
                f,
                "rate limit exceeded ({}/{} used, retry after {}s)",
                d.limit,
                d.limit,
                d.retry_after_secs().unwrap_or(0)
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

/// A layer that gates a service behind a [`FixedWindowLimiter`].
pub struct GateLayer<St, F> {
    limiter: Arc<FixedWindowLimiter<St>>,
    extract: Arc<F>,
}

impl<St, F> GateLayer<St, F> {
    /// Create a gate layer. `extract` maps a request to its limit subject;
    /// returning `None` exempts the request.
    pub fn new(limiter: FixedWindowLimiter<St>, extract: F) -> Self {
        Self { limiter: Arc::new(limiter), extract: Arc::new(extract) }
    }
}

impl<St, F> Clone for GateLayer<St, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extract: self.extract.clone() }
    }
}

impl<S, St, F> Layer<S> for GateLayer<St, F> {
    type Service = GateService<S, St, F>;

    fn layer(&self, service: S) -> Self::Service {
        GateService { inner: service, limiter: self.limiter.clone(), extract: self.extract.clone() }
    }
}

/// Middleware service produced by [`GateLayer`].
pub struct GateService<S, St, F> {
    inner: S,
    limiter: Arc<FixedWindowLimiter<St>>,
    extract: Arc<F>,
}

impl<S: Clone, St, F> Clone for GateService<S, St, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<S, St, F, Req> Service<Req> for GateService<S, St, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    St: AccountingStore + 'static,
    F: Fn(&Req) -> Option<GateSubject> + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let subject = (self.extract)(&req);
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(subject) = subject {
                let decision = limiter.check(&subject.class, &subject.identity).await;
                if !decision.admitted {
                    return Err(GateError::Rejected(decision));
                }
            }
            inner.call(req).await.map_err(GateError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_error_display_and_accessors() {
        let decision = Decision {
            admitted: false,
            limit: 10,
            remaining: 0,
            resets_in: std::time::Duration::from_secs(30),
            retry_after: Some(std::time::Duration::from_secs(30)),
        };
        let err: GateError<std::io::Error> = GateError::Rejected(decision);
        assert!(err.is_rejected());
        assert_eq!(err.decision().unwrap().limit, 10);
        let msg = err.to_string();
        assert!(msg.contains("rate limit exceeded"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn inner_error_passes_through_display() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: GateError<std::io::Error> = GateError::Inner(io);
        assert!(!err.is_rejected());
        assert!(err.decision().is_none());
        assert_eq!(err.to_string(), "boom");
    }
}
