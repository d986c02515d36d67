use crate::error::GatewayError;
use crate::identity::{HeaderIdentityResolver, IdentityResolver};
use crate::rate_limit::RateLimiter;
use crate::request::InboundRequest;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Error returned by [`AdmissionService`].
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError<E> {
    /// The limiter denied the request; always [`GatewayError::QuotaExceeded`].
    #[error(transparent)]
    Rejected(GatewayError),
    /// The wrapped service failed.
    #[error("inner service error: {0}")]
    Inner(#[source] E),
}

impl<E> AdmissionError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

/// A layer that puts a [`RateLimiter`] in front of a service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    limiter: Arc<RateLimiter>,
    resolver: Arc<dyn IdentityResolver>,
}

impl AdmissionLayer {
    /// Identities are read from headers by [`HeaderIdentityResolver`].
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter, resolver: Arc::new(HeaderIdentityResolver::new()) }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// Middleware service that evaluates every request before calling the inner service.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    resolver: Arc<dyn IdentityResolver>,
}

impl<S> Service<InboundRequest> for AdmissionService<S>
where
    S: Service<InboundRequest> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: InboundRequest) -> Self::Future {
        let limiter = self.limiter.clone();
        let identity = self.resolver.resolve(&req);
        // The readied service is the one that must handle the call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.evaluate(&identity, &req.path).await;
            if let Some(rejection) = decision.into_error() {
                return Err(AdmissionError::Rejected(rejection));
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}
