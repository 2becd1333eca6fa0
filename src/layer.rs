//! Tower integration: protect any `Service` with a named policy.
//!
//! ```
//! use resilience_policy::layer::PolicyLayer;
//! use resilience_policy::store::InMemoryKvStore;
//! use resilience_policy::ResilienceEngine;
//! use std::sync::Arc;
//! use tower::{service_fn, Layer};
//!
//! let engine = Arc::new(
//!     ResilienceEngine::builder().store(Arc::new(InMemoryKvStore::new())).build().unwrap(),
//! );
//! let svc = PolicyLayer::<String, _>::new(engine, "search").layer(service_fn(|q: String| async move {
//!     Ok::<_, std::io::Error>(q.len())
//! }));
//! # let _ = svc;
//! ```

use crate::engine::{CallContext, ResilienceEngine};
use crate::error::{Classify, ResilienceError};
use crate::telemetry::{NullSink, TelemetrySink};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

type ContextFn<Req> = Arc<dyn Fn(&Req) -> CallContext + Send + Sync>;

/// Wraps services so every request runs through [`ResilienceEngine::execute`].
pub struct PolicyLayer<Req, Sink = NullSink> {
    engine: Arc<ResilienceEngine<Sink>>,
    policy: Arc<str>,
    context: Option<ContextFn<Req>>,
}

impl<Req, Sink> PolicyLayer<Req, Sink> {
    pub fn new(engine: Arc<ResilienceEngine<Sink>>, policy: impl Into<Arc<str>>) -> Self {
        Self { engine, policy: policy.into(), context: None }
    }

    /// Derive the call context (correlation id, rate-limit key, timeout) from each request.
    /// Without it every request gets a fresh [`CallContext`].
    pub fn with_context<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req) -> CallContext + Send + Sync + 'static,
    {
        self.context = Some(Arc::new(f));
        self
    }
}

impl<Req, Sink> Clone for PolicyLayer<Req, Sink> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), policy: self.policy.clone(), context: self.context.clone() }
    }
}

impl<Req, Sink> fmt::Debug for PolicyLayer<Req, Sink> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyLayer").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S, Req, Sink> Layer<S> for PolicyLayer<Req, Sink> {
    type Service = PolicyService<S, Req, Sink>;

    fn layer(&self, inner: S) -> Self::Service {
        PolicyService {
            inner,
            engine: self.engine.clone(),
            policy: self.policy.clone(),
            context: self.context.clone(),
        }
    }
}

/// Service produced by [`PolicyLayer`].
///
/// Requests are cloned once per attempt, so retried calls see the original request.
pub struct PolicyService<S, Req, Sink = NullSink> {
    inner: S,
    engine: Arc<ResilienceEngine<Sink>>,
    policy: Arc<str>,
    context: Option<ContextFn<Req>>,
}

impl<S: Clone, Req, Sink> Clone for PolicyService<S, Req, Sink> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            policy: self.policy.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S, Req, Sink> fmt::Debug for PolicyService<S, Req, Sink> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyService").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<S, Req, Sink> Service<Req> for PolicyService<S, Req, Sink>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Classify + Send + 'static,
    S::Future: Send + 'static,
    Req: Clone + Send + 'static,
    Sink: TelemetrySink,
    Sink::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each attempt drives its own clone to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let engine = self.engine.clone();
        let policy = self.policy.clone();
        let ctx = self.context.as_ref().map_or_else(CallContext::new, |f| f(&req));
        let inner = self.inner.clone();

        Box::pin(async move {
            engine
                .execute(&ctx, &policy, move || inner.clone().oneshot(req.clone()))
                .await
        })
    }
}
