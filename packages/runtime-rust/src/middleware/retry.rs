//! Retry middleware.
//!
//! Replays a cloned request against a fresh clone of the inner service until
//! the [`RetryExecutor`] stops: on success, when the attempts are exhausted,
//! or when the error is not retryable. The last error is returned unchanged.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use resilience_core::RetryOptions;
use tower::{Layer, Service, ServiceExt};

use crate::retry::RetryExecutor;

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer that retries failed requests with exponential backoff.
pub struct RetryLayer<E> {
    executor: RetryExecutor,
    options: RetryOptions<E>,
}

impl<E> RetryLayer<E> {
    #[must_use]
    pub fn new(executor: RetryExecutor, options: RetryOptions<E>) -> Self {
        Self { executor, options }
    }
}

impl<E> Clone for RetryLayer<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            options: self.options.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLayer")
            .field("policy", &self.options.policy)
            .finish_non_exhaustive()
    }
}

impl<S, E> Layer<S> for RetryLayer<E> {
    type Service = RetryService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            executor: self.executor.clone(),
            options: self.options.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

pub struct RetryService<S, E> {
    inner: S,
    executor: RetryExecutor,
    options: RetryOptions<E>,
}

impl<S: Clone, E> Clone for RetryService<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S, E, Req> Service<Req> for RetryService<S, E>
where
    S: Service<Req, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    E: fmt::Display + Send + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = E;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, E>> + Send>>;

    /// Always ready: each attempt drives readiness on its own clone of the
    /// inner service.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let executor = self.executor.clone();
        let options = self.options.clone();

        Box::pin(async move {
            executor
                .execute_with_retry(
                    move || {
                        let mut svc = inner.clone();
                        let req = req.clone();
                        async move {
                            match ServiceExt::<Req>::ready(&mut svc).await {
                                Ok(ready) => ready.call(req).await,
                                Err(err) => Err(err),
                            }
                        }
                    },
                    &options,
                )
                .await
                .map(|outcome| outcome.result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
