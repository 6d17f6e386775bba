//! Concurrency-limit middleware.
//!
//! Routes every request through a shared [`ConcurrencyManager`]: excess
//! requests wait in FIFO order for a permit instead of being rejected, and
//! only fail (with the manager's queue-timeout error) once the queue timeout
//! elapses. The inner service is not called until a permit is held.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::manager::ConcurrencyManager;
use crate::semaphore::SemaphoreError;

const DEFAULT_LABEL: &str = "service";

// ---------------------------------------------------------------------------
// ConcurrencyLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer that admits requests through a shared [`ConcurrencyManager`].
///
/// Every service produced by the layer shares the same manager, so the limit
/// holds across clones and across differently-typed services.
///
/// The inner instance readied by `poll_ready` is only called once a permit is
/// granted, which may take up to the queue timeout. An inner service that
/// reserves capacity on readiness (e.g. `tower::buffer::Buffer`) keeps that
/// reservation for the whole wait; put such services outside this layer.
#[derive(Clone)]
pub struct ConcurrencyLimitLayer {
    manager: Arc<ConcurrencyManager>,
    label: &'static str,
}

impl ConcurrencyLimitLayer {
    #[must_use]
    pub fn new(manager: Arc<ConcurrencyManager>) -> Self {
        Self {
            manager,
            label: DEFAULT_LABEL,
        }
    }

    /// Operation id attached to the manager's log events for this layer.
    #[must_use]
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }
}

impl<S> Layer<S> for ConcurrencyLimitLayer {
    type Service = ConcurrencyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyLimitService {
            inner,
            manager: Arc::clone(&self.manager),
            label: self.label,
        }
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyLimitService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConcurrencyLimitService<S> {
    inner: S,
    manager: Arc<ConcurrencyManager>,
    label: &'static str,
}

impl<S, Req> Service<Req> for ConcurrencyLimitService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: From<SemaphoreError> + Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Take the instance that was driven to readiness; leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let manager = Arc::clone(&self.manager);
        let label = self.label;

        Box::pin(async move { manager.execute(move || inner.call(req), Some(label)).await })
    }
}

impl<S> std::fmt::Debug for ConcurrencyLimitService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimitService")
            .field("label", &self.label)
            .field("status", &self.manager.semaphore().status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ConcurrencyConfig;

    /// Sleeps per request and tracks the peak number of concurrent calls.
    #[derive(Clone)]
    struct Sleeper {
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl Sleeper {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Service<u32> for Sleeper {
        type Response = u32;
        type Error = anyhow::Error;
        type Future = Pin<Box<dyn Future<Output = Result<u32, anyhow::Error>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: u32) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, in_flight, peak) = (self.delay, self.in_flight.clone(), self.peak.clone());
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(req * 2)
            })
        }
    }

    fn manager(max_concurrency: usize, queue_timeout_ms: u64) -> Arc<ConcurrencyManager> {
        let config = ConcurrencyConfig {
            max_concurrency,
            queue_timeout_ms,
            enable_metrics: true,
        };
        Arc::new(ConcurrencyManager::new(&config).unwrap())
    }

    #[tokio::test]
    async fn passes_responses_through() {
        let svc = ConcurrencyLimitLayer::new(manager(2, 1000)).layer(Sleeper::new(1));
        assert_eq!(svc.oneshot(21).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_requests_queue_instead_of_failing() {
        let manager = manager(1, 30_000);
        let sleeper = Sleeper::new(100);
        let peak = sleeper.peak.clone();
        let svc = ConcurrencyLimitLayer::new(manager.clone())
            .with_label("sleeper")
            .layer(sleeper);

        let started = Instant::now();
        let (a, b) = tokio::join!(svc.clone().oneshot(1), svc.clone().oneshot(2));

        assert_eq!(a.unwrap(), 2);
        assert_eq!(b.unwrap(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(220));

        let metrics = manager.status().metrics.unwrap();
        assert_eq!(metrics.total_executions, 2);
        assert!((100..110).contains(&metrics.max_wait_time));
    }

    #[tokio::test(start_paused = true)]
    async fn inner_service_is_called_only_after_admission() {
        let manager = manager(1, 30_000);
        let sleeper = Sleeper::new(100);
        let calls = sleeper.calls.clone();
        let svc = ConcurrencyLimitLayer::new(manager.clone()).layer(sleeper);

        let first = tokio::spawn(svc.clone().oneshot(1));
        let second = tokio::spawn(svc.clone().oneshot(2));
        while manager.status().semaphore.queue_length < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(first.await.unwrap().unwrap(), 2);
        assert_eq!(second.await.unwrap().unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_surfaces_as_service_error() {
        let manager = manager(1, 50);
        let svc = ConcurrencyLimitLayer::new(manager.clone()).layer(Sleeper::new(500));

        let (held, rejected) = tokio::join!(svc.clone().oneshot(1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            svc.clone().oneshot(2).await
        });

        assert_eq!(held.unwrap(), 2);
        let err = rejected.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SemaphoreError>(),
            Some(SemaphoreError::Timeout { timeout_ms: 50 })
        ));
        assert_eq!(manager.status().metrics.unwrap().total_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_is_shared_across_services() {
        let manager = manager(2, 30_000);
        let sleeper = Sleeper::new(100);
        let peak = sleeper.peak.clone();
        let layer = ConcurrencyLimitLayer::new(manager);
        let first = layer.layer(sleeper.clone());
        let second = layer.layer(sleeper);

        let results = futures_util::future::join_all((0..6).map(|i| {
            let svc = if i % 2 == 0 { first.clone() } else { second.clone() };
            svc.oneshot(i)
        }))
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
