//! Pipeline composition: retry around the shared concurrency limit.

use std::sync::Arc;

use resilience_core::{ErrorInfo, RetryOptions};
use tower::ServiceBuilder;

use super::limit::{ConcurrencyLimitLayer, ConcurrencyLimitService};
use super::retry::{RetryLayer, RetryService};
use crate::manager::ConcurrencyManager;
use crate::registry::ResilienceRegistry;
use crate::retry::RetryExecutor;

/// Service stack produced by [`build_resilient_service`].
pub type ResilientService<S, E> = RetryService<ConcurrencyLimitService<S>, E>;

/// Wrap `inner` with the resilience layers.
///
/// Layer order (outermost to innermost):
/// 1. `RetryLayer` -- replays failed requests with backoff
/// 2. `ConcurrencyLimitLayer` -- queues each attempt for a permit
///
/// Each attempt takes and releases its own permit, so a request sleeping
/// between retries does not hold a slot other callers could use.
#[must_use]
pub fn build_resilient_service<S, E>(
    inner: S,
    manager: Arc<ConcurrencyManager>,
    executor: RetryExecutor,
    options: RetryOptions<E>,
) -> ResilientService<S, E> {
    ServiceBuilder::new()
        .layer(RetryLayer::new(executor, options))
        .layer(ConcurrencyLimitLayer::new(manager))
        .service(inner)
}

/// Same as [`build_resilient_service`], with the shared components and the
/// configured retry policy taken from `registry`.
///
/// Returns `None` if the registry holds no manager or no retry executor.
pub fn resilient_service_from_registry<S, E>(
    inner: S,
    registry: &ResilienceRegistry,
) -> Option<ResilientService<S, E>>
where
    E: ErrorInfo + 'static,
{
    let manager = registry.concurrency_manager()?;
    let executor = RetryExecutor::clone(&*registry.retry_executor()?);
    Some(build_resilient_service(
        inner,
        manager,
        executor,
        registry.retry_options(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
