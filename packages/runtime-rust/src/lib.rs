//! Resilience runtime: tokio-backed admission control and retries.
//!
//! A [`BoundedSemaphore`] caps how many operations run at once and queues the
//! rest FIFO with a timeout. The [`ConcurrencyManager`] runs operations under
//! that semaphore and aggregates wait/execution metrics, the
//! [`RetryExecutor`] re-invokes failed operations with exponential backoff,
//! and the [`middleware`] module exposes both as tower layers. One shared set
//! of components is wired by [`ResilienceRegistry::configure`].

pub mod config;
pub mod manager;
pub mod middleware;
pub mod registry;
pub mod retry;
pub mod semaphore;

pub use config::{ConcurrencyConfig, ConfigError, ResilienceConfig};
pub use manager::ConcurrencyManager;
pub use middleware::{
    build_resilient_service, resilient_service_from_registry, ConcurrencyLimitLayer, RetryLayer,
};
pub use registry::{ComponentContext, ManagedComponent, ResilienceRegistry};
pub use retry::{RandomJitter, RetryExecutor};
pub use semaphore::{BoundedSemaphore, Permit, SemaphoreError, DEFAULT_ACQUIRE_TIMEOUT};
