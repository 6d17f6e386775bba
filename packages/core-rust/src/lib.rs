//! Resilience core: backoff arithmetic, error classification and status types
//! shared by the admission-control runtime.
//!
//! Nothing in this crate depends on an async runtime; the tokio-backed
//! semaphore, concurrency manager and retry executor live in
//! `resilience-runtime`.

pub mod backoff;
pub mod classify;
pub mod retry;
pub mod status;

pub use backoff::{FixedJitter, JitterSource, NoJitter, PolicyError, RetryPolicy, JITTER_RATIO};
pub use classify::{is_retryable_by_default, ErrorInfo, OperationFailure};
pub use retry::{RetryOptions, RetryPredicate, RetryResult};
pub use status::{ExecutionMetrics, ManagerStatus, SemaphoreStatus, Settled};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
