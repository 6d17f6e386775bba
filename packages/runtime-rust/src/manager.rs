//! Concurrency manager: runs caller-supplied operations under a shared
//! [`BoundedSemaphore`] and aggregates wait/execution timing.
//!
//! The manager is a pure admission-control layer. It never retries, wraps or
//! swallows operation errors; they come back to the caller verbatim after the
//! metrics are updated and the permit is released. A queue timeout is the only
//! error the manager itself produces, and it reaches the caller through the
//! caller's own error type (`E: From<SemaphoreError>`).

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use resilience_core::{ExecutionMetrics, ManagerStatus, Settled};
use tokio::time::Instant;

use crate::config::{ConcurrencyConfig, ConfigError};
use crate::semaphore::{duration_ms, BoundedSemaphore, SemaphoreError};

const UNKNOWN_OPERATION: &str = "unknown";
const DEFAULT_BATCH_PREFIX: &str = "batch";

/// Outcome label attached to the `resilience_executions_total` counter.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyManager
// ---------------------------------------------------------------------------

/// Bounds how many operations run at once; excess callers queue FIFO until a
/// permit frees up or the queue timeout expires.
pub struct ConcurrencyManager {
    semaphore: BoundedSemaphore,
    /// `None` when metrics are disabled.
    metrics: Option<Mutex<ExecutionMetrics>>,
}

impl ConcurrencyManager {
    /// Creates a manager from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit or queue timeout is zero.
    pub fn new(config: &ConcurrencyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(
            max_concurrency = config.max_concurrency,
            queue_timeout_ms = config.queue_timeout_ms,
            enable_metrics = config.enable_metrics,
            "concurrency manager initialized"
        );
        Ok(Self {
            semaphore: BoundedSemaphore::new(config.max_concurrency, config.queue_timeout()),
            metrics: config
                .enable_metrics
                .then(|| Mutex::new(ExecutionMetrics::default())),
        })
    }

    /// Shorthand for a manager with the given limit and default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_concurrency` is zero.
    pub fn with_max_concurrency(max_concurrency: usize) -> Result<Self, ConfigError> {
        Self::new(&ConcurrencyConfig::with_max_concurrency(max_concurrency))
    }

    #[must_use]
    pub fn semaphore(&self) -> &BoundedSemaphore {
        &self.semaphore
    }

    /// Runs `operation` once a permit is held and returns its result unchanged.
    ///
    /// The permit is released on every exit path: success, error, or a panic
    /// inside the operation (which is recorded as a failure and then resumed).
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or `E::from(SemaphoreError::Timeout)`
    /// if no permit was granted within the queue timeout (in which case the
    /// operation never runs).
    pub async fn execute<F, Fut, T, E>(&self, operation: F, operation_id: Option<&str>) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SemaphoreError>,
    {
        let operation_id = operation_id.unwrap_or(UNKNOWN_OPERATION);

        let wait_start = Instant::now();
        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::warn!(operation_id, error = %err, "operation rejected before admission");
                return Err(E::from(err));
            }
        };
        let wait_ms = duration_ms(wait_start.elapsed());
        self.record_wait(wait_ms);
        tracing::debug!(operation_id, wait_ms, "operation acquired permit");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;
        let execution_ms = duration_ms(started.elapsed());

        match outcome {
            Ok(Ok(value)) => {
                self.record_completion(Outcome::Success, execution_ms);
                drop(permit);
                tracing::debug!(operation_id, execution_ms, "operation completed");
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_completion(Outcome::Failure, execution_ms);
                drop(permit);
                tracing::warn!(operation_id, execution_ms, "operation failed");
                Err(err)
            }
            Err(panic) => {
                self.record_completion(Outcome::Failure, execution_ms);
                drop(permit);
                tracing::error!(operation_id, execution_ms, "operation panicked");
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Runs every operation concurrently under the shared limit and waits for
    /// all of them to settle.
    ///
    /// Never fails as a whole: each entry of the returned vector, in input
    /// order, holds the value or the original error of the matching operation.
    /// Operation ids are `"{prefix}-{index}"` (prefix defaults to `"batch"`).
    pub async fn execute_all<I, F, Fut, T, E>(
        &self,
        operations: I,
        operation_prefix: Option<&str>,
    ) -> Vec<Settled<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SemaphoreError>,
    {
        let prefix = operation_prefix.unwrap_or(DEFAULT_BATCH_PREFIX);
        let pending: Vec<_> = operations
            .into_iter()
            .enumerate()
            .map(|(index, operation)| {
                let operation_id = format!("{prefix}-{index}");
                async move { Settled::from(self.execute(operation, Some(&operation_id)).await) }
            })
            .collect();

        tracing::info!(count = pending.len(), prefix, "executing batch with concurrency control");
        let results = join_all(pending).await;

        let successful = results.iter().filter(|r| r.is_fulfilled()).count();
        tracing::info!(
            successful,
            failed = results.len() - successful,
            "batch execution completed"
        );
        results
    }

    /// Semaphore state, aggregated metrics (`None` if disabled) and the wait
    /// times of currently queued callers.
    #[must_use]
    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            semaphore: self.semaphore.status(),
            metrics: self.metrics.as_ref().map(|m| m.lock().clone()),
            queue_wait_times: self
                .semaphore
                .queue_wait_times()
                .into_iter()
                .map(duration_ms)
                .collect(),
        }
    }

    /// Zeroes the aggregated metrics. Running and queued operations are not
    /// affected.
    pub fn reset_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            *metrics.lock() = ExecutionMetrics::default();
            tracing::debug!("concurrency metrics reset");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_wait(&self, wait_ms: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.lock().record_wait(wait_ms);
            metrics::histogram!("resilience_wait_ms").record(wait_ms as f64);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_completion(&self, outcome: Outcome, execution_ms: u64) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        {
            let mut metrics = metrics.lock();
            match outcome {
                Outcome::Success => metrics.record_success(execution_ms),
                Outcome::Failure => metrics.record_failure(execution_ms),
            }
        }
        metrics::histogram!("resilience_execution_ms").record(execution_ms as f64);
        metrics::counter!("resilience_executions_total", "outcome" => outcome.as_str()).increment(1);
    }
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("semaphore", &self.semaphore)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
