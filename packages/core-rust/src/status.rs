//! Observability snapshots for the admission primitives.
//!
//! Field names serialize in camelCase (`maxConcurrency`, `queueLength`, ...)
//! so log shippers and metrics collectors see the same shape regardless of
//! which component produced it. All durations are whole milliseconds.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SemaphoreStatus
// ---------------------------------------------------------------------------

/// Point-in-time view of a bounded semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreStatus {
    pub max_concurrency: usize,
    pub available: usize,
    pub queue_length: usize,
    /// Always `max_concurrency - available`.
    pub in_use: usize,
}

// ---------------------------------------------------------------------------
// ExecutionMetrics
// ---------------------------------------------------------------------------

/// Aggregated timing across every operation run through a concurrency manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_wait_time: u64,
    pub max_wait_time: u64,
    /// Running mean over all completed executions, successes and failures alike.
    pub average_execution_time: f64,
}

impl ExecutionMetrics {
    /// Records the time an operation spent queued for a permit.
    pub fn record_wait(&mut self, wait_ms: u64) {
        self.total_wait_time = self.total_wait_time.saturating_add(wait_ms);
        self.max_wait_time = self.max_wait_time.max(wait_ms);
    }

    pub fn record_success(&mut self, execution_ms: u64) {
        self.total_executions += 1;
        self.successful_executions += 1;
        self.update_average(execution_ms);
    }

    pub fn record_failure(&mut self, execution_ms: u64) {
        self.total_executions += 1;
        self.failed_executions += 1;
        self.update_average(execution_ms);
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_average(&mut self, execution_ms: u64) {
        let count = self.total_executions as f64;
        let total = self.average_execution_time * (count - 1.0) + execution_ms as f64;
        self.average_execution_time = total / count;
    }
}

// ---------------------------------------------------------------------------
// ManagerStatus
// ---------------------------------------------------------------------------

/// Combined status of a concurrency manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub semaphore: SemaphoreStatus,
    /// `None` when the manager was built with metrics disabled.
    pub metrics: Option<ExecutionMetrics>,
    /// Milliseconds each currently queued caller has been waiting, oldest first.
    pub queue_wait_times: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Settled
// ---------------------------------------------------------------------------

/// Outcome of one operation within a batch.
///
/// A batch never fails as a whole; each entry records either the value or the
/// original error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Settled<T, E> {
    Fulfilled { value: T },
    Rejected { reason: E },
}

impl<T, E> Settled<T, E> {
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Converts back into a `Result`, consuming the record.
    ///
    /// # Errors
    ///
    /// Returns the original error for a rejected record.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Fulfilled { value } => Ok(value),
            Self::Rejected { reason } => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settled<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Fulfilled { value },
            Err(reason) => Self::Rejected { reason },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
