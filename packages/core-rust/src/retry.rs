//! Per-call retry options and the telemetry returned on success.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::classify::{is_retryable_by_default, ErrorInfo};

/// Predicate deciding whether an error warrants another attempt.
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Options for one retry sequence: the numeric policy plus the retryability
/// predicate.
pub struct RetryOptions<E> {
    pub policy: RetryPolicy,
    pub retryable_errors: RetryPredicate<E>,
}

impl<E> RetryOptions<E> {
    /// Options with the given policy and a caller-supplied predicate that
    /// replaces the default classifier entirely.
    pub fn with_predicate<F>(policy: RetryPolicy, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            policy,
            retryable_errors: Arc::new(predicate),
        }
    }

    /// Replaces the predicate, keeping the policy.
    #[must_use]
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable_errors = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.retryable_errors)(error)
    }
}

impl<E: ErrorInfo + 'static> RetryOptions<E> {
    /// Options with the given policy and the default classifier.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_predicate(policy, |error: &E| is_retryable_by_default(error))
    }
}

impl<E: ErrorInfo + 'static> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            retryable_errors: Arc::clone(&self.retryable_errors),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("policy", &self.policy)
            .field("retryable_errors", &"<predicate>")
            .finish()
    }
}

/// Successful outcome of a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult<T> {
    pub result: T,
    /// 1-based attempt that succeeded.
    pub attempts: u32,
    /// Sum of the backoff delays slept before success, in milliseconds.
    pub total_delay: u64,
}
