//! Retry executor with exponential backoff and jitter.
//!
//! State machine per call: `Running(attempt) -> Success | Retrying(attempt + 1) | Exhausted`.
//! The executor consumes an error only to decide whether to retry; once the
//! attempts run out or the predicate says no, the *original* error is returned
//! so callers can still inspect its status code or provider name.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use resilience_core::{JitterSource, RetryOptions, RetryPolicy, RetryResult};

// ---------------------------------------------------------------------------
// RandomJitter
// ---------------------------------------------------------------------------

/// Uniform jitter drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn unit_offset(&mut self) -> f64 {
        rand::random_range(-1.0..=1.0)
    }
}

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

/// Runs an operation until it succeeds, the attempts are exhausted, or the
/// retry predicate rejects the error.
///
/// The executor holds no per-call state; one instance can be shared by any
/// number of concurrent callers.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    /// Overrides [`RandomJitter`] when set.
    jitter: Option<Arc<Mutex<Box<dyn JitterSource>>>>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given source instead of the thread RNG for jitter offsets.
    #[must_use]
    pub fn with_jitter_source(source: impl JitterSource + 'static) -> Self {
        Self {
            jitter: Some(Arc::new(Mutex::new(Box::new(source)))),
        }
    }

    /// Invokes `operation` up to `options.policy.max_attempts` times, sleeping
    /// with exponential backoff between attempts.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt, unchanged, when the attempts are
    /// exhausted or the error is not retryable.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        options: &RetryOptions<E>,
    ) -> Result<RetryResult<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let policy = &options.policy;
        let max_attempts = policy.attempt_limit();
        let mut total_delay: u64 = 0;
        let mut attempt: u32 = 1;

        loop {
            tracing::debug!(attempt, max_attempts, "executing operation");

            let err = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::info!(
                            attempt,
                            max_attempts,
                            total_delay_ms = total_delay,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(RetryResult {
                        result,
                        attempts: attempt,
                        total_delay,
                    });
                }
                Err(err) => err,
            };

            tracing::warn!(attempt, max_attempts, error = %err, "operation attempt failed");

            if !policy.has_attempts_after(attempt) || !options.is_retryable(&err) {
                tracing::error!(
                    attempts = attempt,
                    total_delay_ms = total_delay,
                    error = %err,
                    "operation failed permanently"
                );
                return Err(err);
            }

            let delay = self.delay_after(policy, attempt);
            total_delay = total_delay.saturating_add(delay);
            tracing::debug!(
                delay_ms = delay,
                next_attempt = attempt + 1,
                max_attempts,
                "waiting before retry"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    fn delay_after(&self, policy: &RetryPolicy, attempt: u32) -> u64 {
        match &self.jitter {
            Some(source) => policy.delay_for(attempt, source.lock().as_mut()),
            None => policy.delay_for(attempt, &mut RandomJitter),
        }
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("custom_jitter", &self.jitter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
