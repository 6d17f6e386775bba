//! Exponential backoff with jitter.
//!
//! [`RetryPolicy`] holds the numeric knobs of a retry sequence and computes the
//! delay inserted after each failed attempt:
//!
//! ```text
//! delay(attempt) = min(base_delay_ms * backoff_multiplier^(attempt - 1), max_delay_ms)
//! ```
//!
//! With jitter enabled the delay is perturbed by a uniform offset of up to 25%
//! in either direction, floored at zero and truncated to whole milliseconds.
//! The randomness comes from a [`JitterSource`] so callers can inject a
//! deterministic source in tests.

use serde::{Deserialize, Serialize};

/// Fraction of the computed delay used as the jitter range (in each direction).
pub const JITTER_RATIO: f64 = 0.25;

// ---------------------------------------------------------------------------
// JitterSource
// ---------------------------------------------------------------------------

/// Source of uniformly distributed jitter samples.
///
/// Implementations return a value in `[-1.0, 1.0]`; the policy scales it by
/// [`JITTER_RATIO`] of the delay.
pub trait JitterSource: Send {
    /// Returns the next unit offset in `[-1.0, 1.0]`.
    fn unit_offset(&mut self) -> f64;
}

/// Jitter source that always returns zero (no perturbation).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn unit_offset(&mut self) -> f64 {
        0.0
    }
}

/// Jitter source replaying a fixed offset. Useful for exercising the bounds.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn unit_offset(&mut self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// PolicyError
// ---------------------------------------------------------------------------

/// Rejected [`RetryPolicy`] values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff_multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("base_delay_ms ({base_delay_ms}) exceeds max_delay_ms ({max_delay_ms})")]
    BaseExceedsMax { base_delay_ms: u64, max_delay_ms: u64 },
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Numeric configuration for a retry sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of operation invocations, including the first. Default 3.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds. Default 1000.
    pub base_delay_ms: u64,
    /// Ceiling applied to every computed delay, in milliseconds. Default 30000.
    pub max_delay_ms: u64,
    /// Growth factor between successive delays. Default 2.
    pub backoff_multiplier: f64,
    /// Whether to perturb delays by up to +/-25%. Default true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Checks the policy for values that would make the backoff meaningless.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PolicyError::BaseExceedsMax {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            });
        }
        Ok(())
    }

    /// Un-jittered delay after the given failed attempt (1-based), capped at
    /// `max_delay_ms`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn base_delay_for(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        if capped.is_nan() || capped <= 0.0 {
            0
        } else {
            capped as u64
        }
    }

    /// Delay to sleep after the given failed attempt (1-based), with jitter
    /// applied when enabled.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32, jitter: &mut dyn JitterSource) -> u64 {
        let delay = self.base_delay_for(attempt);
        if !self.jitter {
            return delay;
        }

        let delay = delay as f64;
        let offset = jitter.unit_offset().clamp(-1.0, 1.0) * delay * JITTER_RATIO;
        (delay + offset).max(0.0).floor() as u64
    }

    /// Total attempts a retry loop runs, counting the first one. A zero
    /// `max_attempts` (rejected by [`validate`](Self::validate)) still runs once.
    #[must_use]
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    /// Numbering is inclusive: attempt `attempt_limit()` is the last one.
    #[must_use]
    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.attempt_limit()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
