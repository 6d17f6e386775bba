//! Configuration for the admission-control components.

use std::time::Duration;

use resilience_core::{PolicyError, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Errors from validating or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("queue_timeout_ms must be at least 1")]
    ZeroQueueTimeout,
    #[error("invalid retry policy: {0}")]
    Retry(#[from] PolicyError),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// ConcurrencyConfig
// ---------------------------------------------------------------------------

/// Settings for a `ConcurrencyManager`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    /// Maximum number of operations holding a permit at once.
    pub max_concurrency: usize,
    /// How long a caller may wait in the queue before failing, in milliseconds.
    pub queue_timeout_ms: u64,
    /// Whether to aggregate wait/execution metrics.
    pub enable_metrics: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_timeout_ms: 30_000,
            enable_metrics: true,
        }
    }
}

impl ConcurrencyConfig {
    /// Config with the given limit and default timeout/metrics settings.
    #[must_use]
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// # Errors
    ///
    /// Returns an error if the limit or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.queue_timeout_ms == 0 {
            return Err(ConfigError::ZeroQueueTimeout);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ResilienceConfig
// ---------------------------------------------------------------------------

/// Application-wide settings: one shared concurrency limit plus the retry
/// policy used when none is supplied per call.
///
/// Defaults: 10 concurrent operations, 60 second queue timeout, metrics on,
/// and the [`RetryPolicy`] defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig {
                max_concurrency: 10,
                queue_timeout_ms: 60_000,
                enable_metrics: true,
            },
            retry: RetryPolicy::default(),
        }
    }
}

impl ResilienceConfig {
    /// Parses and validates a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or any value fails validation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.concurrency.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}
