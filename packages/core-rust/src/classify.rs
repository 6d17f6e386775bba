//! Error classification for retry decisions.
//!
//! The default retry predicate inspects three facets of an error:
//!
//! - a symbolic **code** (`ECONNRESET`, `ER_LOCK_DEADLOCK`, ...)
//! - an **HTTP status** (5xx and 429 are retryable)
//! - a provider error **name** (`ThrottlingException`, ...)
//!
//! Errors expose those facets through the [`ErrorInfo`] trait. Implementations
//! are provided for [`std::io::Error`], [`anyhow::Error`] and the concrete
//! [`OperationFailure`] type.

use std::fmt;
use std::io;

/// Transient network error codes.
pub const RETRYABLE_NETWORK_CODES: &[&str] = &["ECONNRESET", "ENOTFOUND", "ECONNREFUSED", "ETIMEDOUT"];

/// Database lock contention codes.
pub const RETRYABLE_DATABASE_CODES: &[&str] = &["ER_LOCK_WAIT_TIMEOUT", "ER_LOCK_DEADLOCK"];

/// Cloud-provider throttling and unavailability error names.
pub const RETRYABLE_ERROR_NAMES: &[&str] = &[
    "ThrottlingException",
    "ServiceUnavailableException",
    "InternalServerError",
    "RequestTimeout",
];

/// HTTP status signalling rate limiting.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Facets of an error consulted by [`is_retryable_by_default`].
///
/// Every method defaults to `None`, so an error type only overrides the
/// facets it actually carries.
pub trait ErrorInfo {
    /// Symbolic error code, e.g. `ECONNRESET`.
    fn error_code(&self) -> Option<&str> {
        None
    }

    /// HTTP status code associated with the failure.
    fn http_status(&self) -> Option<u16> {
        None
    }

    /// Provider-specific error name, e.g. `ThrottlingException`.
    fn error_name(&self) -> Option<&str> {
        None
    }
}

/// Default retryability predicate.
///
/// Returns `true` for transient network and database lock codes, HTTP status
/// >= 500 or == 429, and the known throttling/unavailability names. Everything
/// else is treated as permanent.
pub fn is_retryable_by_default<E: ErrorInfo + ?Sized>(error: &E) -> bool {
    if let Some(code) = error.error_code() {
        if RETRYABLE_NETWORK_CODES.contains(&code) || RETRYABLE_DATABASE_CODES.contains(&code) {
            return true;
        }
    }

    if let Some(status) = error.http_status() {
        if status >= 500 || status == STATUS_TOO_MANY_REQUESTS {
            return true;
        }
    }

    error
        .error_name()
        .is_some_and(|name| RETRYABLE_ERROR_NAMES.contains(&name))
}

// ---------------------------------------------------------------------------
// OperationFailure
// ---------------------------------------------------------------------------

/// A classified failure from an external collaborator (SDK call, HTTP request,
/// database query).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFailure {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
    pub name: Option<String>,
}

impl OperationFailure {
    /// Creates an unclassified failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.status) {
            (Some(name), _) => write!(f, "{name}: {}", self.message),
            (None, Some(status)) => write!(f, "status {status}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for OperationFailure {}

impl ErrorInfo for OperationFailure {
    fn error_code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    fn http_status(&self) -> Option<u16> {
        self.status
    }

    fn error_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Foreign error types
// ---------------------------------------------------------------------------

impl ErrorInfo for io::Error {
    fn error_code(&self) -> Option<&str> {
        match self.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Some("ECONNRESET"),
            io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
            _ => None,
        }
    }
}

impl ErrorInfo for anyhow::Error {
    fn error_code(&self) -> Option<&str> {
        if let Some(failure) = self.downcast_ref::<OperationFailure>() {
            return failure.error_code();
        }
        self.downcast_ref::<io::Error>().and_then(ErrorInfo::error_code)
    }

    fn http_status(&self) -> Option<u16> {
        self.downcast_ref::<OperationFailure>()
            .and_then(ErrorInfo::http_status)
    }

    fn error_name(&self) -> Option<&str> {
        self.downcast_ref::<OperationFailure>()
            .and_then(ErrorInfo::error_name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
