//! Error types and classification for resilient execution
//!
//! Three families of errors live here:
//!
//! 1. [`ConfigError`]: a component was built from an invalid configuration or
//!    outside a Tokio runtime.
//! 2. [`ResilienceError`]: the single typed chain handed back from
//!    [`ResilienceManager::execute`](crate::ResilienceManager::execute). It is
//!    generic over the caller's operation error `E` and keeps fast rejections
//!    (admission control) apart from runs that actually executed and failed.
//! 3. [`ShutdownError`]: a background worker did not stop cleanly.
//!
//! [`ErrorClassification`] is the seam the retry loop uses to decide whether
//! an operation error is transient.
//!
//! | Kind | Variant | Fast rejection |
//! |------|---------|----------------|
//! | `circuit_open` | [`ResilienceError::CircuitOpen`] | yes |
//! | `rate_limited` | [`ResilienceError::RateLimited`] | yes |
//! | `bulkhead_rejected` | [`ResilienceError::BulkheadRejected`] | yes |
//! | `bulkhead_timeout` | [`ResilienceError::BulkheadTimeout`] | yes |
//! | `operation_timeout` | [`ResilienceError::OperationTimeout`] | no |
//! | `cancelled` | [`ResilienceError::Cancelled`] | no |
//! | `retry_exhausted` | [`ResilienceError::RetryExhausted`] | no |
//! | `operation` | [`ResilienceError::Operation`] | no |
//! | `shut_down` | [`ResilienceError::ShutDown`] | no |

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Invalid component configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// What was wrong.
        message: String,
    },

    /// A component that spawns a worker was built outside a Tokio runtime.
    #[error("Tokio runtime unavailable: {message}")]
    RuntimeUnavailable {
        /// Reason reported by the runtime handle lookup.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result alias for configuration validation and component construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A background worker failed to stop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// The worker ignored cancellation for longer than the grace period.
    #[error("{component} did not stop within {timeout:?}")]
    Timeout {
        /// Component that owns the worker.
        component: &'static str,
        /// Grace period that expired.
        timeout: Duration,
    },

    /// The worker task panicked or was aborted.
    #[error("{component} task failed: {message}")]
    Join {
        /// Component that owns the worker.
        component: &'static str,
        /// Join error text.
        message: String,
    },
}

/// Errors returned from resilient execution.
///
/// `E` is the caller's operation error. It is preserved untouched in
/// [`ResilienceError::Operation`] and, after retries run out, at the bottom
/// of [`ResilienceError::RetryExhausted`].
///
/// `Display` and `std::error::Error` are implemented by hand: the derive would
/// bound the impl on the boxed `last_error` itself, which never resolves.
#[derive(Debug)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit breaker is open.
    CircuitOpen,

    /// The token bucket is empty.
    RateLimited,

    /// The bulkhead queue had no free slot.
    BulkheadRejected {
        /// Configured queue capacity.
        queue_size: usize,
    },

    /// No concurrency slot was granted in time.
    BulkheadTimeout {
        /// Semaphore timeout that expired.
        timeout: Duration,
    },

    /// A single attempt ran past its deadline.
    OperationTimeout {
        /// Per-attempt deadline.
        timeout: Duration,
    },

    /// The caller cancelled the call.
    Cancelled,

    /// Every attempt failed with a retryable error.
    RetryExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Failure of the final attempt, exposed as `source()`.
        last_error: Box<ResilienceError<E>>,
    },

    /// The operation failed and the error was passed through. Display and
    /// source are the inner error's.
    Operation(E),

    /// The manager or bulkhead has been shut down.
    ShutDown,
}

impl<E> fmt::Display for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "Circuit breaker is open, rejecting calls"),
            Self::RateLimited => write!(f, "Rate limit exceeded"),
            Self::BulkheadRejected { queue_size } => {
                write!(f, "Bulkhead queue full ({queue_size} waiting)")
            }
            Self::BulkheadTimeout { timeout } => {
                write!(f, "Bulkhead permit not granted within {timeout:?}")
            }
            Self::OperationTimeout { timeout } => {
                write!(f, "Operation timed out after {timeout:?}")
            }
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::RetryExhausted { attempts, .. } => {
                write!(f, "Retry exhausted after {attempts} attempts")
            }
            Self::Operation(inner) => fmt::Display::fmt(inner, f),
            Self::ShutDown => write!(f, "Resilience engine is shut down"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { last_error, .. } => Some(last_error.as_ref()),
            Self::Operation(inner) => inner.source(),
            _ => None,
        }
    }
}

/// Result alias for resilient execution.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Stable label for logs, metrics and alert routing.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::BulkheadTimeout { .. } => "bulkhead_timeout",
            Self::OperationTimeout { .. } => "operation_timeout",
            Self::Cancelled => "cancelled",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Operation(_) => "operation",
            Self::ShutDown => "shut_down",
        }
    }

    /// True when the call was turned away before the operation ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen
                | Self::RateLimited
                | Self::BulkheadRejected { .. }
                | Self::BulkheadTimeout { .. }
        )
    }

    /// The caller's error, looking through a retry-exhausted wrapper.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(inner) => Some(inner),
            Self::RetryExhausted { last_error, .. } => last_error.operation_error(),
            _ => None,
        }
    }

    /// Owned variant of [`operation_error`](Self::operation_error).
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(inner) => Some(inner),
            Self::RetryExhausted { last_error, .. } => last_error.into_operation_error(),
            _ => None,
        }
    }
}

/// Severity for monitoring and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorSeverity {
    /// Expected condition.
    Info,
    /// Degraded but operational.
    Warning,
    /// Failure that needs attention.
    Error,
    /// Integrity at risk.
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Classification shared by every error the engine inspects.
pub trait ErrorClassification {
    /// Whether the failure is transient and worth another attempt.
    fn is_retryable(&self) -> bool;

    /// Severity for logging and alerting.
    fn severity(&self) -> ErrorSeverity;

    /// Whether the error needs immediate attention.
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Suggested wait before retrying, when the error carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: ErrorClassification + std::error::Error + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen
            | Self::RateLimited
            | Self::BulkheadRejected { .. }
            | Self::BulkheadTimeout { .. }
            | Self::OperationTimeout { .. } => true,
            Self::Operation(inner) => inner.is_retryable(),
            Self::Cancelled | Self::RetryExhausted { .. } | Self::ShutDown => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled => ErrorSeverity::Info,
            Self::CircuitOpen
            | Self::RateLimited
            | Self::BulkheadRejected { .. }
            | Self::BulkheadTimeout { .. }
            | Self::OperationTimeout { .. } => ErrorSeverity::Warning,
            Self::RetryExhausted { .. } | Self::ShutDown => ErrorSeverity::Error,
            Self::Operation(inner) => inner.severity(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Operation(inner) => inner.retry_after(),
            _ => None,
        }
    }
}

impl ErrorClassification for io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        )
    }

    fn severity(&self) -> ErrorSeverity {
        if self.is_retryable() {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }
}

/// Plain operation error for callers without their own error type.
///
/// The message doubles as the key matched against
/// [`RetryConfig::retryable_errors`](crate::RetryConfig::retryable_errors).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    message: String,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl OperationError {
    /// Transient failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true, retry_after: None }
    }

    /// Failure that another attempt will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false, retry_after: None }
    }

    /// Attach a server-suggested wait, e.g. from a `Retry-After` header.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl ErrorClassification for OperationError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn severity(&self) -> ErrorSeverity {
        if self.retryable {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for error labels, rejection grouping and classification.

    use std::error::Error as StdError;

    use super::*;

    type TestError = ResilienceError<OperationError>;

    // =========================================================================
    // Taxonomy
    // =========================================================================

    /// Validates every variant maps to its stable taxonomy label.
    #[test]
    fn test_kind_labels() {
        let cases: Vec<(TestError, &str)> = vec![
            (ResilienceError::CircuitOpen, "circuit_open"),
            (ResilienceError::RateLimited, "rate_limited"),
            (ResilienceError::BulkheadRejected { queue_size: 1 }, "bulkhead_rejected"),
            (
                ResilienceError::BulkheadTimeout { timeout: Duration::from_secs(1) },
                "bulkhead_timeout",
            ),
            (
                ResilienceError::OperationTimeout { timeout: Duration::from_secs(1) },
                "operation_timeout",
            ),
            (ResilienceError::Cancelled, "cancelled"),
            (
                ResilienceError::RetryExhausted {
                    attempts: 4,
                    last_error: Box::new(ResilienceError::Cancelled),
                },
                "retry_exhausted",
            ),
            (ResilienceError::Operation(OperationError::permanent("boom")), "operation"),
            (ResilienceError::ShutDown, "shut_down"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected);
        }
    }

    /// Validates that only admission-control errors count as rejections.
    ///
    /// Assertions:
    /// - Circuit, rate and bulkhead errors are rejections.
    /// - Exhausted retries and passthrough errors are not.
    #[test]
    fn test_rejection_grouping() {
        assert!(TestError::CircuitOpen.is_rejection());
        assert!(TestError::RateLimited.is_rejection());
        assert!(TestError::BulkheadRejected { queue_size: 3 }.is_rejection());
        assert!(TestError::BulkheadTimeout { timeout: Duration::from_millis(5) }.is_rejection());

        let exhausted = TestError::RetryExhausted {
            attempts: 2,
            last_error: Box::new(ResilienceError::Operation(OperationError::retryable("x"))),
        };
        assert!(!exhausted.is_rejection());
        assert!(!TestError::Operation(OperationError::permanent("x")).is_rejection());
    }

    // =========================================================================
    // Error chains
    // =========================================================================

    /// Validates the caller's error can be recovered from a retry-exhausted
    /// chain and that the chain is exposed through `source()`.
    #[test]
    fn test_retry_exhausted_chain() {
        let exhausted = TestError::RetryExhausted {
            attempts: 4,
            last_error: Box::new(ResilienceError::Operation(OperationError::retryable(
                "temporary failure",
            ))),
        };

        assert_eq!(exhausted.to_string(), "Retry exhausted after 4 attempts");
        assert_eq!(
            exhausted.operation_error().map(OperationError::message),
            Some("temporary failure")
        );
        let source = StdError::source(&exhausted).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("temporary failure"));

        let owned = exhausted.into_operation_error();
        assert_eq!(owned, Some(OperationError::retryable("temporary failure")));
    }

    /// Validates the error converts into a boxed `dyn Error` and that the
    /// full chain can be walked through `source()`.
    ///
    /// # Test Steps
    /// 1. Wrap an I/O error in `Operation`, then in `RetryExhausted`
    /// 2. Box it as `Box<dyn Error + Send + Sync>`
    /// 3. Walk `source()` down to the I/O error
    #[test]
    fn test_boxes_into_dyn_error_and_walks_chain() {
        let io_error = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let exhausted: ResilienceError<io::Error> = ResilienceError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(ResilienceError::Operation(io_error)),
        };
        let boxed: Box<dyn StdError + Send + Sync> = Box::new(exhausted);

        let mut chain = vec![boxed.to_string()];
        let mut current: Option<&(dyn StdError + 'static)> = boxed.source();
        while let Some(error) = current {
            chain.push(error.to_string());
            current = error.source();
        }

        assert_eq!(chain, vec!["Retry exhausted after 3 attempts", "peer reset"]);
    }

    /// Validates `?` lifts the error into `Box<dyn Error>`.
    #[test]
    fn test_question_mark_into_boxed_error() {
        fn fails() -> Result<(), Box<dyn StdError>> {
            let rejected: Result<(), TestError> = Err(TestError::CircuitOpen);
            rejected?;
            Ok(())
        }

        let error = fails().expect_err("conversion keeps the error");
        assert_eq!(error.to_string(), "Circuit breaker is open, rejecting calls");
        assert!(error.source().is_none());
    }

    /// Validates a retry hint is carried through the wrapper.
    #[test]
    fn test_retry_after_hint() {
        let hinted =
            OperationError::retryable("slow down").with_retry_after(Duration::from_secs(2));
        assert_eq!(hinted.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(TestError::Operation(hinted).retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(OperationError::retryable("x").retry_after(), None);
        assert_eq!(TestError::CircuitOpen.retry_after(), None);
    }

    /// Validates passthrough keeps the original message verbatim.
    #[test]
    fn test_operation_passthrough_is_transparent() {
        let error = TestError::Operation(OperationError::permanent("bad request"));
        assert_eq!(error.to_string(), "bad request");
        assert!(TestError::OperationTimeout { timeout: Duration::from_secs(1) }
            .operation_error()
            .is_none());
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_resilience_error_classification() {
        assert!(TestError::OperationTimeout { timeout: Duration::from_secs(1) }.is_retryable());
        assert!(!TestError::Cancelled.is_retryable());
        assert!(TestError::Operation(OperationError::retryable("x")).is_retryable());
        assert!(!TestError::Operation(OperationError::permanent("x")).is_retryable());
        assert_eq!(TestError::Cancelled.severity(), ErrorSeverity::Info);
        assert_eq!(TestError::ShutDown.severity(), ErrorSeverity::Error);
        assert!(!TestError::CircuitOpen.is_critical());
    }

    /// Validates transient I/O kinds are retryable and others are not.
    #[test]
    fn test_io_error_classification() {
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_retryable());
        assert!(io::Error::from(io::ErrorKind::ConnectionRefused).is_retryable());
        assert!(io::Error::from(io::ErrorKind::ConnectionReset).is_retryable());
        assert!(!io::Error::from(io::ErrorKind::PermissionDenied).is_retryable());
        assert_eq!(io::Error::from(io::ErrorKind::NotFound).severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ErrorSeverity::Info.to_string(), "INFO");
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
        assert_eq!(ErrorSeverity::Error.to_string(), "ERROR");
        assert_eq!(ErrorSeverity::Critical.to_string(), "CRITICAL");
        assert!(ErrorSeverity::Critical > ErrorSeverity::Warning);
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::invalid("rate must be positive");
        assert_eq!(error.to_string(), "Invalid configuration: rate must be positive");
    }
}
