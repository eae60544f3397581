//! Toolkit and configuration error types.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for operations guarded by the toolkit.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Machine-readable codes attached to every [`ResilienceError`] variant.
pub mod codes {
    /// The wrapped operation failed with an error that was not retried.
    pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
    /// Every retry attempt failed with a retryable error.
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
    /// The circuit breaker rejected the call without invoking the operation.
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// Both the primary and the fallback leg failed.
    pub const FALLBACK_FAILED: &str = "FALLBACK_FAILED";
    /// The retry loop finished without producing a result.
    pub const NO_RESULT: &str = "NO_RESULT";
}

/// Error returned by every toolkit layer.
///
/// `E` is the caller's operation error type. Any `E` converts into
/// `ResilienceError<E>` through `From`, which is what lets a circuit breaker
/// wrap either a raw operation or a retry executor with the same signature.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The operation failed with an error that was not retried. Passed through unchanged.
    Operation(E),

    /// All attempts failed with retryable errors; `last_error` is the final one.
    RetriesExhausted {
        /// Number of attempts performed.
        attempts: u32,
        /// The error observed on the last attempt.
        last_error: E,
    },

    /// The circuit breaker is open and rejected the call.
    CircuitOpen {
        /// Name of the breaker that rejected the call.
        circuit: String,
        /// Machine-readable code, always [`codes::CIRCUIT_OPEN`].
        code: &'static str,
        /// Human-facing recovery hint.
        hint: String,
        /// Time until the breaker lets a trial call through.
        retry_after: Duration,
    },

    /// The primary leg failed and so did the fallback. Holds the fallback's error.
    FallbackFailed {
        /// The error raised by the fallback leg.
        fallback: Box<ResilienceError<E>>,
    },

    /// The retry loop completed without a result (executor configured with zero attempts).
    NoResult,
}

impl<E> ResilienceError<E> {
    /// Builds the synthetic circuit-open error.
    pub fn circuit_open(circuit: impl Into<String>, retry_after: Duration) -> Self {
        let circuit = circuit.into();
        let hint = if retry_after.is_zero() {
            format!("'{circuit}' is probing the dependency with a trial call; retry shortly")
        } else {
            format!(
                "'{circuit}' is failing fast; retry in {}ms",
                retry_after.as_millis()
            )
        };
        ResilienceError::CircuitOpen {
            circuit,
            code: codes::CIRCUIT_OPEN,
            hint,
            retry_after,
        }
    }

    /// Returns the machine-readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            ResilienceError::Operation(_) => codes::OPERATION_FAILED,
            ResilienceError::RetriesExhausted { .. } => codes::RETRIES_EXHAUSTED,
            ResilienceError::CircuitOpen { code, .. } => *code,
            ResilienceError::FallbackFailed { .. } => codes::FALLBACK_FAILED,
            ResilienceError::NoResult => codes::NO_RESULT,
        }
    }

    /// Returns the underlying operation error, if this error carries one.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error),
            ResilienceError::FallbackFailed { fallback } => fallback.operation_error(),
            ResilienceError::CircuitOpen { .. } | ResilienceError::NoResult => None,
        }
    }

    /// Consumes the error and returns the underlying operation error, if any.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error),
            ResilienceError::FallbackFailed { fallback } => fallback.into_operation_error(),
            ResilienceError::CircuitOpen { .. } | ResilienceError::NoResult => None,
        }
    }

    /// Returns true if the call was rejected by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Returns true if the retry budget was exhausted.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, ResilienceError::RetriesExhausted { .. })
    }

    /// Returns true if both legs of a recovery context failed.
    pub fn is_fallback_failure(&self) -> bool {
        matches!(self, ResilienceError::FallbackFailed { .. })
    }

    /// Returns the time to wait before calling again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl<E> From<E> for ResilienceError<E> {
    fn from(error: E) -> Self {
        ResilienceError::Operation(error)
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Operation(e) => write!(f, "{e}"),
            ResilienceError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "Retries exhausted after {attempts} attempt(s): {last_error}"),
            ResilienceError::CircuitOpen { circuit, hint, .. } => {
                write!(f, "Circuit '{circuit}' is open: {hint}")
            }
            ResilienceError::FallbackFailed { fallback } => {
                write!(f, "Fallback also failed: {fallback}")
            }
            ResilienceError::NoResult => write!(f, "Retry loop completed without a result"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResilienceError::Operation(e) => Some(e),
            ResilienceError::RetriesExhausted { last_error, .. } => Some(last_error),
            ResilienceError::FallbackFailed { fallback } => Some(fallback.as_ref()),
            ResilienceError::CircuitOpen { .. } | ResilienceError::NoResult => None,
        }
    }
}

/// Configuration error (invalid values, unparseable environment variables).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value violates its constraint.
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the violated constraint.
        message: String,
    },

    /// An environment variable could not be parsed.
    #[error("Invalid value '{value}' for environment variable {var}: {message}")]
    Environment {
        /// Name of the variable.
        var: String,
        /// The raw value that failed to parse.
        value: String,
        /// Parse failure description.
        message: String,
    },

    /// The global tracing subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}
