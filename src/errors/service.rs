//! Error taxonomy for calls to external billing dependencies.
//!
//! Payment gateways and webhook targets fail in two broad ways: transiently
//! (network, timeouts, throttling, 5xx) and permanently (validation, business
//! rules, auth). Only the transient kinds are retryable.

use std::time::Duration;
use thiserror::Error;

use super::classify::{ErrorKind, Retryable};

/// Result type alias for calls to external dependencies.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error raised by a call to an external dependency.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection failure (refused, reset, DNS).
    #[error("Network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The dependency did not answer in time.
    #[error("Timeout: {message}")]
    Timeout {
        /// Error message.
        message: String,
    },

    /// The dependency throttled the caller.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Error message.
        message: String,
        /// Duration the dependency asked the caller to wait.
        retry_after: Option<Duration>,
    },

    /// The dependency is down or returned a 5xx status.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
        /// HTTP status code, when the failure came from an HTTP response.
        status: Option<u16>,
    },

    /// The request was rejected as malformed.
    #[error("Validation error: {message}")]
    Validation {
        /// Error message.
        message: String,
        /// The field that failed validation.
        field: Option<String>,
    },

    /// The request was well formed but violates a business rule (card declined, limit reached).
    #[error("Business rule violation: {message}")]
    BusinessRule {
        /// Error message.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Error message.
        message: String,
    },

    /// The referenced resource does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// Error message.
        message: String,
    },

    /// The request conflicts with the current state of the resource.
    #[error("Conflict: {message}")]
    Conflict {
        /// Error message.
        message: String,
    },
}

/// Discriminant of [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceErrorKind {
    /// See [`ServiceError::Network`].
    Network,
    /// See [`ServiceError::Timeout`].
    Timeout,
    /// See [`ServiceError::RateLimited`].
    RateLimited,
    /// See [`ServiceError::Unavailable`].
    Unavailable,
    /// See [`ServiceError::Validation`].
    Validation,
    /// See [`ServiceError::BusinessRule`].
    BusinessRule,
    /// See [`ServiceError::Authentication`].
    Authentication,
    /// See [`ServiceError::NotFound`].
    NotFound,
    /// See [`ServiceError::Conflict`].
    Conflict,
}

impl ServiceError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        ServiceError::Network {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        ServiceError::Timeout {
            message: message.into(),
        }
    }

    /// Creates a validation error without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Creates a business rule violation.
    pub fn business_rule(message: impl Into<String>) -> Self {
        ServiceError::BusinessRule {
            message: message.into(),
        }
    }

    /// Maps an HTTP status code returned by a dependency to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 422 => ServiceError::Validation {
                message,
                field: None,
            },
            401 | 403 => ServiceError::Authentication { message },
            402 => ServiceError::BusinessRule { message },
            404 | 410 => ServiceError::NotFound { message },
            408 | 504 => ServiceError::Timeout { message },
            409 => ServiceError::Conflict { message },
            429 => ServiceError::RateLimited {
                message,
                retry_after: None,
            },
            _ => ServiceError::Unavailable {
                message,
                status: Some(status),
            },
        }
    }

    /// Returns the wait duration requested by the dependency, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl ErrorKind for ServiceError {
    type Kind = ServiceErrorKind;

    fn kind(&self) -> ServiceErrorKind {
        match self {
            ServiceError::Network { .. } => ServiceErrorKind::Network,
            ServiceError::Timeout { .. } => ServiceErrorKind::Timeout,
            ServiceError::RateLimited { .. } => ServiceErrorKind::RateLimited,
            ServiceError::Unavailable { .. } => ServiceErrorKind::Unavailable,
            ServiceError::Validation { .. } => ServiceErrorKind::Validation,
            ServiceError::BusinessRule { .. } => ServiceErrorKind::BusinessRule,
            ServiceError::Authentication { .. } => ServiceErrorKind::Authentication,
            ServiceError::NotFound { .. } => ServiceErrorKind::NotFound,
            ServiceError::Conflict { .. } => ServiceErrorKind::Conflict,
        }
    }
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Network { .. }
                | ServiceError::Timeout { .. }
                | ServiceError::RateLimited { .. }
                | ServiceError::Unavailable { .. }
        )
    }
}
