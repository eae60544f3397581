//! Error types for the resilience toolkit.
//!
//! `ResilienceError` is what every toolkit layer returns. It never swallows the
//! wrapped operation's own error: that error is either passed through as
//! [`ResilienceError::Operation`] or carried inside one of the distinctly typed
//! outcomes (retries exhausted, fallback failed). The only synthetic error is
//! [`ResilienceError::CircuitOpen`].

mod classify;
mod error;
mod service;

pub use classify::{ErrorClassifier, ErrorKind, Retryable};
pub use error::{codes, ConfigError, ResilienceError, ResilienceResult};
pub use service::{ServiceError, ServiceErrorKind, ServiceResult};
