//! Resilience Toolkit
//!
//! Retry, circuit breaking, idempotency and fallback primitives for wrapping
//! calls to unreliable dependencies such as payment gateways and webhook
//! targets.
//!
//! # Features
//!
//! - **Backoff strategies**: exponential with optional jitter, linear
//! - **Retry executor**: classifies errors as retryable or fatal, suspends only the calling task between attempts
//! - **Circuit breaker**: CLOSED/OPEN/HALF_OPEN state machine with a single half-open trial call
//! - **Idempotency cache**: at-most-once execution per key within a TTL, explicit expiry sweeps
//! - **Recovery context**: primary/fallback execution with an auditable attempt log
//! - **Observability**: structured `tracing` events and pluggable metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::errors::{ErrorClassifier, ServiceError};
//! use integrations_resilience::{ResilienceConfig, ResilienceOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = ResilienceOrchestrator::builder("payment-gateway", ErrorClassifier::retryable())
//!         .config(ResilienceConfig::from_env()?)
//!         .build()?;
//!
//!     let receipt = gateway
//!         .execute("charge", || async {
//!             Ok::<_, ServiceError>("ch_123".to_string())
//!         })
//!         .await?;
//!     println!("{receipt}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;

// Re-exports for convenience
pub use config::{ResilienceConfig, ResilienceConfigBuilder};
pub use errors::{ConfigError, ErrorClassifier, ResilienceError, ResilienceResult};
pub use resilience::{
    CircuitBreaker, CircuitState, ExponentialBackoff, IdempotencyManager, LinearBackoff,
    RecoveryContext, ResilienceOrchestrator, RetryExecutor, RetryStrategy,
};
