//! Resilience primitives: backoff strategies, retry executor, circuit breaker,
//! idempotency cache and primary/fallback recovery.

mod circuit_breaker;
mod idempotency;
mod orchestrator;
mod recovery;
mod retry;
mod strategy;


pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerHook, CircuitBreakerSnapshot, CircuitState,
};
pub use idempotency::{IdempotencyConfig, IdempotencyManager};
pub use orchestrator::{ResilienceOrchestrator, ResilienceOrchestratorBuilder};
pub use recovery::{
    named, AttemptRecord, InMemoryStateStore, NamedOperation, RecoveryConfig, RecoveryContext,
    RecoveryLeg, RecoveryReport, RecoveryState, RecoveryStateStore,
};
pub use retry::{RetryAttempt, RetryConfig, RetryExecutor, RetryHook, RetryObserver};
pub use strategy::{
    BackoffConfig, ExponentialBackoff, JitterSource, LinearBackoff, OsJitter, RetryStrategy,
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, JITTER_MAX, JITTER_MIN,
};
