//! Retry executor driving repeated attempts of an operation.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::strategy::{BackoffConfig, RetryStrategy};
use crate::errors::{ErrorClassifier, ResilienceError, ResilienceResult};
use crate::observability::{metric_names, MetricsCollector};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay policy between attempts.
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// A failed attempt that is about to be retried.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Index of the attempt that failed (0-indexed).
    pub attempt: u32,
    /// The error observed.
    pub error: &'a E,
    /// The delay chosen before the next attempt.
    pub delay: Duration,
}

/// Asynchronous retry observer.
#[async_trait]
pub trait RetryHook<E>: Send + Sync {
    /// Called before the backoff sleep of each retry. Awaited to completion.
    async fn on_retry(&self, attempt: &RetryAttempt<'_, E>);
}

/// Observer notified before each retry.
///
/// Both variants are resolved by the executor before it sleeps, so callers do
/// not need to declare anything beyond which variant they construct.
pub enum RetryObserver<E> {
    /// Synchronous callback.
    Immediate(Arc<dyn Fn(&RetryAttempt<'_, E>) + Send + Sync>),
    /// Asynchronous hook, awaited before the backoff sleep.
    Deferred(Arc<dyn RetryHook<E>>),
}

impl<E> RetryObserver<E> {
    /// Wraps a synchronous callback.
    pub fn immediate<F>(callback: F) -> Self
    where
        F: Fn(&RetryAttempt<'_, E>) + Send + Sync + 'static,
    {
        RetryObserver::Immediate(Arc::new(callback))
    }

    /// Wraps an asynchronous hook.
    pub fn deferred<H>(hook: H) -> Self
    where
        H: RetryHook<E> + 'static,
    {
        RetryObserver::Deferred(Arc::new(hook))
    }

    async fn notify(&self, attempt: &RetryAttempt<'_, E>) {
        match self {
            RetryObserver::Immediate(callback) => callback(attempt),
            RetryObserver::Deferred(hook) => hook.on_retry(attempt).await,
        }
    }
}

impl<E> Clone for RetryObserver<E> {
    fn clone(&self) -> Self {
        match self {
            RetryObserver::Immediate(callback) => RetryObserver::Immediate(Arc::clone(callback)),
            RetryObserver::Deferred(hook) => RetryObserver::Deferred(Arc::clone(hook)),
        }
    }
}

impl<E> fmt::Debug for RetryObserver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryObserver::Immediate(_) => f.write_str("RetryObserver::Immediate"),
            RetryObserver::Deferred(_) => f.write_str("RetryObserver::Deferred"),
        }
    }
}

/// Retry executor with a pluggable backoff strategy.
pub struct RetryExecutor<E> {
    max_attempts: u32,
    strategy: Arc<dyn RetryStrategy>,
    retryable: ErrorClassifier<E>,
    observer: Option<RetryObserver<E>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<E> RetryExecutor<E> {
    /// Creates a new retry executor.
    ///
    /// Errors matched by `retryable` are retried; every other error is returned
    /// on first occurrence.
    pub fn new(
        max_attempts: u32,
        strategy: Arc<dyn RetryStrategy>,
        retryable: ErrorClassifier<E>,
    ) -> Self {
        Self {
            max_attempts,
            strategy,
            retryable,
            observer: None,
            metrics: None,
        }
    }

    /// Creates a retry executor from configuration.
    pub fn from_config(config: &RetryConfig, retryable: ErrorClassifier<E>) -> Self {
        Self::new(config.max_attempts, config.backoff.build_strategy(), retryable)
    }

    /// Sets the retry observer.
    pub fn with_observer(mut self, observer: RetryObserver<E>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the configured attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Executes `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out.
    ///
    /// Only the current task is suspended during backoff.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut last_error: Option<E> = None;

        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !self.retryable.matches(&err) => {
                    debug!(operation, attempt, error = %err, "Non-retryable error, not retrying");
                    return Err(ResilienceError::Operation(err));
                }
                Err(err) => {
                    if attempt + 1 >= self.max_attempts {
                        last_error = Some(err);
                        continue;
                    }

                    let delay = self.strategy.get_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable error, scheduling retry"
                    );
                    self.record_retry(operation, delay);

                    if let Some(observer) = &self.observer {
                        observer
                            .notify(&RetryAttempt {
                                attempt,
                                error: &err,
                                delay,
                            })
                            .await;
                    }

                    tokio::time::sleep(delay).await;
                }
            }
        }

        match last_error {
            Some(last_error) => {
                error!(
                    operation,
                    attempts = self.max_attempts,
                    error = %last_error,
                    "Retries exhausted"
                );
                Err(ResilienceError::RetriesExhausted {
                    attempts: self.max_attempts,
                    last_error,
                })
            }
            None => Err(ResilienceError::NoResult),
        }
    }

    fn record_retry(&self, operation: &str, delay: Duration) {
        if let Some(metrics) = &self.metrics {
            let labels = [("operation", operation)];
            metrics.increment_counter(metric_names::RETRY_ATTEMPTS, 1, &labels);
            metrics.record_histogram(
                metric_names::RETRY_DELAY_MS,
                delay.as_secs_f64() * 1000.0,
                &labels,
            );
        }
    }
}

impl<E> fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("retryable", &self.retryable)
            .field("observer", &self.observer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::observability::InMemoryMetricsCollector;
    use crate::resilience::{ExponentialBackoff, LinearBackoff};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fixed(delay_ms: u64) -> Arc<dyn RetryStrategy> {
        Arc::new(LinearBackoff::new(
            Duration::from_millis(delay_ms),
            Duration::ZERO,
        ))
    }

    fn executor(max_attempts: u32) -> RetryExecutor<ServiceError> {
        RetryExecutor::new(max_attempts, fixed(10), ErrorClassifier::retryable())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = executor(3)
            .execute("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ServiceError>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_runs_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: ResilienceResult<(), _> = executor(3)
            .execute("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::timeout("gateway timeout"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ResilienceError::RetriesExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, ServiceError::timeout("gateway timeout"));
            }
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: ResilienceResult<(), _> = executor(3)
            .execute("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::validation("amount must be positive"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(
            result,
            Err(ResilienceError::Operation(ServiceError::Validation { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = executor(3)
            .execute("charge", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ServiceError::network("connection reset"))
                } else {
                    Ok("ch_123")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ch_123");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_never_sleeps() {
        let start = Instant::now();
        let observed = Arc::new(AtomicU32::new(0));
        let observed_clone = Arc::clone(&observed);
        let result: ResilienceResult<(), _> = executor(1)
            .with_observer(RetryObserver::immediate(move |_| {
                observed_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .execute("charge", || async { Err(ServiceError::timeout("slow")) })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_returns_no_result() {
        let calls = AtomicU32::new(0);
        let result: ResilienceResult<(), ServiceError> = executor(0)
            .execute("charge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::NoResult)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_observer_sees_attempt_error_and_delay() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let strategy = Arc::new(ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            false,
        ));

        let _: ResilienceResult<(), _> = RetryExecutor::new(3, strategy, ErrorClassifier::any())
            .with_observer(RetryObserver::immediate(
                move |attempt: &RetryAttempt<'_, ServiceError>| {
                    seen_clone
                        .lock()
                        .push((attempt.attempt, attempt.error.to_string(), attempt.delay));
                },
            ))
            .execute("charge", || async { Err(ServiceError::network("down")) })
            .await;

        assert_eq!(
            *seen.lock(),
            vec![
                (0, "Network error: down".to_string(), Duration::from_millis(100)),
                (1, "Network error: down".to_string(), Duration::from_millis(200)),
            ]
        );
    }

    struct SlowHook {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RetryHook<ServiceError> for SlowHook {
        async fn on_retry(&self, _attempt: &RetryAttempt<'_, ServiceError>) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_observer_is_awaited_before_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let _: ResilienceResult<(), _> = executor(3)
            .with_observer(RetryObserver::deferred(SlowHook {
                calls: Arc::clone(&calls),
            }))
            .execute("charge", || async { Err(ServiceError::timeout("slow")) })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // two hook waits of 5ms plus two backoff sleeps of 10ms
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_retry_metrics() {
        let metrics = Arc::new(InMemoryMetricsCollector::new());
        let _: ResilienceResult<(), _> = executor(3)
            .with_metrics(metrics.clone())
            .execute("webhook", || async { Err(ServiceError::timeout("slow")) })
            .await;

        let key = format!("{}:operation=webhook", metric_names::RETRY_ATTEMPTS);
        assert_eq!(metrics.get_counter(&key), 2);
    }

    #[test]
    fn test_from_config() {
        let executor: RetryExecutor<ServiceError> =
            RetryExecutor::from_config(&RetryConfig::default(), ErrorClassifier::retryable());
        assert_eq!(executor.max_attempts(), 3);
        assert!(format!("{executor:?}").contains("retryable"));
    }
}
