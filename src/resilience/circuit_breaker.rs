//! Circuit breaker pattern for fault tolerance.
//!
//! State is checked lazily at call time; there is no background timer. The
//! lock guarding the counters is only held for the gate check and the outcome
//! update, never while the wrapped operation runs, so calls admitted before
//! the breaker opens still report their outcomes afterwards.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{ErrorClassifier, ResilienceError, ResilienceResult};
use crate::observability::{metric_names, MetricsCollector};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, a single trial call is let through
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of counted failures that opens the circuit
    pub failure_threshold: u32,
    /// How long after the last failure the circuit stays open
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Hook for circuit breaker state changes.
pub trait CircuitBreakerHook: Send + Sync {
    /// Called after the state changed. Never called while the breaker's lock is held.
    fn on_state_change(&self, circuit: &str, old_state: CircuitState, new_state: CircuitState);
}

/// Point-in-time view of a breaker, for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures counted since the breaker last closed.
    pub failure_count: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Milliseconds since the last counted failure.
    pub last_failure_age_ms: Option<u64>,
    /// Milliseconds until a trial call is allowed, when open.
    pub retry_after_ms: Option<u64>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            trial_in_flight: false,
        }
    }
}

/// Permission to run one call. Releases the half-open trial slot when dropped,
/// including when the caller's future is cancelled mid-call.
struct Admission<'a> {
    state: &'a Mutex<BreakerState>,
    trial: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.state.lock().trial_in_flight = false;
        }
    }
}

type Transition = (CircuitState, CircuitState);

/// Circuit breaker guarding one dependency.
///
/// Create one per dependency and share it (for example behind an `Arc`)
/// across every call to that dependency.
pub struct CircuitBreaker<E> {
    name: String,
    config: CircuitBreakerConfig,
    expected_error: ErrorClassifier<E>,
    state: Mutex<BreakerState>,
    hook: Option<Arc<dyn CircuitBreakerHook>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<E> CircuitBreaker<E> {
    /// Creates a breaker. Only errors matched by `expected_error` count as failures.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        expected_error: ErrorClassifier<E>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            expected_error,
            state: Mutex::new(BreakerState::default()),
            hook: None,
            metrics: None,
        }
    }

    /// Sets a state change hook.
    pub fn with_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Sets a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the stored state. An open breaker whose timeout has elapsed
    /// still reports `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns the number of failures counted since the breaker last closed.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Returns when the last counted failure happened.
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.state.lock().last_failure_time
    }

    /// Returns the time until a trial call is allowed, or `None` unless open.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let state = self.state.lock();
        self.remaining_open_time(&state)
    }

    /// Returns a serialisable snapshot of the breaker.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_age_ms: state
                .last_failure_time
                .map(|t| t.elapsed().as_millis() as u64),
            retry_after_ms: self
                .remaining_open_time(&state)
                .map(|d| d.as_millis() as u64),
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let old = {
            let mut state = self.state.lock();
            let old = state.state;
            *state = BreakerState::default();
            old
        };
        debug!(circuit = %self.name, "Circuit breaker reset to CLOSED");
        if old != CircuitState::Closed {
            self.notify((old, CircuitState::Closed));
        }
    }

    /// Calls `f` through the breaker.
    ///
    /// While open, returns [`ResilienceError::CircuitOpen`] without invoking `f`.
    /// `f` may return either a raw operation error or a toolkit error (for
    /// example from a wrapped [`RetryExecutor`](super::RetryExecutor)).
    pub async fn call<F, Fut, T, X>(&self, f: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, X>>,
        X: Into<ResilienceError<E>>,
    {
        let admission = self.acquire()?;
        let trial = admission.trial;

        match f().await {
            Ok(value) => {
                self.record_success(trial);
                drop(admission);
                Ok(value)
            }
            Err(err) => {
                let err = err.into();
                let counted = err
                    .operation_error()
                    .map_or(false, |e| self.expected_error.matches(e));
                if counted {
                    self.record_failure(trial);
                } else {
                    debug!(circuit = %self.name, code = err.code(), "Error not counted by circuit breaker");
                }
                drop(admission);
                Err(err)
            }
        }
    }

    fn acquire(&self) -> ResilienceResult<Admission<'_>, E> {
        let (result, transition) = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => match self.remaining_open_time(&state) {
                    Some(remaining) if !remaining.is_zero() => (Err(remaining), None),
                    _ => {
                        state.state = CircuitState::HalfOpen;
                        state.trial_in_flight = true;
                        (Ok(true), Some((CircuitState::Open, CircuitState::HalfOpen)))
                    }
                },
                CircuitState::HalfOpen if state.trial_in_flight => (Err(Duration::ZERO), None),
                CircuitState::HalfOpen => {
                    state.trial_in_flight = true;
                    (Ok(true), None)
                }
            }
        };

        if let Some(transition) = transition {
            info!(circuit = %self.name, "Circuit breaker transitioning to HALF_OPEN");
            self.notify(transition);
        }

        match result {
            Ok(trial) => Ok(Admission {
                state: &self.state,
                trial,
            }),
            Err(retry_after) => {
                debug!(
                    circuit = %self.name,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit breaker rejected call"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.increment_counter(
                        metric_names::CIRCUIT_BREAKER_REJECTIONS,
                        1,
                        &[("circuit", &self.name)],
                    );
                }
                Err(ResilienceError::circuit_open(self.name.clone(), retry_after))
            }
        }
    }

    /// Only the admitted trial decides HALF_OPEN; late outcomes of calls
    /// admitted before the circuit opened leave the state alone.
    fn record_success(&self, trial: bool) {
        let transition = {
            let mut state = self.state.lock();
            if trial && state.state == CircuitState::HalfOpen {
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.last_failure_time = None;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            } else {
                None
            }
        };

        if let Some(transition) = transition {
            info!(circuit = %self.name, "Circuit breaker transitioning to CLOSED");
            self.notify(transition);
        }
    }

    fn record_failure(&self, trial: bool) {
        let (failure_count, transition) = {
            let mut state = self.state.lock();
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_time = Some(Instant::now());

            let old = state.state;
            let should_open = match old {
                CircuitState::HalfOpen => trial,
                _ => state.failure_count >= self.config.failure_threshold,
            };
            if should_open && old != CircuitState::Open {
                state.state = CircuitState::Open;
                (state.failure_count, Some((old, CircuitState::Open)))
            } else {
                (state.failure_count, None)
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                metric_names::CIRCUIT_BREAKER_FAILURES,
                1,
                &[("circuit", &self.name)],
            );
        }

        if let Some(transition) = transition {
            warn!(
                circuit = %self.name,
                failure_count,
                from = %transition.0,
                "Circuit breaker transitioning to OPEN"
            );
            self.notify(transition);
        }
    }

    fn remaining_open_time(&self, state: &BreakerState) -> Option<Duration> {
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state
            .last_failure_time
            .map_or(self.config.recovery_timeout, |t| t.elapsed());
        Some(self.config.recovery_timeout.saturating_sub(elapsed))
    }

    fn notify(&self, (old, new): Transition) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(
                metric_names::CIRCUIT_BREAKER_STATE,
                new.gauge_value(),
                &[("circuit", &self.name)],
            );
        }
        if let Some(hook) = &self.hook {
            hook.on_state_change(&self.name, old, new);
        }
    }
}

impl<E> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("expected_error", &self.expected_error)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::observability::InMemoryMetricsCollector;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker<ServiceError> {
        CircuitBreaker::new(
            "payments",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(timeout_ms),
            },
            ErrorClassifier::retryable(),
        )
    }

    async fn fail(cb: &CircuitBreaker<ServiceError>) -> ResilienceResult<(), ServiceError> {
        cb.call(|| async { Err::<(), _>(ServiceError::network("connection refused")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker<ServiceError>) -> ResilienceResult<u32, ServiceError> {
        cb.call(|| async { Ok::<_, ServiceError>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_closed() {
        let cb = breaker(2, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.time_until_half_open(), None);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(2, 100);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 2);
        assert!(cb.last_failure_time().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_without_invoking_while_open() {
        let cb = breaker(2, 100);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        let calls = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ServiceError>(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker(2, 100);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cb.time_until_half_open(), Some(Duration::ZERO));

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.last_failure_time(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 100);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(150)).await;
        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Operation(ServiceError::Network { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);

        // the reopened circuit waits a full timeout from the new failure
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_keeps_failure_count() {
        let cb = breaker(3, 100);
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.failure_count(), 1);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_errors_do_not_count() {
        let cb = breaker(1, 100);
        let result = cb
            .call(|| async { Err::<(), _>(ServiceError::validation("bad currency")) })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Operation(ServiceError::Validation { .. }))
        ));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = Arc::new(breaker(1, 100));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = Arc::clone(&cb);
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, ServiceError>("trial")
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = succeed(&cb).await.unwrap_err();
        assert!(concurrent.is_circuit_open());
        assert_eq!(concurrent.retry_after(), Some(Duration::ZERO));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_does_not_close_half_open() {
        let cb = Arc::new(breaker(2, 100));

        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_cb = Arc::clone(&cb);
        let slow = tokio::spawn(async move {
            slow_cb
                .call(|| async move {
                    let _ = slow_rx.await;
                    Ok::<_, ServiceError>("late")
                })
                .await
        });
        tokio::task::yield_now().await;

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(100)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = Arc::clone(&cb);
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = trial_rx.await;
                    Err::<(), _>(ServiceError::network("still down"))
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        slow_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), "late");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());

        trial_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_slot() {
        let cb = breaker(1, 100);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let pending = cb.call(|| std::future::pending::<Result<(), ServiceError>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wraps_toolkit_errors() {
        let cb = breaker(1, 100);
        let result: ResilienceResult<(), ServiceError> = cb
            .call(|| async {
                Err(ResilienceError::RetriesExhausted {
                    attempts: 3,
                    last_error: ServiceError::timeout("slow"),
                })
            })
            .await;

        assert!(result.unwrap_err().is_retries_exhausted());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    struct RecordingHook {
        transitions: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    impl CircuitBreakerHook for RecordingHook {
        fn on_state_change(&self, circuit: &str, old: CircuitState, new: CircuitState) {
            assert_eq!(circuit, "payments");
            self.transitions.lock().push((old, new));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_and_metrics_observe_transitions() {
        let hook = Arc::new(RecordingHook {
            transitions: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(InMemoryMetricsCollector::new());
        let cb = breaker(1, 100)
            .with_hook(hook.clone())
            .with_metrics(metrics.clone());

        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        let _ = succeed(&cb).await;

        assert_eq!(
            *hook.transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert_eq!(
            metrics.get_counter("resilience.circuit_breaker.rejections:circuit=payments"),
            1
        );
        assert_eq!(
            metrics.get_gauge("resilience.circuit_breaker.state:circuit=payments"),
            Some(0.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_reset() {
        let cb = breaker(1, 100);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(40)).await;

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.last_failure_age_ms, Some(40));
        assert_eq!(snapshot.retry_after_ms, Some(60));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "OPEN");

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }
}
