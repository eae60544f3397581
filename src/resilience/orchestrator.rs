//! Composition of the resilience layers around a single dependency.
//!
//! Calls flow circuit breaker → retry executor → (idempotency cache) →
//! operation. The breaker sees one outcome per retry sequence, so an
//! exhausted retry budget counts as a single failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerHook};
use super::idempotency::IdempotencyManager;
use super::recovery::{RecoveryConfig, RecoveryContext, RecoveryStateStore};
use super::retry::{RetryExecutor, RetryObserver};
use super::strategy::RetryStrategy;
use crate::config::ResilienceConfig;
use crate::errors::{ConfigError, ErrorClassifier, ResilienceResult};
use crate::observability::MetricsCollector;

/// Retry and circuit breaking for calls to one dependency, plus factories
/// for the per-call idempotency and recovery components.
pub struct ResilienceOrchestrator<E> {
    config: ResilienceConfig,
    retry_executor: RetryExecutor<E>,
    circuit_breaker: Arc<CircuitBreaker<E>>,
    state_store: Option<Arc<dyn RecoveryStateStore>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<E> ResilienceOrchestrator<E> {
    /// Creates a builder for the dependency `name`.
    ///
    /// `retryable` decides which errors are retried. The breaker counts the
    /// same errors unless [`ResilienceOrchestratorBuilder::expected_error`] is set.
    pub fn builder(
        name: impl Into<String>,
        retryable: ErrorClassifier<E>,
    ) -> ResilienceOrchestratorBuilder<E> {
        ResilienceOrchestratorBuilder::new(name, retryable)
    }

    /// Returns the configuration the orchestrator was built from.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Returns the circuit breaker.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker<E>> {
        &self.circuit_breaker
    }

    /// Returns the retry executor.
    pub fn retry_executor(&self) -> &RetryExecutor<E> {
        &self.retry_executor
    }

    /// Runs `f` through the circuit breaker and retry executor.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.circuit_breaker
            .call(|| self.retry_executor.execute(operation, f))
            .await
    }

    /// Like [`execute`](Self::execute), with every attempt going through `cache`
    /// under `key`. A cached result is returned without invoking `f`.
    pub async fn execute_idempotent<F, Fut, T>(
        &self,
        operation: &str,
        cache: &IdempotencyManager<T>,
        key: &str,
        mut f: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Clone,
        E: fmt::Display,
    {
        self.execute(operation, || {
            // futures are lazy; on a cache hit this one is dropped unpolled
            let attempt = f();
            cache.ensure_idempotent(key, move || attempt)
        })
        .await
    }

    /// Creates an idempotency cache using the configured TTL and metrics.
    pub fn idempotency_manager<T: Clone>(&self) -> IdempotencyManager<T> {
        let manager = IdempotencyManager::from_config(&self.config.idempotency);
        match &self.metrics {
            Some(metrics) => manager.with_metrics(Arc::clone(metrics)),
            None => manager,
        }
    }

    /// Enters a recovery scope using the configured recovery settings.
    ///
    /// When the config names a `state_key`, every context created here shares
    /// it and saved reports replace each other. Use
    /// [`recovery_context_for`](Self::recovery_context_for) to key each scope.
    pub fn recovery_context(&self) -> RecoveryContext<E> {
        self.enter_recovery(self.config.recovery.clone())
    }

    /// Enters a recovery scope whose report is saved under `state_key`.
    pub fn recovery_context_for(&self, state_key: impl Into<String>) -> RecoveryContext<E> {
        self.enter_recovery(RecoveryConfig {
            state_key: Some(state_key.into()),
            ..self.config.recovery.clone()
        })
    }

    fn enter_recovery(&self, config: RecoveryConfig) -> RecoveryContext<E> {
        let mut context = RecoveryContext::enter(config);
        if let Some(store) = &self.state_store {
            context = context.with_store(Arc::clone(store));
        }
        if let Some(metrics) = &self.metrics {
            context = context.with_metrics(Arc::clone(metrics));
        }
        context
    }
}

impl<E> fmt::Debug for ResilienceOrchestrator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("retry_executor", &self.retry_executor)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

/// Builder for [`ResilienceOrchestrator`].
pub struct ResilienceOrchestratorBuilder<E> {
    name: String,
    config: ResilienceConfig,
    retryable: ErrorClassifier<E>,
    expected_error: Option<ErrorClassifier<E>>,
    strategy: Option<Arc<dyn RetryStrategy>>,
    observer: Option<RetryObserver<E>>,
    breaker_hook: Option<Arc<dyn CircuitBreakerHook>>,
    state_store: Option<Arc<dyn RecoveryStateStore>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<E> ResilienceOrchestratorBuilder<E> {
    /// Creates a builder with the default configuration.
    pub fn new(name: impl Into<String>, retryable: ErrorClassifier<E>) -> Self {
        Self {
            name: name.into(),
            config: ResilienceConfig::default(),
            retryable,
            expected_error: None,
            strategy: None,
            observer: None,
            breaker_hook: None,
            state_store: None,
            metrics: None,
        }
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets which errors the circuit breaker counts.
    pub fn expected_error(mut self, classifier: ErrorClassifier<E>) -> Self {
        self.expected_error = Some(classifier);
        self
    }

    /// Overrides the strategy built from the backoff configuration.
    pub fn strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the retry observer.
    pub fn observer(mut self, observer: RetryObserver<E>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets the circuit breaker state change hook.
    pub fn breaker_hook(mut self, hook: Arc<dyn CircuitBreakerHook>) -> Self {
        self.breaker_hook = Some(hook);
        self
    }

    /// Sets the store receiving recovery reports.
    pub fn state_store(mut self, store: Arc<dyn RecoveryStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Sets a metrics collector shared by every component.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    pub fn build(self) -> Result<ResilienceOrchestrator<E>, ConfigError> {
        self.config.validate()?;

        let strategy = self
            .strategy
            .unwrap_or_else(|| self.config.retry.backoff.build_strategy());
        let expected_error = self
            .expected_error
            .unwrap_or_else(|| self.retryable.clone());

        let mut retry_executor =
            RetryExecutor::new(self.config.retry.max_attempts, strategy, self.retryable);
        if let Some(observer) = self.observer {
            retry_executor = retry_executor.with_observer(observer);
        }

        let mut circuit_breaker = CircuitBreaker::new(
            self.name,
            self.config.circuit_breaker.clone(),
            expected_error,
        );
        if let Some(hook) = self.breaker_hook {
            circuit_breaker = circuit_breaker.with_hook(hook);
        }

        if let Some(metrics) = &self.metrics {
            retry_executor = retry_executor.with_metrics(Arc::clone(metrics));
            circuit_breaker = circuit_breaker.with_metrics(Arc::clone(metrics));
        }

        Ok(ResilienceOrchestrator {
            config: self.config,
            retry_executor,
            circuit_breaker: Arc::new(circuit_breaker),
            state_store: self.state_store,
            metrics: self.metrics,
        })
    }
}
