//! Primary/fallback recovery scope with an auditable attempt log.
//!
//! A [`RecoveryContext`] is created per logical operation. It records when it
//! was entered, every leg it ran and how the scope ended, then emits a single
//! outcome event on exit. Use [`RecoveryContext::run`] to guarantee the exit
//! step; a context dropped without an explicit exit still emits an outcome
//! event, marked as abandoned.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::{metric_names, MetricsCollector};

const ABANDONED: &str = "recovery scope dropped before exit";

/// Recovery context configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Hand the final report to the configured [`RecoveryStateStore`].
    pub save_state: bool,
    /// Key identifying this recovery scope. A random UUID is used when `None`.
    pub state_key: Option<String>,
}

/// Which leg of a recovery an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLeg {
    /// The primary operation.
    Primary,
    /// The fallback operation.
    Fallback,
}

/// Outcome of one leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Leg that ran.
    pub leg: RecoveryLeg,
    /// Name of the function invoked.
    pub function: String,
    /// Whether the leg succeeded.
    pub success: bool,
    /// Error message when the leg failed.
    pub error: Option<String>,
}

/// Lifecycle state of a recovery scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryState {
    /// When the scope was entered.
    pub started_at: DateTime<Utc>,
    /// When the scope exited.
    pub completed_at: Option<DateTime<Utc>>,
    /// `Some(true)` iff the scope exited without an error.
    pub success: Option<bool>,
    /// The error the scope exited with.
    pub error: Option<String>,
}

/// Audit record produced when a recovery scope exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Key identifying the scope.
    pub state_key: String,
    /// Final lifecycle state.
    pub state: RecoveryState,
    /// Every leg in invocation order.
    pub attempts: Vec<AttemptRecord>,
    /// Time spent inside the scope.
    pub duration_ms: u64,
}

impl RecoveryReport {
    /// Renders the report as JSON for audit sinks.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Destination for reports of scopes configured with `save_state`.
pub trait RecoveryStateStore: Send + Sync {
    /// Stores the report under its `state_key`.
    fn save(&self, report: &RecoveryReport);
}

/// Process-local [`RecoveryStateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    reports: RwLock<HashMap<String, RecoveryReport>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the report stored under `state_key`.
    pub fn get(&self, state_key: &str) -> Option<RecoveryReport> {
        self.reports.read().get(state_key).cloned()
    }

    /// Returns the number of stored reports.
    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    /// Returns true if no report has been stored.
    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }
}

impl RecoveryStateStore for InMemoryStateStore {
    fn save(&self, report: &RecoveryReport) {
        self.reports
            .write()
            .insert(report.state_key.clone(), report.clone());
    }
}

/// An operation with the name recorded in the attempt log.
pub struct NamedOperation<F> {
    name: String,
    operation: F,
}

impl<F> NamedOperation<F> {
    /// Returns the recorded name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for NamedOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedOperation")
            .field("name", &self.name)
            .finish()
    }
}

/// Attaches a name to a recovery leg.
pub fn named<F>(name: impl Into<String>, operation: F) -> NamedOperation<F> {
    NamedOperation {
        name: name.into(),
        operation,
    }
}

/// Scoped primary/fallback executor.
pub struct RecoveryContext<E> {
    state_key: String,
    save_state: bool,
    state: RecoveryState,
    attempts: Vec<AttemptRecord>,
    entered: Instant,
    store: Option<Arc<dyn RecoveryStateStore>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    finished: bool,
    _error: PhantomData<fn() -> E>,
}

impl<E> RecoveryContext<E> {
    /// Enters a new recovery scope.
    pub fn enter(config: RecoveryConfig) -> Self {
        let state_key = config
            .state_key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(state_key = %state_key, "Entered recovery context");

        Self {
            state_key,
            save_state: config.save_state,
            state: RecoveryState {
                started_at: Utc::now(),
                completed_at: None,
                success: None,
                error: None,
            },
            attempts: Vec::new(),
            entered: Instant::now(),
            store: None,
            metrics: None,
            finished: false,
            _error: PhantomData,
        }
    }

    /// Sets the store receiving the final report when `save_state` is on.
    pub fn with_store(mut self, store: Arc<dyn RecoveryStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the scope key.
    pub fn state_key(&self) -> &str {
        &self.state_key
    }

    /// Returns the lifecycle state so far.
    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    /// Returns the attempts recorded so far.
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Runs `primary` with `args`, and `fallback` with the same `args` if the
    /// primary fails. Legs are recorded as `"primary"` and `"fallback"`.
    pub async fn execute_with_fallback<A, P, PFut, Q, QFut, T, X, Y>(
        &mut self,
        args: A,
        primary: P,
        fallback: Q,
    ) -> ResilienceResult<T, E>
    where
        A: Clone,
        P: FnOnce(A) -> PFut,
        PFut: Future<Output = Result<T, X>>,
        Q: FnOnce(A) -> QFut,
        QFut: Future<Output = Result<T, Y>>,
        X: Into<ResilienceError<E>>,
        Y: Into<ResilienceError<E>>,
        E: fmt::Display,
    {
        self.execute_named(args, named("primary", primary), named("fallback", fallback))
            .await
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback), recording
    /// the names given through [`named`].
    ///
    /// When both legs fail the fallback's error is returned inside
    /// [`ResilienceError::FallbackFailed`]; the primary's error only appears
    /// in the attempt log.
    pub async fn execute_named<A, P, PFut, Q, QFut, T, X, Y>(
        &mut self,
        args: A,
        primary: NamedOperation<P>,
        fallback: NamedOperation<Q>,
    ) -> ResilienceResult<T, E>
    where
        A: Clone,
        P: FnOnce(A) -> PFut,
        PFut: Future<Output = Result<T, X>>,
        Q: FnOnce(A) -> QFut,
        QFut: Future<Output = Result<T, Y>>,
        X: Into<ResilienceError<E>>,
        Y: Into<ResilienceError<E>>,
        E: fmt::Display,
    {
        let primary_error = match (primary.operation)(args.clone()).await {
            Ok(value) => {
                self.record(RecoveryLeg::Primary, primary.name, None);
                return Ok(value);
            }
            Err(err) => err.into(),
        };

        warn!(
            state_key = %self.state_key,
            function = %primary.name,
            error = %primary_error,
            "Primary operation failed, invoking fallback"
        );
        self.record(
            RecoveryLeg::Primary,
            primary.name,
            Some(primary_error.to_string()),
        );

        match (fallback.operation)(args).await {
            Ok(value) => {
                info!(
                    state_key = %self.state_key,
                    function = %fallback.name,
                    "Fallback operation succeeded"
                );
                self.record(RecoveryLeg::Fallback, fallback.name, None);
                self.count_fallback("success");
                Ok(value)
            }
            Err(err) => {
                let err: ResilienceError<E> = err.into();
                error!(
                    state_key = %self.state_key,
                    function = %fallback.name,
                    error = %err,
                    "Fallback operation failed"
                );
                self.record(RecoveryLeg::Fallback, fallback.name, Some(err.to_string()));
                self.count_fallback("failure");
                Err(ResilienceError::FallbackFailed {
                    fallback: Box::new(err),
                })
            }
        }
    }

    /// Closes the scope with the outcome the caller observed and returns the report.
    pub fn exit<T>(mut self, outcome: &ResilienceResult<T, E>) -> RecoveryReport
    where
        E: fmt::Display,
    {
        let error = outcome.as_ref().err().map(ToString::to_string);
        self.finish(error)
    }

    /// Runs `f` inside the scope and exits with its outcome.
    ///
    /// ```rust,no_run
    /// use futures::FutureExt;
    /// use integrations_resilience::errors::ServiceError;
    /// use integrations_resilience::resilience::{RecoveryConfig, RecoveryContext};
    ///
    /// # async fn demo() {
    /// let (result, report) = RecoveryContext::<ServiceError>::enter(RecoveryConfig::default())
    ///     .run(|ctx| {
    ///         async move {
    ///             ctx.execute_with_fallback(
    ///                 "order-42",
    ///                 |order| async move { Err::<String, _>(ServiceError::network(order)) },
    ///                 |order| async move { Ok::<_, ServiceError>(format!("queued {order}")) },
    ///             )
    ///             .await
    ///         }
    ///         .boxed()
    ///     })
    ///     .await;
    /// assert_eq!(result.unwrap(), "queued order-42");
    /// assert_eq!(report.attempts.len(), 2);
    /// # }
    /// ```
    pub async fn run<F, T>(mut self, f: F) -> (ResilienceResult<T, E>, RecoveryReport)
    where
        F: for<'c> FnOnce(&'c mut Self) -> BoxFuture<'c, ResilienceResult<T, E>>,
        E: fmt::Display,
    {
        let result = f(&mut self).await;
        let report = self.exit(&result);
        (result, report)
    }

    fn record(&mut self, leg: RecoveryLeg, function: String, error: Option<String>) {
        self.attempts.push(AttemptRecord {
            leg,
            function,
            success: error.is_none(),
            error,
        });
    }

    fn count_fallback(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(metric_names::RECOVERY_FALLBACKS, 1, &[("outcome", outcome)]);
        }
    }

    fn finish(&mut self, error: Option<String>) -> RecoveryReport {
        self.finished = true;
        self.state.completed_at = Some(Utc::now());
        self.state.success = Some(error.is_none());
        self.state.error = error;

        let report = RecoveryReport {
            state_key: self.state_key.clone(),
            state: self.state.clone(),
            attempts: std::mem::take(&mut self.attempts),
            duration_ms: self.entered.elapsed().as_millis() as u64,
        };

        if report.state.success == Some(true) {
            info!(
                state_key = %report.state_key,
                success = true,
                attempts = report.attempts.len(),
                duration_ms = report.duration_ms,
                "Recovery context exited"
            );
        } else {
            warn!(
                state_key = %report.state_key,
                success = false,
                attempts = report.attempts.len(),
                duration_ms = report.duration_ms,
                error = report.state.error.as_deref().unwrap_or_default(),
                "Recovery context exited"
            );
        }

        if self.save_state {
            match &self.store {
                Some(store) => store.save(&report),
                None => debug!(state_key = %report.state_key, "save_state set without a state store"),
            }
        }

        report
    }
}

impl<E> Drop for RecoveryContext<E> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some(ABANDONED.to_string()));
        }
    }
}

impl<E> fmt::Debug for RecoveryContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("state_key", &self.state_key)
            .field("save_state", &self.save_state)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}
