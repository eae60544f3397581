//! Metrics collection for resilience events.
//!
//! Counters, histograms and gauges with labels. The toolkit components accept
//! an optional `Arc<dyn MetricsCollector>` and report under the names in
//! [`metric_names`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for resilience events.
///
/// Implementations of this trait are responsible for collecting and storing metrics
/// data such as counters, histograms, and gauges.
pub trait MetricsCollector: Send + Sync {
    /// Increments a counter by the given value.
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Records a value in a histogram.
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets a gauge to the given value.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// In-memory metrics collector for testing and simple use cases.
///
/// Labelled series are keyed as `name:k1=v1,k2=v2`.
#[derive(Default)]
pub struct InMemoryMetricsCollector {
    counters: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsCollector {
    /// Creates a new in-memory metrics collector.
    ///
    /// # Examples
    ///
    /// ```
    /// use integrations_resilience::observability::{InMemoryMetricsCollector, MetricsCollector};
    ///
    /// let collector = InMemoryMetricsCollector::new();
    /// collector.increment_counter("retries", 1, &[]);
    /// assert_eq!(collector.get_counter("retries"), 1);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the current value of a counter, or 0 if it was never incremented.
    pub fn get_counter(&self, key: &str) -> u64 {
        self.counters
            .read()
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Gets all recorded values for a histogram.
    pub fn get_histogram(&self, key: &str) -> Vec<f64> {
        self.histograms
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Gets the current value of a gauge.
    pub fn get_gauge(&self, key: &str) -> Option<f64> {
        self.gauges.read().get(key).copied()
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
        self.gauges.write().clear();
    }

    fn make_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            name.to_string()
        } else {
            let label_str: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{}:{}", name, label_str.join(","))
        }
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.histograms.write().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.gauges.write().insert(key, value);
    }
}

/// No-op metrics collector.
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Metric names reported by the toolkit.
pub mod metric_names {
    /// Retries scheduled, labelled by `operation`.
    pub const RETRY_ATTEMPTS: &str = "resilience.retry.attempts";

    /// Backoff delay chosen before a retry, in milliseconds.
    pub const RETRY_DELAY_MS: &str = "resilience.retry.delay_ms";

    /// Circuit breaker state (0=closed, 1=open, 2=half-open), labelled by `circuit`.
    pub const CIRCUIT_BREAKER_STATE: &str = "resilience.circuit_breaker.state";

    /// Calls rejected by an open circuit.
    pub const CIRCUIT_BREAKER_REJECTIONS: &str = "resilience.circuit_breaker.rejections";

    /// Failures counted against a circuit.
    pub const CIRCUIT_BREAKER_FAILURES: &str = "resilience.circuit_breaker.failures";

    /// Idempotency cache hits.
    pub const IDEMPOTENCY_HITS: &str = "resilience.idempotency.hits";

    /// Idempotency cache misses.
    pub const IDEMPOTENCY_MISSES: &str = "resilience.idempotency.misses";

    /// Entries currently held by the idempotency cache.
    pub const IDEMPOTENCY_ENTRIES: &str = "resilience.idempotency.entries";

    /// Entries removed by expiry sweeps.
    pub const IDEMPOTENCY_EVICTIONS: &str = "resilience.idempotency.evictions";

    /// Fallback legs invoked after a primary failure, labelled by `outcome`.
    pub const RECOVERY_FALLBACKS: &str = "resilience.recovery.fallbacks";
}
