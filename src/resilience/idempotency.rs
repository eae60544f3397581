//! Time-bounded memoization of operation results by idempotency key.
//!
//! Entries are only ever removed by [`IdempotencyManager::cleanup_expired`]
//! (or the explicit `invalidate`/`clear` calls). Reads never evict, so an
//! entry older than the TTL keeps being served until a sweep runs.
//!
//! There is no single-flight guarantee: two calls under the same key that
//! both start before either finishes will both run the operation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::observability::{metric_names, MetricsCollector};

/// Idempotency cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a stored result stays eligible for reuse.
    pub cache_ttl: Duration,
    /// Interval used by [`IdempotencyManager::spawn_cleanup`] when the caller opts in.
    pub cleanup_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    result: T,
    stored_at: Instant,
}

/// Memoizes successful results per key for `cache_ttl`.
pub struct IdempotencyManager<T> {
    cache_ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl<T: Clone> IdempotencyManager<T> {
    /// Creates a manager with the given TTL.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            entries: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Creates a manager from configuration.
    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(config.cache_ttl)
    }

    /// Sets a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the configured TTL.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Returns the cached result for `key` if present, invoking `operation` otherwise.
    ///
    /// Only `Ok` results are stored. A failed call leaves no entry, so the
    /// same key can be retried later.
    pub async fn ensure_idempotent<F, Fut, E>(&self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key) {
            debug!(key, "Idempotency cache hit");
            self.count(metric_names::IDEMPOTENCY_HITS);
            return Ok(cached);
        }
        self.count(metric_names::IDEMPOTENCY_MISSES);

        let result = operation().await?;

        let len = {
            let mut entries = self.entries.write();
            entries.insert(
                key.to_string(),
                CacheEntry {
                    result: result.clone(),
                    stored_at: Instant::now(),
                },
            );
            entries.len()
        };
        debug!(key, "Stored idempotent result");
        self.record_size(len);

        Ok(result)
    }

    /// Returns the cached result for `key`, regardless of age.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.read().get(key).map(|e| e.result.clone())
    }

    /// Returns whether `key` has a cached result.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Removes the entry for `key`, returning its result.
    pub fn invalidate(&self, key: &str) -> Option<T> {
        let (removed, len) = {
            let mut entries = self.entries.write();
            let removed = entries.remove(key).map(|e| e.result);
            (removed, entries.len())
        };
        if removed.is_some() {
            debug!(key, "Invalidated idempotency entry");
            self.record_size(len);
        }
        removed
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.record_size(0);
    }

    /// Returns the number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes entries older than the TTL and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let (removed, len) = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| now.duration_since(entry.stored_at) <= self.cache_ttl);
            (before - entries.len(), entries.len())
        };

        if removed > 0 {
            info!(removed, remaining = len, "Removed expired idempotency entries");
            if let Some(metrics) = &self.metrics {
                metrics.increment_counter(metric_names::IDEMPOTENCY_EVICTIONS, removed as u64, &[]);
            }
        }
        self.record_size(len);
        removed
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, 1, &[]);
        }
    }

    fn record_size(&self, len: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(metric_names::IDEMPOTENCY_ENTRIES, len as f64, &[]);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IdempotencyManager<T> {
    /// Spawns a task calling [`cleanup_expired`](Self::cleanup_expired) every
    /// `interval`. The task holds a weak reference and ends once the manager
    /// is dropped.
    ///
    /// Returns [`ConfigError::Invalid`] for a zero `interval`.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<JoinHandle<()>, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::invalid(
                "cleanup_interval",
                "must be greater than zero",
            ));
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.cleanup_expired();
                    }
                    None => {
                        debug!("Idempotency manager dropped, stopping cleanup task");
                        break;
                    }
                }
            }
        }))
    }
}

impl<T> std::fmt::Debug for IdempotencyManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyManager")
            .field("cache_ttl", &self.cache_ttl)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::observability::InMemoryMetricsCollector;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_same_key_invokes_operation_once() {
        let manager = IdempotencyManager::new(Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let receipt = manager
                .ensure_idempotent("charge:order-42", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ServiceError>("rcpt_1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(receipt, "rcpt_1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.contains("charge:order-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_allows_reexecution_after_ttl() {
        let manager = IdempotencyManager::new(Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let op = || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ServiceError>(n)
        };

        assert_eq!(manager.ensure_idempotent("k", op).await.unwrap(), 0);
        assert_eq!(manager.ensure_idempotent("k", op).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        // stale entries are still served until a sweep runs
        assert_eq!(manager.ensure_idempotent("k", op).await.unwrap(), 0);

        assert_eq!(manager.cleanup_expired(), 1);
        assert_eq!(manager.ensure_idempotent("k", op).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_not_cached() {
        let manager: IdempotencyManager<u32> = IdempotencyManager::new(Duration::from_secs(60));

        let err = manager
            .ensure_idempotent("k", || async { Err(ServiceError::network("reset")) })
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::network("reset"));
        assert!(manager.is_empty());

        let ok = manager
            .ensure_idempotent("k", || async { Ok::<_, ServiceError>(5) })
            .await
            .unwrap();
        assert_eq!(ok, 5);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_fresh_entries() {
        let manager = IdempotencyManager::new(Duration::from_secs(60));
        let _ = manager
            .ensure_idempotent("old", || async { Ok::<_, ServiceError>(1) })
            .await;
        tokio::time::advance(Duration::from_secs(45)).await;
        let _ = manager
            .ensure_idempotent("new", || async { Ok::<_, ServiceError>(2) })
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(manager.cleanup_expired(), 1);
        assert!(!manager.contains("old"));
        assert_eq!(manager.get("new"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_clear() {
        let manager = IdempotencyManager::new(Duration::from_secs(60));
        for key in ["a", "b", "c"] {
            let _ = manager
                .ensure_idempotent(key, || async { Ok::<_, ServiceError>(key.len()) })
                .await;
        }

        assert_eq!(manager.invalidate("a"), Some(1));
        assert_eq!(manager.invalidate("a"), None);
        assert_eq!(manager.len(), 2);

        manager.clear();
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_hits_misses_and_evictions() {
        let metrics = Arc::new(InMemoryMetricsCollector::new());
        let manager = IdempotencyManager::new(Duration::from_secs(1)).with_metrics(metrics.clone());

        for _ in 0..3 {
            let _ = manager
                .ensure_idempotent("k", || async { Ok::<_, ServiceError>(()) })
                .await;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        manager.cleanup_expired();

        assert_eq!(metrics.get_counter(metric_names::IDEMPOTENCY_HITS), 2);
        assert_eq!(metrics.get_counter(metric_names::IDEMPOTENCY_MISSES), 1);
        assert_eq!(metrics.get_counter(metric_names::IDEMPOTENCY_EVICTIONS), 1);
        assert_eq!(metrics.get_gauge(metric_names::IDEMPOTENCY_ENTRIES), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_cleanup_sweeps_and_stops_on_drop() {
        let manager = Arc::new(IdempotencyManager::new(Duration::from_secs(10)));
        let _ = manager
            .ensure_idempotent("k", || async { Ok::<_, ServiceError>(1) })
            .await;

        let handle = manager.spawn_cleanup(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(manager.is_empty());

        drop(manager);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_spawn_cleanup_rejects_zero_interval() {
        let manager: Arc<IdempotencyManager<u32>> =
            Arc::new(IdempotencyManager::new(Duration::from_secs(10)));

        let err = manager.spawn_cleanup(Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "cleanup_interval",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_calls_both_run() {
        let manager = IdempotencyManager::new(Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, ServiceError>("rcpt")
        };

        let (first, second) = tokio::join!(
            manager.ensure_idempotent("k", op),
            manager.ensure_idempotent("k", op)
        );

        assert_eq!(first.unwrap(), "rcpt");
        assert_eq!(second.unwrap(), "rcpt");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_from_config() {
        let manager: IdempotencyManager<String> =
            IdempotencyManager::from_config(&IdempotencyConfig::default());
        assert_eq!(manager.cache_ttl(), Duration::from_secs(3600));
    }
}
