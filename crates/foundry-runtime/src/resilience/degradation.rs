//! Graceful degradation: serve a recent cached answer, or a minimal
//! synthetic one, instead of failing.
//!
//! Degradation is time-boxed. Once the wrapped operation has been failing
//! for longer than `max_degradation_time`, errors propagate again.

use moka::future::Cache;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use foundry_core::DegradationConfig;

/// Where a degraded-mode answer came from.
#[derive(Debug, Clone, PartialEq)]
pub enum DegradedResponse {
    /// The operation succeeded
    Fresh(serde_json::Value),

    /// The operation failed; a cached success within TTL was served
    Cached {
        value: serde_json::Value,
        age: Duration,
    },

    /// The operation failed and nothing usable was cached
    Synthetic(serde_json::Value),
}

impl DegradedResponse {
    pub fn value(&self) -> &serde_json::Value {
        match self {
            DegradedResponse::Fresh(value)
            | DegradedResponse::Cached { value, .. }
            | DegradedResponse::Synthetic(value) => value,
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        match self {
            DegradedResponse::Fresh(value)
            | DegradedResponse::Cached { value, .. }
            | DegradedResponse::Synthetic(value) => value,
        }
    }

    /// Whether the underlying operation failed.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, DegradedResponse::Fresh(_))
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    value: serde_json::Value,
    cached_at: Instant,
}

/// Wraps an operation with a TTL-bounded fallback cache.
pub struct GracefulDegradation {
    name: String,
    cache: Cache<String, CachedResponse>,
    cache_ttl: Duration,
    max_degradation_time: Duration,
    degraded_since: Mutex<Option<Instant>>,
}

impl GracefulDegradation {
    pub fn new(name: impl Into<String>, config: &DegradationConfig) -> Self {
        // Expiry is decided against `cached_at`; moka only bounds the size.
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .build();

        Self {
            name: name.into(),
            cache,
            cache_ttl: config.cache_ttl,
            max_degradation_time: config.max_degradation_time,
            degraded_since: Mutex::new(None),
        }
    }

    /// Run `operation`, falling back on failure.
    ///
    /// Returns the original error only when the degraded period has
    /// outlasted `max_degradation_time`.
    pub async fn execute<F, Fut, E>(
        &self,
        cache_key: &str,
        operation: F,
    ) -> Result<DegradedResponse, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        match operation().await {
            Ok(value) => {
                self.cache
                    .insert(
                        cache_key.to_string(),
                        CachedResponse {
                            value: value.clone(),
                            cached_at: Instant::now(),
                        },
                    )
                    .await;
                if self.degraded_since.lock().take().is_some() {
                    tracing::info!(component = %self.name, "Leaving degraded mode");
                }
                Ok(DegradedResponse::Fresh(value))
            }
            Err(err) => self.fallback(cache_key, err).await,
        }
    }

    async fn fallback<E>(&self, cache_key: &str, err: E) -> Result<DegradedResponse, E>
    where
        E: std::fmt::Display,
    {
        let now = Instant::now();
        let since = *self.degraded_since.lock().get_or_insert(now);
        let degraded_for = now - since;

        if degraded_for > self.max_degradation_time {
            tracing::warn!(
                component = %self.name,
                degraded_for = ?degraded_for,
                error = %err,
                "Degradation window exhausted, propagating failure"
            );
            return Err(err);
        }

        if let Some(entry) = self.cache.get(cache_key).await {
            let age = now - entry.cached_at;
            if age <= self.cache_ttl {
                tracing::warn!(
                    component = %self.name,
                    key = cache_key,
                    age = ?age,
                    error = %err,
                    "Serving cached response"
                );
                return Ok(DegradedResponse::Cached {
                    value: entry.value,
                    age,
                });
            }
            self.cache.invalidate(cache_key).await;
        }

        tracing::warn!(
            component = %self.name,
            key = cache_key,
            error = %err,
            "Serving synthetic degraded response"
        );
        Ok(DegradedResponse::Synthetic(serde_json::json!({
            "status": "degraded",
            "component": self.name,
            "cache_key": cache_key,
            "message": err.to_string(),
        })))
    }

    /// Whether the last observed call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded_since.lock().is_some()
    }

    /// How long the component has been degraded.
    pub fn degraded_for(&self) -> Option<Duration> {
        self.degraded_since
            .lock()
            .map(|since| Instant::now().saturating_duration_since(since))
    }

    /// Drop all cached responses.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(ttl: u64, max_degraded: u64) -> DegradationConfig {
        DegradationConfig {
            cache_ttl: Duration::from_secs(ttl),
            max_degradation_time: Duration::from_secs(max_degraded),
            cache_capacity: 100,
        }
    }

    async fn ok(value: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(value)
    }

    async fn fail() -> Result<serde_json::Value, String> {
        Err("provider down".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_result_is_cached() {
        let degradation = GracefulDegradation::new("research", &config(60, 600));
        let fresh = degradation
            .execute("k", || ok(json!({"plan": 1})))
            .await
            .unwrap();
        assert_eq!(fresh, DegradedResponse::Fresh(json!({"plan": 1})));
        assert!(!degradation.is_degraded());

        let served = degradation.execute("k", fail).await.unwrap();
        assert!(matches!(served, DegradedResponse::Cached { .. }));
        assert_eq!(served.value(), &json!({"plan": 1}));
        assert!(degradation.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_boundary() {
        let degradation = GracefulDegradation::new("research", &config(60, 600));
        degradation.execute("k", || ok(json!("v"))).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let at_ttl = degradation.execute("k", fail).await.unwrap();
        assert!(matches!(at_ttl, DegradedResponse::Cached { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        let past_ttl = degradation.execute("k", fail).await.unwrap();
        assert!(matches!(past_ttl, DegradedResponse::Synthetic(_)));
        assert_eq!(past_ttl.value()["status"], "degraded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_dropped_on_lookup() {
        let degradation = GracefulDegradation::new("research", &config(60, 600));
        degradation.execute("k", || ok(json!("v"))).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(degradation.cache.contains_key("k"));
        degradation.execute("k", fail).await.unwrap();
        assert!(degradation.cache.contains_key("k"));

        tokio::time::advance(Duration::from_secs(1)).await;
        degradation.execute("k", fail).await.unwrap();
        assert!(!degradation.cache.contains_key("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_without_cache() {
        let degradation = GracefulDegradation::new("plans", &config(60, 600));
        let served = degradation.execute("missing", fail).await.unwrap();
        assert!(served.is_degraded());
        assert_eq!(served.value()["status"], "degraded");
        assert_eq!(served.value()["message"], "provider down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_degradation_time() {
        let degradation = GracefulDegradation::new("plans", &config(600, 30));
        degradation.execute("k", || ok(json!(1))).await.unwrap();

        assert!(degradation.execute("k", fail).await.is_ok());
        tokio::time::advance(Duration::from_secs(31)).await;
        let err = degradation.execute("k", fail).await.unwrap_err();
        assert_eq!(err, "provider down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_degraded_marker() {
        let degradation = GracefulDegradation::new("plans", &config(600, 30));
        degradation.execute("k", fail).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(degradation.degraded_for(), Some(Duration::from_secs(20)));

        degradation.execute("k", || ok(json!(2))).await.unwrap();
        assert!(!degradation.is_degraded());

        // A new outage starts a fresh window.
        tokio::time::advance(Duration::from_secs(25)).await;
        degradation.execute("k", fail).await.unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(degradation.execute("k", fail).await.is_ok());
    }
}
