//! Standalone retry and result-caching helpers for calls outside `ServiceClient`

use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Run `op` up to `config.retry_attempts` times, sleeping
/// [`CircuitBreakerConfig::backoff_delay`] between attempts. The last error is returned.
pub async fn retry<T, E, F, Fut>(config: &CircuitBreakerConfig, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(config, |_| true, op).await
}

/// Like [`retry`], but errors rejected by `should_retry` are returned at once.
pub async fn retry_if<T, E, F, Fut, P>(
    config: &CircuitBreakerConfig,
    mut should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    let max_attempts = config.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !should_retry(&err) {
            return Err(err);
        }
        if attempt + 1 >= max_attempts {
            tracing::error!(attempts = max_attempts, error = %err, "all attempts failed");
            return Err(err);
        }

        let delay = config.backoff_delay(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Call results keyed by string, each valid for `ttl` after it was stored.
///
/// Failed calls are never cached. Concurrent misses for one key may both run
/// the call; the later result wins.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: DashMap<String, (V, Instant)>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`; an expired entry is dropped
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| now.duration_since(entry.1) < self.ttl)
            .map(|entry| entry.0.clone());
        if fresh.is_none() {
            self.entries
                .remove_if(key, |_, (_, stored)| now.duration_since(*stored) >= self.ttl);
        }
        fresh
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries currently stored, expired ones included until next touched
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached value for `key`, or the result of `call`, stored when it succeeds
    pub async fn get_or_try_insert_with<E, F, Fut>(&self, key: &str, call: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            tracing::debug!(key, "cache hit");
            return Ok(hit);
        }
        let value = call().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceClientError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            retry_attempts: attempts,
            retry_delay: Duration::from_millis(100),
            retry_backoff: 2.0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures_with_backoff() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<u32, String> = retry(&policy(3), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("boom {n}"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        // 100ms then 200ms
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry(&policy(2), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {n}"))
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_if_stops_on_rejected_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), ServiceClientError> = retry_if(
            &policy(5),
            ServiceClientError::is_retryable,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceClientError::ClientStatus {
                    status: 404,
                    body: String::new(),
                })
            },
        )
        .await;

        assert_eq!(result.unwrap_err().status_code(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry(&policy(0), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_until_ttl_expires() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let calls = &AtomicU32::new(0);
        let load = || async move {
            Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) + 1)
        };

        assert_eq!(cache.get_or_try_insert_with("users:1", load).await, Ok(1));
        assert_eq!(cache.get_or_try_insert_with("users:1", load).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("users:1").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_try_insert_with("users:1", load).await, Ok(2));
    }

    #[tokio::test]
    async fn test_cache_skips_failures_and_separates_keys() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));

        let err = cache
            .get_or_try_insert_with("a", || async { Err::<String, _>("down") })
            .await;
        assert_eq!(err, Err("down"));
        assert!(cache.get("a").is_none());

        cache.insert("a", "alpha".to_string());
        cache.insert("b", "beta".to_string());
        assert_eq!(cache.get("a").as_deref(), Some("alpha"));
        assert_eq!(cache.len(), 2);

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some("beta"));

        cache.clear();
        assert!(cache.is_empty());
    }
}
