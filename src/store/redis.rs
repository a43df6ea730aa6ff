//! Distributed store backed by Redis.
//!
//! Each (policy, identity) key owns a pair of adjacent bucket keys. One atomic
//! pipeline per request increments the current bucket, pins its expiry to two
//! window widths, and reads the previous bucket; the blended decision is then
//! computed locally. The round-trip runs as a detached task awaited under a
//! hard timeout, so an aborted caller still lands its increment (the attempt
//! already happened and must count).

use crate::store::{bucket_start, epoch_ms, usage_from_counts, StoreError, WindowStore, WindowUsage};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(50);

/// A sliding-window store that keeps its buckets in Redis.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    call_timeout: Duration,
}

impl RedisWindowStore {
    /// Create a RedisWindowStoreBuilder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_resilient_rate_limit::store::RedisWindowStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisWindowStore::builder(manager).build();
    /// # };
    /// ```
    pub fn builder(connection: ConnectionManager) -> RedisWindowStoreBuilder {
        RedisWindowStoreBuilder {
            connection,
            key_prefix: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    fn bucket_key(&self, key: &str, bucket_start_ms: u64) -> String {
        match &self.key_prefix {
            None => format!("{key}:{bucket_start_ms}"),
            Some(prefix) => format!("{prefix}{key}:{bucket_start_ms}"),
        }
    }
}

pub struct RedisWindowStoreBuilder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
    call_timeout: Duration,
}

impl RedisWindowStoreBuilder {
    /// Apply an optional prefix to all rate limit keys given to this store.
    ///
    /// This may be useful when the Redis instance is being used for other
    /// purposes; the prefix acts as a namespace to avoid collision with other
    /// caches or keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    /// Override the hard timeout applied to every Redis round-trip.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn build(self) -> RedisWindowStore {
        RedisWindowStore {
            connection: self.connection,
            key_prefix: self.key_prefix,
            call_timeout: self.call_timeout,
        }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<WindowUsage, StoreError> {
        let now = epoch_ms();
        let window_ms = window.as_millis() as u64;
        let bucket = bucket_start(now, window_ms);
        let current_key = self.bucket_key(key, bucket);
        let previous_key = self.bucket_key(key, bucket.saturating_sub(window_ms));
        // Buckets expire once they can no longer contribute to a decision.
        let ttl_secs = ((2 * window_ms) / 1000).max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            // Increment the current bucket
            .cmd("INCR")
            .arg(&current_key)
            // Set the bucket to expire (only if it doesn't already have an expiry)
            .cmd("EXPIRE")
            .arg(&current_key)
            .arg(ttl_secs)
            .arg("NX")
            .ignore()
            // Read the previous bucket
            .cmd("GET")
            .arg(&previous_key);

        let mut con = self.connection.clone();
        // Detached so the increment completes even if the caller is aborted
        // mid-request; only the wait is bounded.
        let call = actix_web::rt::spawn(async move {
            let counts: (u64, Option<u64>) = pipe.query_async(&mut con).await?;
            Ok::<_, redis::RedisError>(counts)
        });
        let (current, previous) = match actix_web::rt::time::timeout(self.call_timeout, call).await
        {
            Err(_elapsed) => return Err(StoreError::Timeout(self.call_timeout)),
            Ok(joined) => joined??,
        };

        Ok(usage_from_counts(
            previous.unwrap_or(0),
            current,
            now,
            window_ms,
            max_requests,
        ))
    }

    /// Note that the key prefix (if set) is automatically included, you do
    /// not need to prepend it yourself.
    async fn remove_key(&self, key: &str, window: Duration) -> Result<(), StoreError> {
        let now = epoch_ms();
        let window_ms = window.as_millis() as u64;
        let bucket = bucket_start(now, window_ms);
        let current_key = self.bucket_key(key, bucket);
        let previous_key = self.bucket_key(key, bucket.saturating_sub(window_ms));
        let mut con = self.connection.clone();
        let () = con.del(vec![current_key, previous_key]).await?;
        Ok(())
    }
}

// These tests exercise a live server and are ignored by default; run them
// against a local Redis with `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    // Each test must use non-overlapping keys (because the tests may be run
    // concurrently), and resets its key on each run to start from a clean
    // state.
    async fn make_store(clear_test_key: &str) -> RedisWindowStoreBuilder {
        let host = option_env!("REDIS_HOST").unwrap_or("127.0.0.1");
        let port = option_env!("REDIS_PORT").unwrap_or("6379");
        let client = redis::Client::open(format!("redis://{host}:{port}")).unwrap();
        let manager = ConnectionManager::new(client).await.unwrap();
        let store = RedisWindowStore::builder(manager.clone())
            .call_timeout(Duration::from_secs(2))
            .build();
        store.remove_key(clear_test_key, MINUTE).await.unwrap();
        RedisWindowStore::builder(manager).call_timeout(Duration::from_secs(2))
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_allow_deny() {
        let store = make_store("test_allow_deny").await.build();
        for i in (0..5).rev() {
            // First 5 should be allowed
            let usage = store
                .increment_and_check("test_allow_deny", MINUTE, 5)
                .await
                .unwrap();
            assert!(usage.allowed);
            // Remaining counts should be decreasing
            assert_eq!(usage.remaining, i);
            // Limit should be the same
            assert_eq!(usage.limit, 5);
        }
        // Sixth should be denied
        let usage = store
            .increment_and_check("test_allow_deny", MINUTE, 5)
            .await
            .unwrap();
        assert!(!usage.allowed);
        assert_eq!(usage.remaining, 0);
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_keys_are_independent() {
        let store = make_store("test_independent_a").await.build();
        store.remove_key("test_independent_b", MINUTE).await.unwrap();
        let usage = store
            .increment_and_check("test_independent_a", MINUTE, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
        let usage = store
            .increment_and_check("test_independent_a", MINUTE, 1)
            .await
            .unwrap();
        assert!(!usage.allowed);
        let usage = store
            .increment_and_check("test_independent_b", MINUTE, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_reset_after_short_window() {
        let window = Duration::from_secs(1);
        let store = make_store("test_reset").await.build();
        let usage = store
            .increment_and_check("test_reset", window, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
        let usage = store
            .increment_and_check("test_reset", window, 1)
            .await
            .unwrap();
        assert!(!usage.allowed);
        // Both buckets clear after two windows.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let usage = store
            .increment_and_check("test_reset", window, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_remove_key() {
        let store = make_store("test_remove_key").await.build();
        let usage = store
            .increment_and_check("test_remove_key", MINUTE, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
        let usage = store
            .increment_and_check("test_remove_key", MINUTE, 1)
            .await
            .unwrap();
        assert!(!usage.allowed);
        store.remove_key("test_remove_key", MINUTE).await.unwrap();
        // Counter should have been reset
        let usage = store
            .increment_and_check("test_remove_key", MINUTE, 1)
            .await
            .unwrap();
        assert!(usage.allowed);
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_key_prefix() {
        let store = make_store("prefix:test_key_prefix")
            .await
            .key_prefix(Some("prefix:"))
            .build();
        let mut con = store.connection.clone();
        store
            .increment_and_check("test_key_prefix", MINUTE, 5)
            .await
            .unwrap();
        let keys: Vec<String> = con.keys("prefix:test_key_prefix:*").await.unwrap();
        assert_eq!(keys.len(), 1);

        store.remove_key("test_key_prefix", MINUTE).await.unwrap();
        let keys: Vec<String> = con.keys("prefix:test_key_prefix:*").await.unwrap();
        assert!(keys.is_empty());
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_tight_timeout_reports_unavailable() {
        let store = make_store("test_timeout")
            .await
            .call_timeout(Duration::from_nanos(1))
            .build();
        let result = store.increment_and_check("test_timeout", MINUTE, 5).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
