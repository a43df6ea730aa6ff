//! In-process fallback store.
//!
//! Counts with the same blended algorithm as the distributed tier, but per
//! process: with more than one instance running it under-counts true global
//! traffic. That is an accepted limitation: its job is to catch bursts
//! hitting a single instance while the distributed store is down, not to
//! replace it.

use crate::store::{
    bucket_start, epoch_ms, usage_from_counts, StoreError, WindowStore, WindowUsage,
};
use actix_web::rt::task::JoinHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    window_start: u64,
    window_ms: u64,
    current: u64,
    previous: u64,
}

/// A sliding-window store backed by a [DashMap](dashmap::DashMap).
#[derive(Clone)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, WindowRecord>>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

impl InMemoryStore {
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn increment_at(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u64,
        now_ms: u64,
    ) -> WindowUsage {
        let bucket = bucket_start(now_ms, window_ms);
        let mut entry = self
            .map
            .entry(key.to_owned())
            .or_insert(WindowRecord {
                window_start: bucket,
                window_ms,
                current: 0,
                previous: 0,
            });
        let record = entry.value_mut();
        if record.window_start != bucket {
            // Rotate: the old current bucket becomes the previous one when
            // they are adjacent, otherwise both buckets have expired.
            if record.window_start + window_ms == bucket {
                record.previous = record.current;
            } else {
                record.previous = 0;
            }
            record.current = 0;
            record.window_start = bucket;
            record.window_ms = window_ms;
        }
        record.current += 1;
        usage_from_counts(record.previous, record.current, now_ms, window_ms, max_requests)
    }

    /// Drops every record whose current and previous buckets have both fully
    /// elapsed, bounding the map to recently active keys.
    fn sweep(&self, now_ms: u64) {
        self.map
            .retain(|_k, record| now_ms < record.window_start + 2 * record.window_ms);
    }

    fn garbage_collector(store: InMemoryStore, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                actix_web::rt::time::sleep(interval).await;
                store.sweep(epoch_ms());
            }
        })
    }
}

#[async_trait]
impl WindowStore for InMemoryStore {
    async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<WindowUsage, StoreError> {
        let window_ms = window.as_millis() as u64;
        Ok(self.increment_at(key, window_ms, max_requests, epoch_ms()))
    }

    async fn remove_key(&self, key: &str, _window: Duration) -> Result<(), StoreError> {
        self.map.remove(key);
        Ok(())
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = &self.gc_handle {
            if Arc::strong_count(handle) == 1 {
                handle.abort();
            }
        }
    }
}

pub struct InMemoryStoreBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryStoreBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryStore {
        let mut store = InMemoryStore {
            map: Arc::new(DashMap::new()),
            gc_handle: None,
        };
        store.gc_handle = self
            .gc_interval
            .map(|interval| Arc::new(InMemoryStore::garbage_collector(store.clone(), interval)));
        store
    }
}
