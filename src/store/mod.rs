//! Window stores and the weighted sliding-window arithmetic they share.
//!
//! Both store tiers count requests into fixed buckets of one window width and
//! blend the previous bucket into the current one, weighted by how much of the
//! current bucket has elapsed. This smooths the boundary-doubling flaw of
//! naive fixed windows while costing a single read+increment per request.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::{InMemoryStore, InMemoryStoreBuilder};
pub use self::redis::{RedisWindowStore, RedisWindowStoreBuilder};

/// A store failure; every variant means the store was unusable for this
/// request and the caller should fall back, never silently allow.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call exceeded the {0:?} timeout")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(
        #[source]
        #[from]
        ::redis::RedisError,
    ),
    #[error("store task failed: {0}")]
    Task(
        #[source]
        #[from]
        actix_web::rt::task::JoinError,
    ),
}

/// The outcome of counting one request against a window.
#[derive(Debug, Clone, Copy)]
pub struct WindowUsage {
    /// Whether the blended count stayed within the quota.
    pub allowed: bool,
    /// The quota for the window.
    pub limit: u64,
    /// Requests still permitted before the quota is reached.
    pub remaining: u64,
    /// Epoch milliseconds at which both buckets have expired and the key
    /// starts from a clean slate.
    pub reset_ms: u64,
    /// Earliest epoch milliseconds at which a request would be admitted
    /// again. Present only on denials; never later than `reset_ms`.
    pub retry_at_ms: Option<u64>,
}

/// A keyed sliding-window counter.
///
/// Implementations are shared across actix workers, so they must be cheap to
/// clone (wrap state in an [Arc](std::sync::Arc)) and their futures `Send`.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Counts one request for `key` and reports whether it fits the quota.
    ///
    /// The attempt always counts, even when the answer is a denial.
    async fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<WindowUsage, StoreError>;

    /// Forgets all buckets for a key, resetting its quota.
    async fn remove_key(&self, key: &str, window: Duration) -> Result<(), StoreError>;
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Start of the fixed bucket containing `now_ms`.
pub(crate) fn bucket_start(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms
}

/// Computes the blended decision from the two bucket counts.
///
/// `current` must already include the increment for the request being decided.
pub(crate) fn usage_from_counts(
    previous: u64,
    current: u64,
    now_ms: u64,
    window_ms: u64,
    max_requests: u64,
) -> WindowUsage {
    let bucket = bucket_start(now_ms, window_ms);
    let elapsed_fraction = (now_ms - bucket) as f64 / window_ms as f64;
    let effective = previous as f64 * (1.0 - elapsed_fraction) + current as f64;
    let allowed = effective <= max_requests as f64;
    let remaining = max_requests.saturating_sub(effective.ceil() as u64);
    let reset_ms = bucket + 2 * window_ms;
    let retry_at_ms = if allowed {
        None
    } else {
        Some(earliest_retry_ms(previous, current, bucket, window_ms, max_requests).min(reset_ms))
    };
    WindowUsage {
        allowed,
        limit: max_requests,
        remaining,
        reset_ms,
        retry_at_ms,
    }
}

/// Earliest instant at which one more request would fit the quota, assuming
/// the subject stays quiet until then.
///
/// Solves the blend for the admitting fraction, first inside the current
/// bucket (the previous bucket decays) and otherwise in the next one (the
/// current counts become the decaying side). A one millisecond margin keeps
/// the answer clear of rounding at the exact boundary.
fn earliest_retry_ms(
    previous: u64,
    current: u64,
    bucket: u64,
    window_ms: u64,
    max_requests: u64,
) -> u64 {
    let width = window_ms as f64;
    if current < max_requests {
        if previous > 0 {
            let need = 1.0 - (max_requests - 1 - current) as f64 / previous as f64;
            if need <= 1.0 {
                return bucket + (need * width).ceil() as u64 + 1;
            }
        }
        return bucket + window_ms;
    }
    let need = 1.0 - (max_requests - 1) as f64 / current as f64;
    bucket + window_ms + (need * width).ceil() as u64 + 1
}
