//! Failure tracking for the distributed store.
//!
//! A small two-state machine: `Healthy` until N consecutive failures land
//! within a bounded span, then `Suspected`. While suspected, only one in K
//! requests is routed to the store as a recovery probe, keeping store
//! timeouts off the hot path through an extended outage. A single successful
//! probe restores `Healthy`. All state is atomics; races between concurrent
//! recorders are tolerated.

use crate::store::epoch_ms;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

const STATE_HEALTHY: u8 = 0;
const STATE_SUSPECTED: u8 = 1;

/// Observed health of the distributed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    /// Recently failing; most requests skip the store, a fraction probe it.
    Suspected,
}

/// Thresholds for the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthGateConfig {
    /// Consecutive failures before the store is suspected down.
    pub failure_threshold: u32,
    /// Failures further apart than this restart the count.
    pub failure_window: Duration,
    /// While suspected, one in this many requests probes the store.
    pub probe_interval: u64,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            probe_interval: 10,
        }
    }
}

pub struct HealthGate {
    state: AtomicU8,
    failures: AtomicU32,
    first_failure_ms: AtomicU64,
    probe_ticker: AtomicU64,
    config: HealthGateConfig,
}

impl HealthGate {
    pub fn new(config: HealthGateConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_HEALTHY),
            failures: AtomicU32::new(0),
            first_failure_ms: AtomicU64::new(0),
            probe_ticker: AtomicU64::new(0),
            config,
        }
    }

    pub fn health(&self) -> StoreHealth {
        match self.state.load(Ordering::Acquire) {
            STATE_SUSPECTED => StoreHealth::Suspected,
            _ => StoreHealth::Healthy,
        }
    }

    /// Whether this request should be sent to the distributed store.
    ///
    /// Healthy: always. Suspected: every `probe_interval`-th caller probes.
    pub fn should_attempt(&self) -> bool {
        match self.health() {
            StoreHealth::Healthy => true,
            StoreHealth::Suspected => {
                self.probe_ticker.fetch_add(1, Ordering::Relaxed) % self.config.probe_interval == 0
            }
        }
    }

    pub fn record_success(&self) {
        if self.state.swap(STATE_HEALTHY, Ordering::AcqRel) == STATE_SUSPECTED {
            log::info!("distributed rate limit store recovered, resuming normal routing");
        }
        self.failures.store(0, Ordering::Release);
        self.first_failure_ms.store(0, Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.record_failure_at(epoch_ms());
    }

    fn record_failure_at(&self, now_ms: u64) {
        let window_ms = self.config.failure_window.as_millis() as u64;
        let first = self.first_failure_ms.load(Ordering::Acquire);
        let count = if first == 0 || now_ms.saturating_sub(first) > window_ms {
            // Stale streak, start a new one.
            self.first_failure_ms.store(now_ms, Ordering::Release);
            self.failures.store(1, Ordering::Release);
            1
        } else {
            self.failures.fetch_add(1, Ordering::AcqRel) + 1
        };
        if count >= self.config.failure_threshold
            && self.state.swap(STATE_SUSPECTED, Ordering::AcqRel) == STATE_HEALTHY
        {
            log::warn!(
                "distributed rate limit store suspected down after {count} consecutive failures, \
                 routing to the local store"
            );
        }
    }
}
