//! Fixed-window throttle engine.
//!
//! The engine holds no counters. Each check computes the current window
//! bucket, bumps the matching counter in the [`CounterStore`] and compares
//! the result to the limit. Rejected calls are counted too, so hammering a
//! limited key does not buy an actor any extra room in the window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::key::store_key;
use super::window::FixedWindow;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::CounterStore;

/// Default deadline for the whole store interaction of one check.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of a single throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleResult {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Calls left in the current window
    pub remaining: u64,
    /// Seconds until the current window ends
    pub reset_seconds: u64,
    /// Set when the store could not answer and the call was let through
    pub degraded: bool,
}

impl ThrottleResult {
    fn disabled(limit: i64, window_seconds: i64) -> Self {
        Self {
            allowed: true,
            remaining: limit.max(0) as u64,
            reset_seconds: window_seconds.max(0) as u64,
            degraded: false,
        }
    }
}

/// Point-in-time copy of the engine's telemetry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Checks that reached the store
    pub checks: u64,
    /// Checks that came back over the limit
    pub rejected: u64,
    /// Checks that had to use the conditional-create path
    pub fallbacks: u64,
    /// Checks admitted because the store failed or timed out
    pub degraded: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    checks: AtomicU64,
    rejected: AtomicU64,
    fallbacks: AtomicU64,
    degraded: AtomicU64,
}

/// The throttle engine.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// Any number of engines, in any number of processes, may point at the same
/// store.
pub struct ThrottleEngine {
    /// Where the counters live
    store: Arc<dyn CounterStore>,
    /// Time source for window math
    clock: Arc<dyn Clock>,
    /// Deadline for the store round trips of one check
    store_timeout: Duration,
    stats: StatCounters,
}

impl ThrottleEngine {
    /// Create an engine on the system clock.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create an engine that reads time from `clock`.
    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            stats: StatCounters::default(),
        }
    }

    /// Set the deadline for the store interaction of a single check.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Count one call against `key` and decide whether it is admitted.
    ///
    /// A non-positive `limit` or `window_seconds` disables throttling and the
    /// store is not touched. This method never fails: if the store errors or
    /// does not answer within the store timeout the call is admitted in
    /// degraded mode.
    pub async fn check(&self, key: &str, limit: i64, window_seconds: i64) -> ThrottleResult {
        let window = match FixedWindow::new(window_seconds) {
            Some(window) if limit > 0 => window,
            _ => {
                trace!(key = %key, limit, window_seconds, "Throttling disabled");
                return ThrottleResult::disabled(limit, window_seconds);
            }
        };
        let limit = limit as u64;

        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let bucket = window.bucket(now);
        let reset_seconds = window.reset_after(now);
        let store_key = store_key(key, bucket);

        trace!(
            key = %store_key,
            limit,
            window = window.seconds(),
            "Checking throttle"
        );

        let count = match tokio::time::timeout(
            self.store_timeout,
            self.count(&store_key, window.seconds()),
        )
        .await
        {
            Ok(Ok(count)) => count.max(0) as u64,
            Ok(Err(err)) => return self.degraded(&store_key, limit, reset_seconds, &err),
            Err(_) => {
                return self.degraded(&store_key, limit, reset_seconds, &StoreError::Timeout)
            }
        };

        let allowed = count <= limit;
        if !allowed {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %store_key,
                count,
                limit,
                "Throttle limit exceeded"
            );
        }

        ThrottleResult {
            allowed,
            remaining: limit.saturating_sub(count),
            reset_seconds,
            degraded: false,
        }
    }

    /// Get a snapshot of the telemetry counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            checks: self.stats.checks.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            degraded: self.stats.degraded.load(Ordering::Relaxed),
        }
    }

    /// Bump the counter for `store_key` and return its new value.
    async fn count(&self, store_key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        match self.store.increment(store_key, ttl_secs).await {
            Ok(count) if count > 0 => return Ok(count),
            Ok(count) => debug!(
                key = %store_key,
                count,
                "Increment reported a fresh key, using conditional create"
            ),
            Err(err) => debug!(
                key = %store_key,
                error = %err,
                "Atomic increment unavailable, using conditional create"
            ),
        }

        self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.count_conditionally(store_key, ttl_secs).await
    }

    /// Read-then-conditional-create. Concurrent callers can each read the
    /// same value here, so the stored count may drift from the true count by
    /// at most the number of callers racing on the key.
    async fn count_conditionally(&self, store_key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        let current = match self.store.get(store_key).await? {
            Some(current) => current,
            None => {
                if self.store.set_if_absent(store_key, 1, ttl_secs).await? {
                    return Ok(1);
                }
                // Someone else created the key first; count on top of theirs.
                self.store.get(store_key).await?.unwrap_or(0)
            }
        };

        let count = current.max(0) + 1;
        self.store.set(store_key, count, ttl_secs).await?;
        Ok(count)
    }

    fn degraded(&self, store_key: &str, limit: u64, reset_seconds: u64, err: &StoreError) -> ThrottleResult {
        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        warn!(
            key = %store_key,
            error = %err,
            "Counter store failed, admitting call in degraded mode"
        );

        ThrottleResult {
            allowed: true,
            remaining: limit,
            reset_seconds,
            degraded: true,
        }
    }
}
