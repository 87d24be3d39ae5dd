//! Pool instrumentation.
//!
//! Span names for pool operations and lock-free counters for pool lifecycle
//! events. Counters are read with [`ResourceLimitingPool::metrics`].
//!
//! [`ResourceLimitingPool::metrics`]: crate::pool::ResourceLimitingPool::metrics

use std::sync::atomic::{AtomicU64, Ordering};

/// Span names for pool operations.
pub mod span_names {
    /// Span name for acquiring a connection.
    pub const ACQUIRE: &str = "datasource.acquire";
    /// Span name for returning a connection.
    pub const RELEASE: &str = "datasource.release";
    /// Span name for an idle trim pass.
    pub const TRIM: &str = "datasource.trim";
    /// Span name for disposing the pool.
    pub const DISPOSE: &str = "datasource.dispose";
}

/// Lifecycle counters for one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    created: AtomicU64,
    decommissioned: AtomicU64,
    checkouts: AtomicU64,
    validation_failures: AtomicU64,
    timeouts: AtomicU64,
    trimmed: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decommissioned(&self) {
        self.decommissioned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkout(&self) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trimmed(&self, count: u64) {
        self.trimmed.fetch_add(count, Ordering::Relaxed);
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            decommissioned: self.decommissioned.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            trimmed: self.trimmed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    /// Connections opened by the factory.
    pub created: u64,
    /// Connections physically closed.
    pub decommissioned: u64,
    /// Successful checkouts.
    pub checkouts: u64,
    /// Idle connections discarded because they failed validation.
    pub validation_failures: u64,
    /// Blocked acquisitions that ran out of time.
    pub timeouts: u64,
    /// Idle connections removed by trimming.
    pub trimmed: u64,
}

impl PoolMetricsSnapshot {
    /// Connections opened and not yet closed.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.decommissioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = PoolMetrics::default();
        metrics.record_created();
        metrics.record_created();
        metrics.record_checkout();
        metrics.record_decommissioned();
        metrics.record_trimmed(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.created, 2);
        assert_eq!(snapshot.checkouts, 1);
        assert_eq!(snapshot.trimmed, 3);
        assert_eq!(snapshot.live(), 1);
    }
}
