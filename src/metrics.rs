use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative counters shared by every component of one cache instance.
///
/// All counters are relaxed atomics: they are monotonic event counts, not
/// synchronization points. The cache writes, callers read snapshots.
#[derive(Debug, Default)]
pub struct Metrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
    /// Candidates rejected by a policy's admission filter.
    pub admission_denied: AtomicU64,
    /// Requests refused by the rate limiter.
    pub rate_denied: AtomicU64,
    /// Backing-store loads actually issued (coalesced waiters excluded).
    pub loads: AtomicU64,
    pub load_failures: AtomicU64,
    /// Gets that waited on another caller's in-flight load.
    pub coalesced_loads: AtomicU64,
    /// Successful backing-store writes (write-through and flushes).
    pub stores: AtomicU64,
    pub store_failures: AtomicU64,
    /// Write-behind flushes that completed.
    pub flushes: AtomicU64,
    /// Flush attempts re-issued after a store failure.
    pub flush_retries: AtomicU64,
    /// Flushes that exhausted their retry budget.
    pub flush_failures: AtomicU64,
    /// Work items taken from another worker's queue.
    pub steals: AtomicU64,
    /// Work items executed to completion (including panicked ones).
    pub executed: AtomicU64,
    pub worker_panics: AtomicU64,
    /// Work items discarded past their deadline during shutdown.
    pub dropped_items: AtomicU64,
}

impl Metrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            admission_denied: self.admission_denied.load(Ordering::Relaxed),
            rate_denied: self.rate_denied.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            coalesced_loads: self.coalesced_loads.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
            dropped_items: self.dropped_items.load(Ordering::Relaxed),
            entries: 0,
            weight: 0,
            capacity: 0,
        }
    }
}

/// Point-in-time view of the counters plus shard occupancy, filled in by
/// the facade's `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub admission_denied: u64,
    pub rate_denied: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub coalesced_loads: u64,
    pub stores: u64,
    pub store_failures: u64,
    pub flushes: u64,
    pub flush_retries: u64,
    pub flush_failures: u64,
    pub steals: u64,
    pub executed: u64,
    pub worker_panics: u64,
    pub dropped_items: u64,
    /// Entries currently resident across all shards.
    pub entries: usize,
    /// Sum of resident entry weights.
    pub weight: u64,
    /// Sum of shard max weights.
    pub capacity: u64,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::default();
        Metrics::incr(&m.hits);
        Metrics::incr(&m.hits);
        Metrics::incr(&m.misses);
        let snap = m.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.evictions, 0);
    }

    #[test]
    fn hit_rate_handles_zero_traffic() {
        let snap = MetricsSnapshot::default();
        assert_eq!(snap.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_ratio() {
        let snap = MetricsSnapshot {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((snap.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
