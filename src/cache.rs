use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::{MonotonicClock, SharedClock};
use crate::config::{Config, ConsistencyMode};
use crate::error::{CacheError, ConfigError, StoreError};
use crate::limiter::{RateLimiter, RateStrategy};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{WorkItem, WorkerPool};
use crate::shard::{PutOutcome, Shard};
use crate::store::{BackingStore, FlushFailure};

/// Per-shard entry budget examined by one `sweep_expired` pass.
const SWEEP_BUDGET: usize = 64;

/// Concurrent, sharded, bounded cache.
///
/// Keys are routed to one of a fixed set of shards by a fixed-seed hash;
/// each shard owns its map, arena, and policy under its own mutex. The
/// facade never holds more than one shard lock at a time and never calls
/// the backing store while holding one.
pub struct Cache {
    config: Config,
    shards: Arc<Vec<Mutex<Shard>>>,
    shard_mask: u64,
    hasher: ahash::RandomState,
    limiter: Option<RateLimiter>,
    store: Option<Arc<dyn BackingStore>>,
    pool: Option<WorkerPool>,
    metrics: Arc<Metrics>,
    clock: SharedClock,
    put_seq: AtomicU64,
    closed: AtomicBool,
    flush_errors_rx: Receiver<FlushFailure>,
    flush_errors_tx: Sender<FlushFailure>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("shard_mask", &self.shard_mask)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Cache-aside constructor: no backing store.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::build(config, None, Arc::new(MonotonicClock))
    }

    /// Cache-aside constructor with an injected clock (tests).
    pub fn with_clock(config: Config, clock: SharedClock) -> Result<Self, ConfigError> {
        Self::build(config, None, clock)
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn BackingStore>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, Some(store), Arc::new(MonotonicClock))
    }

    pub fn with_store_and_clock(
        config: Config,
        store: Arc<dyn BackingStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        Self::build(config, Some(store), clock)
    }

    fn build(
        config: Config,
        store: Option<Arc<dyn BackingStore>>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        match (config.consistency, &store) {
            (ConsistencyMode::CacheAside, Some(_)) => return Err(ConfigError::StoreNotAllowed),
            (ConsistencyMode::CacheAside, None) => {}
            (mode, None) => return Err(ConfigError::StoreRequired(mode)),
            (_, Some(_)) => {}
        }

        let metrics = Arc::new(Metrics::default());
        let shards = Arc::new(
            (0..config.shard_count)
                .map(|_| {
                    Mutex::new(Shard::new(
                        config.max_weight_per_shard,
                        config.policy.build(config.max_weight_per_shard),
                        Arc::clone(&metrics),
                    ))
                })
                .collect::<Vec<_>>(),
        );
        let limiter = match config.rate_strategy {
            RateStrategy::None => None,
            strategy => Some(RateLimiter::new(
                strategy,
                config.rate_capacity,
                config.rate_refill_per_second,
                Duration::from_secs(config.idle_bucket_gc_seconds),
                Arc::clone(&clock),
            )),
        };
        let pool = if config.worker_count > 0 {
            Some(WorkerPool::new(
                config.worker_count,
                Arc::clone(&metrics),
                Arc::clone(&clock),
            ))
        } else {
            None
        };
        let (flush_errors_tx, flush_errors_rx) = unbounded();

        tracing::debug!(
            shards = config.shard_count,
            policy = ?config.policy,
            consistency = ?config.consistency,
            "cache constructed"
        );

        Ok(Cache {
            shard_mask: (config.shard_count - 1) as u64,
            config,
            shards,
            hasher: ahash::RandomState::with_seeds(1, 2, 3, 4),
            limiter,
            store,
            pool,
            metrics,
            clock,
            put_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            flush_errors_rx,
            flush_errors_tx,
        })
    }

    /// Look up a key, loading through the backing store on a miss when
    /// read-through is configured.
    pub fn get(&self, key: &Bytes, caller: &str) -> Result<Option<Bytes>, CacheError> {
        self.get_deadline(key, caller, None)
    }

    /// `get` with a deadline on any coalesced in-flight load. The deadline
    /// bounds only this caller's wait; the load itself is never aborted.
    pub fn get_deadline(
        &self,
        key: &Bytes,
        caller: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<Bytes>, CacheError> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        self.admit_caller(caller)?;

        let now = self.clock.now();
        let shard_idx = self.shard_of(key);
        let mut shard = self.shards[shard_idx].lock();
        if let Some(value) = shard.get(key, now) {
            return Ok(Some(value));
        }
        if self.config.consistency != ConsistencyMode::ReadThrough {
            return Ok(None);
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };

        // Read-through: at most one load per key across all callers.
        let (inflight, is_loader) = shard.join_load(key);
        drop(shard);

        if !is_loader {
            Metrics::incr(&self.metrics.coalesced_loads);
            return match inflight.wait(deadline) {
                None => Err(CacheError::Timeout),
                Some(Ok(value)) => Ok(value),
                Some(Err(err)) => Err(CacheError::LoadFailed(err)),
            };
        }

        Metrics::incr(&self.metrics.loads);
        let result = catch_unwind(AssertUnwindSafe(|| store.load(key)))
            .unwrap_or_else(|_| Err(StoreError::new("backing store panicked during load")));

        let mut shard = self.shards[shard_idx].lock();
        shard.finish_load(key);
        if let Ok(Some(value)) = &result {
            // Byte-length weight for loaded values; admission may still
            // reject the entry, which only costs us a future reload.
            let weight = (value.len() as u64).max(1);
            let version = self.next_version();
            let _ = shard.put(
                key.clone(),
                value.clone(),
                self.hasher.hash_one(key),
                weight,
                self.clock.now(),
                self.default_ttl(),
                version,
                false,
            );
        }
        drop(shard);

        if result.is_err() {
            Metrics::incr(&self.metrics.load_failures);
        }
        inflight.publish(result.clone());
        result.map_err(CacheError::LoadFailed)
    }

    /// Insert a value with an explicit weight. `ttl` overrides the
    /// configured default; `None` falls back to it.
    pub fn put(
        &self,
        key: Bytes,
        value: Bytes,
        weight: u64,
        caller: &str,
        ttl: Option<Duration>,
    ) -> Result<PutOutcome, CacheError> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if weight == 0 {
            return Err(CacheError::ZeroWeight);
        }
        self.admit_caller(caller)?;

        let ttl = ttl.or_else(|| self.default_ttl());
        let version = self.next_version();
        let key_hash = self.hasher.hash_one(&key);
        let shard_idx = self.shard_of(&key);

        if self.config.consistency == ConsistencyMode::WriteThrough {
            // Store ack first; the entry exists only after the write.
            let store = self.store.as_ref().expect("write-through requires a store");
            let result = catch_unwind(AssertUnwindSafe(|| store.store(&key, &value)))
                .unwrap_or_else(|_| Err(StoreError::new("backing store panicked during store")));
            if let Err(err) = result {
                Metrics::incr(&self.metrics.store_failures);
                return Err(CacheError::StoreFailed(err));
            }
            Metrics::incr(&self.metrics.stores);
        }

        let dirty = self.config.consistency == ConsistencyMode::WriteBehind;
        let now = self.clock.now();
        let outcome = {
            let mut shard = self.shards[shard_idx].lock();
            shard.put(key.clone(), value.clone(), key_hash, weight, now, ttl, version, dirty)?
        };

        if dirty && outcome == PutOutcome::Admitted {
            if self
                .schedule_flush(shard_idx, key.clone(), value.clone(), version)
                .is_err()
            {
                // The pool shut down between ensure_open and here. Nothing
                // will retry this write; report it like an exhausted flush.
                Metrics::incr(&self.metrics.flush_failures);
                self.shards[shard_idx].lock().clear_dirty_if(&key, version);
                let _ = self.flush_errors_tx.send(FlushFailure {
                    key,
                    value,
                    error: StoreError::new("cache closed before the flush was scheduled"),
                });
                return Err(CacheError::ShuttingDown);
            }
        }
        Ok(outcome)
    }

    /// Remove a key. Returns whether it was present.
    pub fn invalidate(&self, key: &Bytes) -> Result<bool, CacheError> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        Ok(self.shards[self.shard_of(key)].lock().invalidate(key))
    }

    /// Remove expired entries, bounded per shard. Returns the number of
    /// entries removed. Expiry is also enforced lazily on `get`.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        self.shards
            .iter()
            .map(|shard| shard.lock().sweep_expired(now, SWEEP_BUDGET))
            .sum()
    }

    /// Counter snapshot plus current occupancy.
    pub fn stats(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            snapshot.entries += shard.len();
            snapshot.weight += shard.weight();
            snapshot.capacity += shard.max_weight();
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().len() == 0)
    }

    /// Total in-flight read-through loads (introspection/tests).
    pub fn inflight_loads(&self) -> usize {
        self.shards.iter().map(|s| s.lock().inflight_len()).sum()
    }

    /// Dirty flag of a resident entry; `None` when the key is absent.
    /// Meaningful under write-behind only.
    pub fn is_dirty(&self, key: &Bytes) -> Option<bool> {
        self.shards[self.shard_of(key)].lock().is_dirty(key)
    }

    /// Write-behind flushes that exhausted their retries.
    pub fn flush_errors(&self) -> &Receiver<FlushFailure> {
        &self.flush_errors_rx
    }

    /// Stop accepting operations and drain the worker pool. Pending
    /// flushes run to completion within `grace`; items past it surface on
    /// the pool's dropped channel. Idempotent.
    pub fn close(&self, grace: Option<Duration>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("cache closing");
        if let Some(pool) = &self.pool {
            pool.shutdown(grace);
        }
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn admit_caller(&self, caller: &str) -> Result<(), CacheError> {
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire(caller, 1) {
                Metrics::incr(&self.metrics.rate_denied);
                return Err(CacheError::RateDenied);
            }
        }
        Ok(())
    }

    #[inline]
    fn shard_of(&self, key: &Bytes) -> usize {
        (self.hasher.hash_one(key) & self.shard_mask) as usize
    }

    #[inline]
    fn next_version(&self) -> u64 {
        self.put_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn default_ttl(&self) -> Option<Duration> {
        match self.config.default_ttl_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn schedule_flush(
        &self,
        shard_idx: usize,
        key: Bytes,
        value: Bytes,
        version: u64,
    ) -> Result<(), CacheError> {
        let pool = self.pool.as_ref().expect("write-behind requires workers");
        let store = Arc::clone(self.store.as_ref().expect("write-behind requires a store"));
        let shards = Arc::clone(&self.shards);
        let metrics = Arc::clone(&self.metrics);
        let clock = Arc::clone(&self.clock);
        let errors = self.flush_errors_tx.clone();
        let retry_max = self.config.flush_retry_max;
        let backoff_base = Duration::from_millis(self.config.flush_backoff_base_ms);

        pool.submit(WorkItem::new(self.clock.now(), move || {
            flush_one(
                &shards, shard_idx, key, value, version, &*store, &metrics, &*clock, retry_max,
                backoff_base, &errors,
            );
        }))
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.close(None);
    }
}

/// Write one dirty value to the backing store, retrying with exponential
/// backoff. Runs on a pool worker; never holds a shard lock across the
/// store call.
///
/// Flushes for one key are serialized through the shard's per-key order
/// lock: a later version waits for the earlier store call to return, so
/// writes cannot land out of order even across workers.
#[allow(clippy::too_many_arguments)]
fn flush_one(
    shards: &[Mutex<Shard>],
    shard_idx: usize,
    key: Bytes,
    value: Bytes,
    version: u64,
    store: &dyn BackingStore,
    metrics: &Metrics,
    clock: &dyn crate::clock::Clock,
    retry_max: u32,
    backoff_base: Duration,
    errors: &Sender<FlushFailure>,
) {
    let order = shards[shard_idx].lock().begin_flush(&key);
    {
        let _ordered = order.lock();
        flush_with_retries(
            shards, shard_idx, &key, &value, version, store, metrics, clock, retry_max,
            backoff_base, errors,
        );
    }
    shards[shard_idx].lock().end_flush(&key);
}

#[allow(clippy::too_many_arguments)]
fn flush_with_retries(
    shards: &[Mutex<Shard>],
    shard_idx: usize,
    key: &Bytes,
    value: &Bytes,
    version: u64,
    store: &dyn BackingStore,
    metrics: &Metrics,
    clock: &dyn crate::clock::Clock,
    retry_max: u32,
    backoff_base: Duration,
    errors: &Sender<FlushFailure>,
) {
    let superseded = || {
        shards[shard_idx]
            .lock()
            .version_of(key)
            .map_or(false, |v| v > version)
    };
    // A newer put for this key queued its own flush; most recent wins.
    if superseded() {
        return;
    }

    let mut attempt: u32 = 0;
    loop {
        let result = catch_unwind(AssertUnwindSafe(|| store.store(key, value)))
            .unwrap_or_else(|_| Err(StoreError::new("backing store panicked during flush")));
        match result {
            Ok(()) => {
                Metrics::incr(&metrics.stores);
                Metrics::incr(&metrics.flushes);
                shards[shard_idx].lock().clear_dirty_if(key, version);
                return;
            }
            Err(err) => {
                Metrics::incr(&metrics.store_failures);
                if attempt >= retry_max {
                    Metrics::incr(&metrics.flush_failures);
                    // Stop retrying: clear the flag and hand the loss to
                    // the caller's error channel.
                    shards[shard_idx].lock().clear_dirty_if(key, version);
                    tracing::warn!(error = %err, "write-behind flush gave up");
                    let _ = errors.send(FlushFailure {
                        key: key.clone(),
                        value: value.clone(),
                        error: err,
                    });
                    return;
                }
                Metrics::incr(&metrics.flush_retries);
                clock.sleep(backoff_base * 2u32.pow(attempt));
                attempt += 1;
                if superseded() {
                    return;
                }
            }
        }
    }
}
