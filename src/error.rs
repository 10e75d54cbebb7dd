use thiserror::Error;

use crate::config::ConsistencyMode;

/// Error returned by a [`BackingStore`](crate::store::BackingStore) call.
///
/// Carries only a message so a single load failure can be cloned out to
/// every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(msg: impl Into<String>) -> Self {
        StoreError(msg.into())
    }
}

/// Errors surfaced by the public cache operations.
///
/// A miss is not an error: `get` returns `Ok(None)`. Expired entries are
/// removed on observation and reported as a miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The rate limiter refused admission for this caller. Retry later.
    #[error("admission denied by rate limiter")]
    RateDenied,

    /// The backing store returned an error during a read-through load.
    #[error("backing store load failed: {0}")]
    LoadFailed(StoreError),

    /// The backing store returned an error during a write-through put.
    #[error("backing store write failed: {0}")]
    StoreFailed(StoreError),

    /// A coalesced load did not complete before the caller's deadline.
    /// The underlying load is not aborted; other waiters still benefit.
    #[error("timed out waiting for in-flight load")]
    Timeout,

    /// Operation attempted after `close()`.
    #[error("cache is shutting down")]
    ShuttingDown,

    #[error("key must not be empty")]
    EmptyKey,

    #[error("weight must be > 0")]
    ZeroWeight,

    /// The entry can never fit in a shard. No eviction is attempted.
    #[error("entry weight {weight} exceeds shard capacity {max}")]
    WeightTooLarge { weight: u64, max: u64 },
}

/// Construction-time configuration errors. Detected before any shard,
/// worker, or bucket is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("shard_count must be a non-zero power of two, got {0}")]
    ShardCount(usize),

    #[error("max_weight_per_shard must be > 0")]
    MaxWeight,

    #[error("rate_capacity must be > 0 when a rate strategy is configured")]
    RateCapacity,

    #[error("rate_refill_per_second must be > 0 when a rate strategy is configured")]
    RateRefill,

    #[error("write-behind requires at least one worker")]
    NoWorkers,

    #[error("consistency mode {0:?} requires a backing store")]
    StoreRequired(ConsistencyMode),

    #[error("cache-aside mode does not take a backing store")]
    StoreNotAllowed,
}
