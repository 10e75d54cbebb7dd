//! Concurrent, sharded, bounded cache with pluggable eviction, optional
//! backing-store integration, and rate-limited admission.
//!
//! Keys are distributed across a power-of-two number of independent
//! shards by a fixed-seed `ahash`, so contention is confined to one shard
//! per operation. Each shard stores its entries in an arena-allocated
//! intrusive list and delegates ordering decisions to an
//! [`EvictionPolicy`] (LRU, FIFO, LFU, or TinyLFU with a count-min
//! admission sketch).
//!
//! A [`BackingStore`] can be attached in one of three consistency modes:
//! read-through (misses load from the store, coalesced per key),
//! write-through (store ack before the cache ack), or write-behind
//! (async flush on a work-stealing [worker pool](pool::WorkerPool) with
//! retry and most-recent-wins coalescing). Without a store the cache runs
//! cache-aside. Optional token- or leaky-bucket rate limiting guards
//! admission per caller identity.
//!
//! ```no_run
//! use bytes::Bytes;
//! use weir::{Cache, Config};
//!
//! let cache = Cache::new(Config::default()).unwrap();
//! cache
//!     .put(Bytes::from("k"), Bytes::from("v"), 1, "caller-1", None)
//!     .unwrap();
//! assert_eq!(cache.get(&Bytes::from("k"), "caller-1").unwrap(), Some(Bytes::from("v")));
//! ```

pub mod arena;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod shard;
pub mod store;

pub use cache::Cache;
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::{Config, ConsistencyMode};
pub use error::{CacheError, ConfigError, StoreError};
pub use limiter::{RateLimiter, RateStrategy};
pub use metrics::{Metrics, MetricsSnapshot};
pub use policy::{EvictionPolicy, PolicyKind};
pub use pool::{DroppedItem, WorkItem, WorkerPool};
pub use shard::PutOutcome;
pub use store::{BackingStore, FlushFailure, MemoryStore};
