use serde::Deserialize;

use crate::error::ConfigError;
use crate::limiter::RateStrategy;
use crate::policy::PolicyKind;

/// How the cache talks to its backing store. Exactly one mode is active
/// per cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyMode {
    /// Misses load from the store synchronously, with per-key coalescing.
    ReadThrough,
    /// Puts write to the store before the cache acknowledges.
    WriteThrough,
    /// Puts are acknowledged immediately and flushed asynchronously.
    WriteBehind,
    /// The cache never talks to a store; the caller owns both halves.
    CacheAside,
}

/// Cache construction parameters. Every field has a default; unknown
/// fields are rejected at deserialization time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of independent shards. Must be a power of two so shard
    /// selection is a mask.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Weight budget per shard. Capacity is measured in weight, not
    /// entry count.
    #[serde(default = "default_max_weight")]
    pub max_weight_per_shard: u64,
    #[serde(default = "default_policy")]
    pub policy: PolicyKind,
    #[serde(default = "default_consistency")]
    pub consistency: ConsistencyMode,
    #[serde(default = "default_rate_strategy")]
    pub rate_strategy: RateStrategy,
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u64,
    #[serde(default = "default_rate_refill")]
    pub rate_refill_per_second: f64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Write-behind flush retries after the first failed attempt.
    #[serde(default = "default_flush_retry_max")]
    pub flush_retry_max: u32,
    #[serde(default = "default_flush_backoff_base_ms")]
    pub flush_backoff_base_ms: u64,
    /// Rate buckets idle longer than this are garbage-collected.
    #[serde(default = "default_idle_bucket_gc_seconds")]
    pub idle_bucket_gc_seconds: u64,
    /// 0 means entries never expire unless a put supplies a TTL.
    #[serde(default)]
    pub default_ttl_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shard_count: default_shard_count(),
            max_weight_per_shard: default_max_weight(),
            policy: default_policy(),
            consistency: default_consistency(),
            rate_strategy: default_rate_strategy(),
            rate_capacity: default_rate_capacity(),
            rate_refill_per_second: default_rate_refill(),
            worker_count: default_worker_count(),
            flush_retry_max: default_flush_retry_max(),
            flush_backoff_base_ms: default_flush_backoff_base_ms(),
            idle_bucket_gc_seconds: default_idle_bucket_gc_seconds(),
            default_ttl_ms: 0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(ConfigError::ShardCount(self.shard_count));
        }
        if self.max_weight_per_shard == 0 {
            return Err(ConfigError::MaxWeight);
        }
        if self.rate_strategy != RateStrategy::None {
            if self.rate_capacity == 0 {
                return Err(ConfigError::RateCapacity);
            }
            if self.rate_refill_per_second <= 0.0 {
                return Err(ConfigError::RateRefill);
            }
        }
        if self.consistency == ConsistencyMode::WriteBehind && self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}

fn default_shard_count() -> usize {
    16
}
fn default_max_weight() -> u64 {
    1024
}
fn default_policy() -> PolicyKind {
    PolicyKind::Lru
}
fn default_consistency() -> ConsistencyMode {
    ConsistencyMode::CacheAside
}
fn default_rate_strategy() -> RateStrategy {
    RateStrategy::None
}
fn default_rate_capacity() -> u64 {
    100
}
fn default_rate_refill() -> f64 {
    10.0
}
fn default_worker_count() -> usize {
    2
}
fn default_flush_retry_max() -> u32 {
    5
}
fn default_flush_backoff_base_ms() -> u64 {
    50
}
fn default_idle_bucket_gc_seconds() -> u64 {
    300
}
