//! Pluggable eviction policies.
//!
//! A policy owns only ordering state (intrusive lists, frequency sketches,
//! ordered sets of arena indices). Entry storage and the key map belong to
//! the shard, which calls the policy under its own lock.

use serde::Deserialize;

use crate::arena::Arena;

mod fifo;
mod lfu;
mod lru;
mod sketch;
mod tinylfu;

pub use fifo::FifoPolicy;
pub use lfu::LfuPolicy;
pub use lru::LruPolicy;
pub use sketch::FrequencySketch;
pub use tinylfu::TinyLfuPolicy;

/// Ordering and victim selection for one shard.
///
/// All methods take `&mut self` and the shard's arena; thread safety is the
/// shard lock's job. `choose_victim` must be deterministic: tie-breaking is
/// fully specified per policy, never left to iteration order.
pub trait EvictionPolicy: Send {
    /// Record a newly admitted entry at `index`.
    fn on_insert(&mut self, arena: &mut Arena, index: u32);

    /// Record a hit on `index`. The shard has already refreshed the
    /// entry's access metadata.
    fn on_access(&mut self, arena: &mut Arena, index: u32);

    /// Drop bookkeeping for an entry about to leave the shard.
    fn on_remove(&mut self, arena: &mut Arena, index: u32);

    /// Select one entry to evict, or `None` if the policy tracks nothing.
    fn choose_victim(&mut self, arena: &Arena) -> Option<u32>;

    /// Admission filter: may the candidate displace this victim?
    /// Frequency-aware policies record the candidate's fingerprint here so
    /// repeatedly rejected candidates eventually build enough frequency to
    /// be admitted.
    fn admit(&mut self, _arena: &Arena, _candidate_hash: u64, _victim: u32) -> bool {
        true
    }

    /// Human-readable name of the policy.
    fn name(&self) -> &'static str;
}

/// Policy selector, chosen at cache construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    Lru,
    Fifo,
    Lfu,
    TinyLfu,
}

impl PolicyKind {
    /// Build a fresh policy instance for one shard. `max_weight` sizes the
    /// TinyLFU window and sketch.
    pub fn build(&self, max_weight: u64) -> Box<dyn EvictionPolicy> {
        match self {
            PolicyKind::Lru => Box::new(LruPolicy::new()),
            PolicyKind::Fifo => Box::new(FifoPolicy::new()),
            PolicyKind::Lfu => Box::new(LfuPolicy::new()),
            PolicyKind::TinyLfu => Box::new(TinyLfuPolicy::new(max_weight)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::time::Instant;

    use bytes::Bytes;

    use crate::arena::{Arena, Entry};

    /// Insert a bare entry into the arena for policy unit tests.
    pub fn put_entry(arena: &mut Arena, key: &str, weight: u64) -> u32 {
        put_entry_hashed(arena, key, weight, key.len() as u64)
    }

    pub fn put_entry_hashed(arena: &mut Arena, key: &str, weight: u64, key_hash: u64) -> u32 {
        arena.insert(Entry::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::from_static(b"v"),
            key_hash,
            weight,
            Instant::now(),
            None,
        ))
    }
}
