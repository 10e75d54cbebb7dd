use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::arena::{Arena, Entry};
use crate::error::{CacheError, StoreError};
use crate::metrics::Metrics;
use crate::policy::EvictionPolicy;

/// Result of a coalesced backing-store load, broadcast to every waiter.
pub type LoadResult = Result<Option<Bytes>, StoreError>;

/// Rendezvous for one in-flight backing-store load.
///
/// The loader publishes exactly once; waiters block on the condvar with an
/// optional deadline. A timed-out waiter simply leaves — the load itself
/// keeps running and later waiters still benefit.
pub struct InflightLoad {
    result: Mutex<Option<LoadResult>>,
    ready: Condvar,
}

impl InflightLoad {
    fn new() -> Self {
        InflightLoad {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn publish(&self, result: LoadResult) {
        let mut slot = self.result.lock();
        *slot = Some(result);
        self.ready.notify_all();
    }

    /// Block until the loader publishes, or until `deadline`. `None`
    /// means the deadline passed first.
    pub fn wait(&self, deadline: Option<Instant>) -> Option<LoadResult> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            match deadline {
                Some(at) => {
                    if self.ready.wait_until(&mut slot, at).timed_out() && slot.is_none() {
                        return None;
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
    }
}

/// Did a put land, or did the policy's admission filter turn it away?
/// Rejection is not an error; it is reported in the metrics too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Admitted,
    Rejected,
}

/// Per-key write-behind flush serialization: a reference-counted mutex
/// handed to flush workers so store writes for one key never interleave.
struct FlushSlot {
    lock: Arc<Mutex<()>>,
    refs: usize,
}

/// One lock-protected partition of the cache: a key map, the entry arena,
/// a policy instance, and the in-flight load registry (which shares this
/// shard's lock by construction — the facade only touches it while holding
/// the shard).
///
/// Every operation either succeeds atomically on this shard or leaves the
/// shard unchanged.
pub struct Shard {
    map: HashMap<Bytes, u32>,
    arena: Arena,
    policy: Box<dyn EvictionPolicy>,
    current_weight: u64,
    max_weight: u64,
    inflight: HashMap<Bytes, Arc<InflightLoad>>,
    flush_order: HashMap<Bytes, FlushSlot>,
    metrics: Arc<Metrics>,
}

impl Shard {
    pub fn new(max_weight: u64, policy: Box<dyn EvictionPolicy>, metrics: Arc<Metrics>) -> Self {
        Shard {
            map: HashMap::new(),
            arena: Arena::with_capacity(16),
            policy,
            current_weight: 0,
            max_weight,
            inflight: HashMap::new(),
            flush_order: HashMap::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn weight(&self) -> u64 {
        self.current_weight
    }

    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Look up a key. Expired entries are removed on observation and
    /// reported as a miss.
    pub fn get(&mut self, key: &Bytes, now: Instant) -> Option<Bytes> {
        let Some(&index) = self.map.get(key) else {
            Metrics::incr(&self.metrics.misses);
            return None;
        };
        if self.arena.get(index).map_or(true, |e| e.is_expired(now)) {
            self.remove_entry(key, index);
            Metrics::incr(&self.metrics.expired);
            Metrics::incr(&self.metrics.misses);
            return None;
        }
        {
            let entry = self.arena.get_mut(index).unwrap();
            entry.last_access = now;
            entry.access_count += 1;
        }
        self.policy.on_access(&mut self.arena, index);
        Metrics::incr(&self.metrics.hits);
        self.arena.get(index).map(|e| e.value.clone())
    }

    /// Insert or replace. The caller has already validated weight > 0 and
    /// applied rate limiting; `WeightTooLarge` is checked here because the
    /// shard owns its budget.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &mut self,
        key: Bytes,
        value: Bytes,
        key_hash: u64,
        weight: u64,
        now: Instant,
        ttl: Option<Duration>,
        version: u64,
        dirty: bool,
    ) -> Result<PutOutcome, CacheError> {
        if weight > self.max_weight {
            return Err(CacheError::WeightTooLarge {
                weight,
                max: self.max_weight,
            });
        }

        let mut displaced = None;
        if let Some(&index) = self.map.get(&key) {
            let old_weight = self.arena.get(index).map_or(0, |e| e.weight);
            if old_weight == weight {
                // Same weight: replace in place, refresh recency.
                let entry = self.arena.get_mut(index).unwrap();
                entry.value = value;
                entry.expires_at = ttl.map(|d| now + d);
                entry.version = version;
                entry.dirty = dirty;
                entry.last_access = now;
                self.policy.on_access(&mut self.arena, index);
                return Ok(PutOutcome::Admitted);
            }
            // Weight changed: the value is re-admitted as a fresh
            // candidate. Detach the old entry but keep it, so a rejected
            // admission can put it back and the shard reads unchanged.
            displaced = self.detach_entry(&key, index);
        }

        while self.current_weight + weight > self.max_weight {
            let Some(victim) = self.policy.choose_victim(&self.arena) else {
                self.reinstate(displaced);
                Metrics::incr(&self.metrics.admission_denied);
                return Ok(PutOutcome::Rejected);
            };
            if !self.policy.admit(&self.arena, key_hash, victim) {
                self.reinstate(displaced);
                Metrics::incr(&self.metrics.admission_denied);
                return Ok(PutOutcome::Rejected);
            }
            let victim_key = self.arena.get(victim).unwrap().key.clone();
            self.remove_entry(&victim_key, victim);
            Metrics::incr(&self.metrics.evictions);
        }

        let mut entry = Entry::new(key.clone(), value, key_hash, weight, now, ttl);
        entry.version = version;
        entry.dirty = dirty;
        let index = self.arena.insert(entry);
        self.policy.on_insert(&mut self.arena, index);
        self.map.insert(key, index);
        self.current_weight += weight;
        Ok(PutOutcome::Admitted)
    }

    /// Remove a key. Returns whether it was present.
    pub fn invalidate(&mut self, key: &Bytes) -> bool {
        match self.map.get(key).copied() {
            Some(index) => {
                self.remove_entry(key, index);
                true
            }
            None => false,
        }
    }

    /// Remove up to `budget` expired entries. Bounded so one sweep never
    /// turns into a long critical section.
    pub fn sweep_expired(&mut self, now: Instant, budget: usize) -> usize {
        let expired: Vec<(Bytes, u32)> = self
            .map
            .iter()
            .filter(|(_, &index)| self.arena.get(index).map_or(false, |e| e.is_expired(now)))
            .take(budget)
            .map(|(key, &index)| (key.clone(), index))
            .collect();
        let swept = expired.len();
        for (key, index) in expired {
            self.remove_entry(&key, index);
            Metrics::incr(&self.metrics.expired);
        }
        swept
    }

    /// Version of the live entry for `key`, if present. Used by the flush
    /// path to coalesce stale write-behind items.
    pub fn version_of(&self, key: &Bytes) -> Option<u64> {
        self.map
            .get(key)
            .and_then(|&index| self.arena.get(index))
            .map(|e| e.version)
    }

    pub fn is_dirty(&self, key: &Bytes) -> Option<bool> {
        self.map
            .get(key)
            .and_then(|&index| self.arena.get(index))
            .map(|e| e.dirty)
    }

    /// Clear the dirty flag iff the entry still carries `version`.
    pub fn clear_dirty_if(&mut self, key: &Bytes, version: u64) {
        if let Some(&index) = self.map.get(key) {
            if let Some(entry) = self.arena.get_mut(index) {
                if entry.version == version {
                    entry.dirty = false;
                }
            }
        }
    }

    /// Join (or start) the in-flight load for `key`. Returns the shared
    /// rendezvous and whether this caller is the loader.
    pub fn join_load(&mut self, key: &Bytes) -> (Arc<InflightLoad>, bool) {
        match self.inflight.entry(key.clone()) {
            hash_map::Entry::Occupied(slot) => (Arc::clone(slot.get()), false),
            hash_map::Entry::Vacant(slot) => {
                let load = Arc::new(InflightLoad::new());
                slot.insert(Arc::clone(&load));
                (load, true)
            }
        }
    }

    /// Drop the in-flight registration once the loader has a result.
    pub fn finish_load(&mut self, key: &Bytes) {
        self.inflight.remove(key);
    }

    /// Per-key ordering lock for write-behind flushes. The caller locks
    /// the returned mutex around its store attempts and calls
    /// [`Shard::end_flush`] when done, never while holding the shard.
    pub fn begin_flush(&mut self, key: &Bytes) -> Arc<Mutex<()>> {
        let slot = self
            .flush_order
            .entry(key.clone())
            .or_insert_with(|| FlushSlot {
                lock: Arc::new(Mutex::new(())),
                refs: 0,
            });
        slot.refs += 1;
        Arc::clone(&slot.lock)
    }

    pub fn end_flush(&mut self, key: &Bytes) {
        if let Some(slot) = self.flush_order.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                self.flush_order.remove(key);
            }
        }
    }

    fn remove_entry(&mut self, key: &Bytes, index: u32) {
        self.detach_entry(key, index);
    }

    /// Unlink and reclaim an entry, returning it so the caller can decide
    /// to drop or reinstate it.
    fn detach_entry(&mut self, key: &Bytes, index: u32) -> Option<Entry> {
        self.policy.on_remove(&mut self.arena, index);
        let entry = self.arena.remove(index);
        if let Some(entry) = &entry {
            self.current_weight -= entry.weight;
        }
        self.map.remove(key);
        entry
    }

    fn reinstate(&mut self, displaced: Option<Entry>) {
        let Some(entry) = displaced else { return };
        let key = entry.key.clone();
        let weight = entry.weight;
        let index = self.arena.insert(entry);
        self.policy.on_insert(&mut self.arena, index);
        self.map.insert(key, index);
        self.current_weight += weight;
    }
}

#[cfg(test)]
mod tests {
    use crate::policy::PolicyKind;

    use super::*;

    fn shard(max_weight: u64, policy: PolicyKind) -> Shard {
        Shard::new(
            max_weight,
            policy.build(max_weight),
            Arc::new(Metrics::default()),
        )
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn val(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn put(s: &mut Shard, k: &str, v: &str, weight: u64) -> PutOutcome {
        let now = Instant::now();
        s.put(key(k), val(v), k.len() as u64, weight, now, None, 0, false)
            .unwrap()
    }

    #[test]
    fn put_then_get() {
        let mut s = shard(10, PolicyKind::Lru);
        assert_eq!(put(&mut s, "a", "1", 1), PutOutcome::Admitted);
        assert_eq!(s.get(&key("a"), Instant::now()), Some(val("1")));
        assert_eq!(s.get(&key("missing"), Instant::now()), None);
    }

    #[test]
    fn weight_budget_is_never_exceeded() {
        let mut s = shard(5, PolicyKind::Lru);
        for i in 0..50 {
            let k = format!("k{i}");
            put(&mut s, &k, "v", 2);
            assert!(s.weight() <= 5, "weight {} over budget", s.weight());
        }
    }

    #[test]
    fn oversized_entry_is_rejected_without_eviction() {
        let mut s = shard(4, PolicyKind::Lru);
        put(&mut s, "a", "1", 2);
        let err = s
            .put(key("big"), val("x"), 9, 5, Instant::now(), None, 0, false)
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::WeightTooLarge { weight: 5, max: 4 }
        );
        assert_eq!(s.len(), 1, "no eviction on an impossible insert");
        assert_eq!(s.get(&key("a"), Instant::now()), Some(val("1")));
    }

    #[test]
    fn insert_at_exact_capacity_evicts_exactly_once() {
        let mut s = shard(4, PolicyKind::Lru);
        put(&mut s, "a", "1", 2);
        put(&mut s, "b", "2", 2);
        // Shard is full; a weight-2 insert displaces exactly one entry.
        put(&mut s, "c", "3", 2);
        assert_eq!(s.metrics.snapshot().evictions, 1);
        assert_eq!(s.weight(), 4);
        assert_eq!(s.get(&key("a"), Instant::now()), None, "LRU victim");
        assert_eq!(s.get(&key("c"), Instant::now()), Some(val("3")));
    }

    #[test]
    fn replace_same_weight_is_idempotent_on_weight() {
        let mut s = shard(4, PolicyKind::Lru);
        put(&mut s, "a", "1", 2);
        put(&mut s, "a", "2", 2);
        assert_eq!(s.weight(), 2);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(&key("a"), Instant::now()), Some(val("2")));
    }

    #[test]
    fn replace_with_new_weight_adjusts_budget() {
        let mut s = shard(4, PolicyKind::Lru);
        put(&mut s, "a", "1", 1);
        put(&mut s, "a", "22", 3);
        assert_eq!(s.weight(), 3);
        assert_eq!(s.get(&key("a"), Instant::now()), Some(val("22")));
    }

    #[test]
    fn invalidate_removes() {
        let mut s = shard(4, PolicyKind::Lru);
        put(&mut s, "a", "1", 1);
        assert!(s.invalidate(&key("a")));
        assert!(!s.invalidate(&key("a")));
        assert_eq!(s.get(&key("a"), Instant::now()), None);
        assert_eq!(s.weight(), 0);
    }

    #[test]
    fn expired_entry_reads_as_miss_and_is_removed() {
        let mut s = shard(4, PolicyKind::Lru);
        let now = Instant::now();
        s.put(
            key("a"),
            val("1"),
            1,
            1,
            now,
            Some(Duration::from_millis(10)),
            0,
            false,
        )
        .unwrap();
        assert_eq!(s.get(&key("a"), now), Some(val("1")));
        assert_eq!(s.get(&key("a"), now + Duration::from_millis(10)), None);
        assert_eq!(s.len(), 0, "expired entry removed on observation");
        assert_eq!(s.metrics.snapshot().expired, 1);
    }

    #[test]
    fn sweep_expired_is_bounded() {
        let mut s = shard(100, PolicyKind::Lru);
        let now = Instant::now();
        for i in 0..10 {
            s.put(
                key(&format!("k{i}")),
                val("v"),
                i,
                1,
                now,
                Some(Duration::from_millis(1)),
                0,
                false,
            )
            .unwrap();
        }
        let later = now + Duration::from_secs(1);
        assert_eq!(s.sweep_expired(later, 4), 4);
        assert_eq!(s.len(), 6);
        assert_eq!(s.sweep_expired(later, 100), 6);
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn rejected_put_leaves_shard_unchanged() {
        // TinyLFU rejects a cold candidate against a hot victim.
        let mut s = shard(2, PolicyKind::TinyLfu);
        put(&mut s, "a", "1", 1);
        put(&mut s, "b", "2", 1);
        for _ in 0..50 {
            s.get(&key("a"), Instant::now());
            s.get(&key("b"), Instant::now());
        }
        let weight_before = s.weight();
        let len_before = s.len();
        assert_eq!(put(&mut s, "c", "3", 1), PutOutcome::Rejected);
        assert_eq!(s.weight(), weight_before);
        assert_eq!(s.len(), len_before);
        assert_eq!(s.metrics.snapshot().admission_denied, 1);
    }

    #[test]
    fn rejected_replacement_keeps_the_previous_entry() {
        let mut s = shard(2, PolicyKind::TinyLfu);
        let now = Instant::now();
        s.put(key("a"), val("1"), 11, 1, now, None, 0, false).unwrap();
        s.put(key("b"), val("2"), 22, 1, now, None, 0, false).unwrap();
        for _ in 0..50 {
            s.get(&key("b"), now);
        }

        // Replacing "a" with a heavier value needs an eviction, and the
        // hot "b" wins the admission duel. The old "a" must survive.
        let outcome = s
            .put(key("a"), val("22"), 11, 2, now, None, 1, false)
            .unwrap();
        assert_eq!(outcome, PutOutcome::Rejected);
        assert_eq!(s.get(&key("a"), now), Some(val("1")));
        assert_eq!(s.get(&key("b"), now), Some(val("2")));
        assert_eq!(s.len(), 2);
        assert_eq!(s.weight(), 2);
    }

    #[test]
    fn flush_order_slots_are_reference_counted() {
        let mut s = shard(4, PolicyKind::Lru);
        let first = s.begin_flush(&key("k"));
        let second = s.begin_flush(&key("k"));
        assert!(Arc::ptr_eq(&first, &second), "same key shares one lock");
        assert_eq!(s.flush_order.len(), 1);

        s.end_flush(&key("k"));
        assert_eq!(s.flush_order.len(), 1, "still held by the second flush");
        s.end_flush(&key("k"));
        assert!(s.flush_order.is_empty(), "last holder removes the slot");
    }

    #[test]
    fn dirty_version_bookkeeping() {
        let mut s = shard(4, PolicyKind::Lru);
        let now = Instant::now();
        s.put(key("a"), val("1"), 1, 1, now, None, 7, true).unwrap();
        assert_eq!(s.is_dirty(&key("a")), Some(true));
        assert_eq!(s.version_of(&key("a")), Some(7));

        // Stale version: flag untouched.
        s.clear_dirty_if(&key("a"), 3);
        assert_eq!(s.is_dirty(&key("a")), Some(true));
        s.clear_dirty_if(&key("a"), 7);
        assert_eq!(s.is_dirty(&key("a")), Some(false));
    }

    #[test]
    fn join_load_coalesces() {
        let mut s = shard(4, PolicyKind::Lru);
        let (first, is_loader) = s.join_load(&key("a"));
        assert!(is_loader);
        let (second, is_loader) = s.join_load(&key("a"));
        assert!(!is_loader);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(s.inflight_len(), 1);

        first.publish(Ok(Some(val("v"))));
        s.finish_load(&key("a"));
        assert_eq!(s.inflight_len(), 0);
        assert_eq!(second.wait(None), Some(Ok(Some(val("v")))));
    }

    #[test]
    fn inflight_wait_times_out() {
        let load = {
            let mut s = shard(4, PolicyKind::Lru);
            let (load, _) = s.join_load(&key("a"));
            load
        };
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(load.wait(Some(deadline)), None);
    }
}
