use std::collections::{BTreeMap, HashMap};

use crate::arena::Arena;

use super::EvictionPolicy;

/// Least-frequently-used ordering with oldest-access tie-breaking.
///
/// Entries are kept in an ordered set keyed by `(access_count, tick)`,
/// where `tick` is a policy-local logical timestamp bumped on every insert
/// and access. The victim is the minimum element: lowest frequency first,
/// and among equals the one accessed longest ago (smallest tick).
pub struct LfuPolicy {
    /// `(access_count, last_access_tick) -> arena index`, ordered.
    order: BTreeMap<(u64, u64), u32>,
    /// Reverse lookup so `on_access`/`on_remove` can find the old key.
    position: HashMap<u32, (u64, u64)>,
    tick: u64,
}

impl LfuPolicy {
    pub fn new() -> Self {
        LfuPolicy {
            order: BTreeMap::new(),
            position: HashMap::new(),
            tick: 0,
        }
    }

    fn reposition(&mut self, index: u32, count: u64) {
        if let Some(old) = self.position.remove(&index) {
            self.order.remove(&old);
        }
        self.tick += 1;
        let key = (count, self.tick);
        self.order.insert(key, index);
        self.position.insert(index, key);
    }
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LfuPolicy {
    fn on_insert(&mut self, arena: &mut Arena, index: u32) {
        let count = arena.get(index).map_or(0, |e| e.access_count);
        self.reposition(index, count);
    }

    fn on_access(&mut self, arena: &mut Arena, index: u32) {
        let count = arena.get(index).map_or(0, |e| e.access_count);
        self.reposition(index, count);
    }

    fn on_remove(&mut self, _arena: &mut Arena, index: u32) {
        if let Some(old) = self.position.remove(&index) {
            self.order.remove(&old);
        }
    }

    fn choose_victim(&mut self, _arena: &Arena) -> Option<u32> {
        self.order.iter().next().map(|(_, &index)| index)
    }

    fn name(&self) -> &'static str {
        "LFU"
    }
}
