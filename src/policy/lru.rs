use crate::arena::{Arena, IndexList, NIL};

use super::EvictionPolicy;

/// Least-recently-used ordering.
///
/// Every hit promotes the entry to the head of the list; the victim is
/// always the tail. `admit` is unconditionally true.
pub struct LruPolicy {
    list: IndexList,
}

impl LruPolicy {
    pub fn new() -> Self {
        LruPolicy {
            list: IndexList::new(),
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn on_insert(&mut self, arena: &mut Arena, index: u32) {
        self.list.push_head(arena, index);
    }

    fn on_access(&mut self, arena: &mut Arena, index: u32) {
        self.list.move_to_head(arena, index);
    }

    fn on_remove(&mut self, arena: &mut Arena, index: u32) {
        self.list.unlink(arena, index);
    }

    fn choose_victim(&mut self, _arena: &Arena) -> Option<u32> {
        match self.list.tail {
            NIL => None,
            tail => Some(tail),
        }
    }

    fn name(&self) -> &'static str {
        "LRU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testutil::put_entry;

    #[test]
    fn victim_is_least_recently_used() {
        let mut arena = Arena::with_capacity(8);
        let mut policy = LruPolicy::new();
        let a = put_entry(&mut arena, "a", 1);
        let b = put_entry(&mut arena, "b", 1);
        let c = put_entry(&mut arena, "c", 1);
        policy.on_insert(&mut arena, a);
        policy.on_insert(&mut arena, b);
        policy.on_insert(&mut arena, c);

        assert_eq!(policy.choose_victim(&arena), Some(a));

        // Touch "a": "b" becomes the victim.
        policy.on_access(&mut arena, a);
        assert_eq!(policy.choose_victim(&arena), Some(b));
    }

    #[test]
    fn remove_drops_bookkeeping() {
        let mut arena = Arena::with_capacity(8);
        let mut policy = LruPolicy::new();
        let a = put_entry(&mut arena, "a", 1);
        let b = put_entry(&mut arena, "b", 1);
        policy.on_insert(&mut arena, a);
        policy.on_insert(&mut arena, b);

        policy.on_remove(&mut arena, a);
        assert_eq!(policy.choose_victim(&arena), Some(b));
        policy.on_remove(&mut arena, b);
        assert_eq!(policy.choose_victim(&arena), None);
    }

    #[test]
    fn empty_policy_has_no_victim() {
        let arena = Arena::with_capacity(4);
        let mut policy = LruPolicy::new();
        assert_eq!(policy.choose_victim(&arena), None);
    }

    #[test]
    fn admit_is_always_true() {
        let mut arena = Arena::with_capacity(4);
        let mut policy = LruPolicy::new();
        let a = put_entry(&mut arena, "a", 1);
        policy.on_insert(&mut arena, a);
        assert!(policy.admit(&arena, 42, a));
    }
}
