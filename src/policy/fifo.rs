use crate::arena::{Arena, IndexList, NIL};

use super::EvictionPolicy;

/// First-in, first-out ordering.
///
/// The simplest policy: insertion order only. Hits are ignored, so a
/// frequently read entry is evicted exactly as fast as a cold one.
pub struct FifoPolicy {
    list: IndexList,
}

impl FifoPolicy {
    pub fn new() -> Self {
        FifoPolicy {
            list: IndexList::new(),
        }
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn on_insert(&mut self, arena: &mut Arena, index: u32) {
        self.list.push_head(arena, index);
    }

    fn on_access(&mut self, _arena: &mut Arena, _index: u32) {
        // FIFO ignores accesses.
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
        "FIFO"
    }
}
