use std::time::{Duration, Instant};

use bytes::Bytes;

/// Sentinel value indicating "no slot" (null pointer equivalent).
pub const NIL: u32 = u32::MAX;

/// Segment tag for multi-queue policies. Single-list policies leave it at
/// `SEG_WINDOW`.
pub const SEG_WINDOW: u8 = 0;
pub const SEG_MAIN: u8 = 1;

/// One cache entry, stored in the arena. Entries double as intrusive list
/// nodes: `prev`/`next` are arena indices managed by an [`IndexList`].
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    /// Fingerprint of the key, precomputed so policies can consult
    /// frequency sketches during eviction without rehashing.
    pub key_hash: u64,
    pub weight: u64,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub access_count: u64,
    pub expires_at: Option<Instant>,
    /// True iff a put has happened since the last successful write-behind
    /// flush for this key.
    pub dirty: bool,
    /// Monotonic per-put sequence, used to coalesce queued flushes.
    pub version: u64,
    pub segment: u8,
    pub prev: u32,
    pub next: u32,
}

impl Entry {
    pub fn new(
        key: Bytes,
        value: Bytes,
        key_hash: u64,
        weight: u64,
        now: Instant,
        ttl: Option<Duration>,
    ) -> Self {
        Entry {
            key,
            value,
            key_hash,
            weight,
            inserted_at: now,
            last_access: now,
            access_count: 0,
            expires_at: ttl.map(|d| now + d),
            dirty: false,
            version: 0,
            segment: SEG_WINDOW,
            prev: NIL,
            next: NIL,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Slot arena for cache entries.
///
/// Entries are stored in a `Vec<Option<Entry>>` and addressed by `u32`
/// index. A free-list tracks reclaimed slots for O(1) allocation. Unlike a
/// pointer-linked list, index links cannot form ownership cycles: every
/// entry's lifetime is tied to the arena, which is tied to its shard.
pub struct Arena {
    slots: Vec<Option<Entry>>,
    free_list: Vec<u32>,
    len: usize,
}

impl Arena {
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Entry> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Entry> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Place an entry into a free slot, growing if none is available.
    /// The entry is not linked into any list.
    pub fn insert(&mut self, entry: Entry) -> u32 {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(entry);
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(entry));
            index
        }
    }

    /// Reclaim a slot. The entry must already be unlinked from any list.
    pub fn remove(&mut self, index: u32) -> Option<Entry> {
        let entry = self.slots.get_mut(index as usize)?.take()?;
        debug_assert_eq!(entry.prev, NIL);
        debug_assert_eq!(entry.next, NIL);
        self.free_list.push(index);
        self.len -= 1;
        Some(entry)
    }
}

/// Intrusive doubly-linked list over arena slots.
///
/// The list owns only head/tail indices; the links live inside the entries
/// themselves. Policies own one or more lists over the same arena (TinyLFU
/// keeps a window list and a main list), so ordering state stays inside the
/// policy while storage stays inside the shard.
#[derive(Debug, Clone, Copy)]
pub struct IndexList {
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl IndexList {
    pub const fn new() -> Self {
        IndexList {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link an unlinked entry at the head (most-recent position).
    pub fn push_head(&mut self, arena: &mut Arena, index: u32) {
        let old_head = self.head;
        {
            let entry = arena.get_mut(index).unwrap();
            debug_assert_eq!(entry.prev, NIL);
            debug_assert_eq!(entry.next, NIL);
            entry.next = old_head;
        }
        if old_head != NIL {
            arena.get_mut(old_head).unwrap().prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
        self.len += 1;
    }

    /// Unlink an entry that is known to be in this list. The slot stays
    /// allocated; the caller decides whether to relink or reclaim it.
    pub fn unlink(&mut self, arena: &mut Arena, index: u32) {
        let (prev, next) = {
            let entry = arena.get_mut(index).unwrap();
            let links = (entry.prev, entry.next);
            entry.prev = NIL;
            entry.next = NIL;
            links
        };
        if prev != NIL {
            arena.get_mut(prev).unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            arena.get_mut(next).unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
        self.len -= 1;
    }

    /// Move an entry in this list to the head.
    pub fn move_to_head(&mut self, arena: &mut Arena, index: u32) {
        if self.head == index {
            return;
        }
        self.unlink(arena, index);
        self.push_head(arena, index);
    }

    /// Unlink and return the tail (least-recent) index.
    pub fn pop_tail(&mut self, arena: &mut Arena) -> Option<u32> {
        if self.tail == NIL {
            return None;
        }
        let index = self.tail;
        self.unlink(arena, index);
        Some(index)
    }
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}
