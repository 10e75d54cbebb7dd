use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Source of truth behind the cache.
///
/// Both calls are expected to bound their own latency (configure a
/// per-call deadline in the implementation); the cache never invokes them
/// while holding a shard lock, but a coalesced load does keep waiters
/// parked until the loader returns. Panics out of either method are caught
/// at the cache/worker boundary and converted into errors.
pub trait BackingStore: Send + Sync {
    fn load(&self, key: &Bytes) -> Result<Option<Bytes>, StoreError>;
    fn store(&self, key: &Bytes, value: &Bytes) -> Result<(), StoreError>;
}

/// A write-behind flush that exhausted its retry budget. Surfaced on the
/// cache's error channel; the dirty flag for this version has been cleared
/// so the pool stops retrying.
#[derive(Debug, Clone)]
pub struct FlushFailure {
    pub key: Bytes,
    pub value: Bytes,
    pub error: StoreError,
}

/// Trivial in-process store, handy as a write-behind sink in tests and
/// demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<Bytes, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl BackingStore for MemoryStore {
    fn load(&self, key: &Bytes) -> Result<Option<Bytes>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn store(&self, key: &Bytes, value: &Bytes) -> Result<(), StoreError> {
        self.map.lock().insert(key.clone(), value.clone());
        Ok(())
    }
}
