use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use crate::id::PackId;
use crate::pack::Pack;

/// Byte-budgeted LRU of decoded packs, shared between download workers.
///
/// Entries are immutable `Arc<Pack>`s, so a reader holding a returned
/// reference is unaffected by eviction. An entry's weight is the sealed
/// pack's encoded length. Eviction removes least-recently-used entries until
/// the budget holds again, which may evict a just-inserted entry larger than
/// the whole budget (the read still succeeds, it just isn't cached).
pub struct PackCache {
    inner: Mutex<Inner>,
}

struct Inner {
    cache: LruCache<PackId, Arc<Pack>>,
    used_bytes: u64,
    max_bytes: u64,
}

impl PackCache {
    /// `max_bytes == 0` means unbounded.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::unbounded(),
                used_bytes: 0,
                max_bytes,
            }),
        }
    }

    /// Shared reference on hit; promotes the entry to most-recently-used.
    pub fn get(&self, id: &PackId) -> Option<Arc<Pack>> {
        let mut inner = self.inner.lock().unwrap();
        inner.cache.get(id).cloned()
    }

    pub fn insert(&self, id: PackId, pack: Arc<Pack>) {
        let weight = pack.encoded_len() as u64;
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.cache.put(id, pack) {
            inner.used_bytes -= old.encoded_len() as u64;
        }
        inner.used_bytes += weight;

        while inner.max_bytes != 0 && inner.used_bytes > inner.max_bytes {
            let Some((evicted_id, evicted)) = inner.cache.pop_lru() else {
                break;
            };
            inner.used_bytes -= evicted.encoded_len() as u64;
            debug!(pack = %evicted_id, "evicted pack from cache");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().unwrap().used_bytes
    }
}
