//! Fixed-capacity keyed slot cache with LRU eviction.
//!
//! `lookup_slot` hands out a reference-counted slot. A slot with a live
//! outside reference is pinned: eviction walks the LRU order from the
//! front and takes the first unpinned entry. Callers serialize mutation
//! of a slot's contents through the lock map, keyed by the same id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::trace;

/// A cache slot. Freshly inserted slots hold `None` until the caller
/// fills them.
pub struct CSlot<T> {
    pub obj: Mutex<Option<T>>,
}

struct CacheInner<T> {
    entries: HashMap<u64, Arc<CSlot<T>>>,
    /// Keys in LRU order; front is the eviction candidate.
    lru: VecDeque<u64>,
}

pub struct Cache<T> {
    inner: Mutex<CacheInner<T>>,
    sz: usize,
}

impl<T> Cache<T> {
    pub fn new(sz: usize) -> Cache<T> {
        assert!(sz > 0);
        Cache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(sz),
                lru: VecDeque::with_capacity(sz),
            }),
            sz,
        }
    }

    /// Return the slot for `id`, inserting an empty one (evicting if
    /// full) on a miss. Hits are promoted to most-recently-used.
    pub fn lookup_slot(&self, id: u64) -> Arc<CSlot<T>> {
        let mut c = self.inner.lock().unwrap();
        if let Some(e) = c.entries.get(&id) {
            let e = e.clone();
            if let Some(pos) = c.lru.iter().position(|&k| k == id) {
                c.lru.remove(pos);
            }
            c.lru.push_back(id);
            return e;
        }
        if c.entries.len() >= self.sz {
            Self::evict(&mut c);
        }
        let e = Arc::new(CSlot {
            obj: Mutex::new(None),
        });
        c.entries.insert(id, e.clone());
        c.lru.push_back(id);
        e
    }

    fn evict(c: &mut CacheInner<T>) {
        let pos = c
            .lru
            .iter()
            .position(|k| Arc::strong_count(&c.entries[k]) == 1)
            .expect("cache: every slot is pinned");
        let id = c.lru.remove(pos).unwrap();
        trace!("evict: {}", id);
        c.entries.remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
