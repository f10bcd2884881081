//! Per-key advisory locks, keyed by inode number.
//!
//! `acquire` blocks until the key is free; `release` wakes one waiter.
//! Entries with no holder and no waiters are dropped from the map.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

struct LockState {
    held: bool,
    /// Holders plus waiters with an interest in this key.
    refs: usize,
}

struct KeyLock {
    st: Mutex<LockState>,
    cv: Condvar,
}

pub struct LockMap {
    keys: Mutex<HashMap<u64, Arc<KeyLock>>>,
}

impl LockMap {
    pub fn new() -> LockMap {
        LockMap {
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, key: u64) {
        let l = {
            let mut m = self.keys.lock().unwrap();
            let l = m
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(KeyLock {
                        st: Mutex::new(LockState {
                            held: false,
                            refs: 0,
                        }),
                        cv: Condvar::new(),
                    })
                })
                .clone();
            l.st.lock().unwrap().refs += 1;
            l
        };
        let mut g = l.st.lock().unwrap();
        while g.held {
            g = l.cv.wait(g).unwrap();
        }
        g.held = true;
    }

    pub fn release(&self, key: u64) {
        let mut m = self.keys.lock().unwrap();
        let l = m.get(&key).expect("release of unheld key").clone();
        {
            let mut g = l.st.lock().unwrap();
            assert!(g.held, "release of unheld key");
            g.held = false;
            g.refs -= 1;
            if g.refs == 0 {
                m.remove(&key);
            }
        }
        drop(m);
        l.cv.notify_one();
    }
}

impl Default for LockMap {
    fn default() -> LockMap {
        LockMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn acquire_release() {
        let lm = LockMap::new();
        lm.acquire(5);
        lm.release(5);
        lm.acquire(5);
        lm.release(5);
        assert!(lm.keys.lock().unwrap().is_empty());
    }

    #[test]
    fn disjoint_keys_do_not_block() {
        let lm = LockMap::new();
        lm.acquire(1);
        lm.acquire(2);
        lm.release(2);
        lm.release(1);
    }

    #[test]
    fn contended_key_serializes() {
        let lm = Arc::new(LockMap::new());
        let in_crit = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lm = lm.clone();
            let in_crit = in_crit.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    lm.acquire(42);
                    assert_eq!(in_crit.fetch_add(1, Ordering::SeqCst), 0);
                    in_crit.fetch_sub(1, Ordering::SeqCst);
                    lm.release(42);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(lm.keys.lock().unwrap().is_empty());
    }
}
