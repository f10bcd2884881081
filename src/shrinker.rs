//! Background reclamation of file block trees.
//!
//! Freeing a large file block-by-block would blow a single journal
//! transaction, so the last unlink (or a truncate) hands the inode to
//! a shrinker worker. Each worker iteration is its own transaction:
//! lock the inode, free one bounded batch, commit. The final
//! transaction of an unlinked inode also frees the inum, so the
//! number cannot be reallocated before the blocks are durably gone.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;
use scopeguard::defer;

use crate::fstxn::{FsState, FsTxn};
use crate::inode::Kind;
use crate::param::Inum;

struct ShrinkSt {
    /// Workers still running.
    nthread: u32,
    crash: bool,
}

pub struct ShrinkerSt {
    mu: Mutex<ShrinkSt>,
    cond_shut: Condvar,
    fsstate: Arc<FsState>,
}

impl ShrinkerSt {
    pub fn new(fsstate: Arc<FsState>) -> Arc<ShrinkerSt> {
        Arc::new(ShrinkerSt {
            mu: Mutex::new(ShrinkSt {
                nthread: 0,
                crash: false,
            }),
            cond_shut: Condvar::new(),
            fsstate,
        })
    }

    fn crashed(&self) -> bool {
        self.mu.lock().unwrap().crash
    }

    /// One transaction-bounded step at a time until the inode's tree
    /// matches its size; the final step of an unlinked inode frees the
    /// inum. Stops early on commit failure or crash.
    pub fn do_shrink(&self, inum: Inum) -> bool {
        loop {
            let mut op = FsTxn::begin(&self.fsstate);
            if op.get_inode_inum_free(inum).is_none() {
                panic!("shrink: inode {} disappeared", inum);
            }
            debug!("do_shrink # {}", inum);
            let (ip, atxn) = op.ip_atxn(inum);
            let more = ip.shrink(atxn);
            // a truncate worker and an unlink worker can both hold this
            // inum; whoever sees it already freed must not free it twice
            let free_it =
                !more && ip.kind != Kind::Free && ip.nlink == 0 && ip.shrink_size == 0;
            if free_it {
                ip.kind = Kind::Free;
                ip.size = 0;
                // gen stays so a later allocation of this inum bumps it
                ip.write_inode(atxn);
                atxn.free_inum(inum);
            }
            if !op.commit() {
                return false;
            }
            if !more || self.crashed() {
                return true;
            }
        }
    }

    /// Spawn a worker to reclaim `inum` in the background.
    pub fn start_shrinker(self: &Arc<Self>, inum: Inum) {
        debug!("start shrink thread # {}", inum);
        self.mu.lock().unwrap().nthread += 1;
        let this = Arc::clone(self);
        thread::spawn(move || {
            let done = Arc::clone(&this);
            defer! {
                let mut st = done.mu.lock().unwrap();
                st.nthread -= 1;
                done.cond_shut.notify_all();
            }
            if !this.do_shrink(inum) {
                panic!("shrink: commit failed for inode {}", inum);
            }
            debug!("shrinker: done shrinking # {}", inum);
        });
    }

    /// Wait for all workers to finish.
    pub fn shutdown(&self) {
        let mut st = self.mu.lock().unwrap();
        while st.nthread > 0 {
            debug!("shutdown: waiting for {} shrinker threads", st.nthread);
            st = self.cond_shut.wait(st).unwrap();
        }
    }

    /// Stop workers between iterations without letting them finish
    /// their inodes; outstanding transactions still commit.
    pub fn crash(&self) {
        let mut st = self.mu.lock().unwrap();
        st.crash = true;
        while st.nthread > 0 {
            debug!("crash: waiting for {} shrinker threads", st.nthread);
            st = self.cond_shut.wait(st).unwrap();
        }
    }
}
