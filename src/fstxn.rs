//! Filesystem state and per-request transactions.
//!
//! `FsState` bundles the superblock, journal, inode cache, lock map
//! and the two allocators. `FsTxn` is the scope of one NFS procedure:
//! it borrows inodes through the cache and lock map, drives an
//! alloc-transaction, and on commit (or abort) puts every inode back
//! and releases its locks.
//!
//! An owned inode lives *inside* the transaction while it is locked;
//! callers reach it through `ip`/`ip_mut`/`ip_atxn`. Multi-inode
//! operations must acquire in ascending inum order to stay deadlock
//! free.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::sync::Arc;

use log::debug;

use crate::alloc::Alloc;
use crate::alloctxn::AllocTxn;
use crate::cache::{CSlot, Cache};
use crate::disk::Disk;
use crate::inode::{Inode, Kind};
use crate::jrnl::Log;
use crate::lockmap::LockMap;
use crate::param::{Bnum, Inum, ICACHESZ, NULLINUM};
use crate::superblock::FsSuper;

pub struct FsState {
    pub sb: Arc<FsSuper>,
    pub log: Arc<Log>,
    pub icache: Cache<Inode>,
    pub lockmap: LockMap,
    pub balloc: Arc<Alloc>,
    pub ialloc: Arc<Alloc>,
}

fn read_bitmap(disk: &dyn Disk, start: Bnum, len: u64) -> io::Result<Vec<u8>> {
    let mut bitmap = Vec::new();
    for i in 0..len {
        bitmap.extend_from_slice(&disk.read(start + i)?);
    }
    Ok(bitmap)
}

impl FsState {
    /// Assemble the in-memory state; the bitmaps are read from the
    /// (journal-recovered) disk.
    pub fn new(sb: Arc<FsSuper>, log: Arc<Log>) -> io::Result<FsState> {
        let bbytes = read_bitmap(&*sb.disk, sb.bitmap_block_start(), sb.n_block_bitmap)?;
        let balloc = Arc::new(Alloc::new(bbytes, sb.max_bnum()));
        let ibytes = read_bitmap(&*sb.disk, sb.bitmap_inode_start(), sb.n_inode_bitmap)?;
        let ialloc = Arc::new(Alloc::new(ibytes, sb.num_inodes()));
        Ok(FsState {
            icache: Cache::new(ICACHESZ),
            lockmap: LockMap::new(),
            sb,
            log,
            balloc,
            ialloc,
        })
    }
}

struct Owned {
    slot: Arc<CSlot<Inode>>,
    ip: Inode,
}

pub struct FsTxn {
    st: Arc<FsState>,
    pub atxn: AllocTxn,
    owned: BTreeMap<Inum, Owned>,
}

impl FsTxn {
    pub fn begin(st: &Arc<FsState>) -> FsTxn {
        let atxn = AllocTxn::begin(
            st.sb.clone(),
            &st.log,
            st.balloc.clone(),
            st.ialloc.clone(),
        );
        FsTxn {
            st: st.clone(),
            atxn,
            owned: BTreeMap::new(),
        }
    }

    /// Lock and load inode `inum`. Refuses free or unlinked inodes;
    /// the shrinker uses `get_inode_inum_free` for those. Idempotent
    /// for inodes this transaction already owns.
    pub fn get_inode_inum(&mut self, inum: Inum) -> Option<Inum> {
        self.get_inode(inum, false)
    }

    /// Like `get_inode_inum` but also accepts inodes with no links,
    /// which are owned by the reclamation path.
    pub fn get_inode_inum_free(&mut self, inum: Inum) -> Option<Inum> {
        self.get_inode(inum, true)
    }

    fn get_inode(&mut self, inum: Inum, allow_free: bool) -> Option<Inum> {
        if inum == NULLINUM || inum >= self.st.sb.num_inodes() {
            return None;
        }
        if self.owned.contains_key(&inum) {
            return Some(inum);
        }
        self.st.lockmap.acquire(inum);
        let slot = self.st.icache.lookup_slot(inum);
        let ip = {
            let mut g = slot.obj.lock().unwrap();
            match g.take() {
                Some(ip) => ip,
                None => Inode::read_inode(&mut self.atxn, inum),
            }
        };
        if !allow_free && (ip.kind == Kind::Free || ip.nlink == 0) {
            *slot.obj.lock().unwrap() = Some(ip);
            drop(slot);
            self.st.lockmap.release(inum);
            return None;
        }
        self.owned.insert(inum, Owned { slot, ip });
        Some(inum)
    }

    /// Allocate a fresh inode: claims an inum, locks it, and installs
    /// an initialized inode with a bumped generation.
    pub fn alloc_inode(&mut self, kind: Kind, mode: u32) -> Option<Inum> {
        let inum = self.atxn.alloc_inum();
        if inum == NULLINUM {
            return None;
        }
        // Freshly allocated, so nobody else holds it; the lock cannot
        // block.
        self.st.lockmap.acquire(inum);
        let slot = self.st.icache.lookup_slot(inum);
        let old_gen = {
            let mut g = slot.obj.lock().unwrap();
            match g.take() {
                Some(old) => old.gen,
                None => Inode::read_inode(&mut self.atxn, inum).gen,
            }
        };
        let mut ip = Inode::init(inum, old_gen + 1, kind);
        ip.mode = mode;
        ip.write_inode(&mut self.atxn);
        self.owned.insert(inum, Owned { slot, ip });
        Some(inum)
    }

    pub fn own_inum(&self, inum: Inum) -> bool {
        self.owned.contains_key(&inum)
    }

    /// Borrow an owned inode. Only legal when `own_inum(inum)`.
    pub fn ip(&self, inum: Inum) -> &Inode {
        &self.owned.get(&inum).expect("inode not owned").ip
    }

    pub fn ip_mut(&mut self, inum: Inum) -> &mut Inode {
        &mut self.owned.get_mut(&inum).expect("inode not owned").ip
    }

    /// Borrow an owned inode together with the alloc-transaction, for
    /// operations that do I/O through both.
    pub fn ip_atxn(&mut self, inum: Inum) -> (&mut Inode, &mut AllocTxn) {
        let o = self.owned.get_mut(&inum).expect("inode not owned");
        (&mut o.ip, &mut self.atxn)
    }

    /// Put an inode back into its cache slot and release its lock.
    /// Callers must not release an inode with uncommitted writes.
    pub fn release_inode(&mut self, inum: Inum) {
        let o = self.owned.remove(&inum).expect("inode not owned");
        *o.slot.obj.lock().unwrap() = Some(o.ip);
        drop(o.slot);
        self.st.lockmap.release(inum);
    }

    /// Release every inode this transaction holds, keeping the journal
    /// op open. Used by multi-inode paths that discovered they must
    /// re-acquire their lock set in a different order; only legal while
    /// no writes are pending.
    pub fn release_all(&mut self) {
        let owned = mem::take(&mut self.owned);
        for (inum, o) in owned {
            *o.slot.obj.lock().unwrap() = Some(o.ip);
            drop(o.slot);
            self.st.lockmap.release(inum);
        }
    }

    /// Commit the transaction: flush pending bitmap bits, wait for the
    /// journal, reconcile the allocators, and release every owned
    /// inode. Returns the journal outcome.
    pub fn commit(self) -> bool {
        self.commit_how(true)
    }

    /// Commit without waiting for durability (WCC-unstable).
    pub fn commit_unstable(self) -> bool {
        self.commit_how(false)
    }

    fn commit_how(mut self, stable: bool) -> bool {
        self.atxn.pre_commit();
        let ok = self.atxn.op.commit_wait(stable);
        if ok {
            self.atxn.post_commit();
        } else {
            self.atxn.post_abort();
        }
        let owned = mem::take(&mut self.owned);
        for (inum, o) in owned {
            // On failure the in-memory inode may hold never-committed
            // mutations; drop it so the next access reloads from disk.
            *o.slot.obj.lock().unwrap() = if ok { Some(o.ip) } else { None };
            drop(o.slot);
            self.st.lockmap.release(inum);
        }
        ok
    }

    /// Abandon the transaction. Nothing reaches disk; allocated
    /// numbers go back and owned slots are invalidated.
    pub fn abort(self) {
        debug!("abort");
        self.atxn.post_abort();
        // Drop releases locks and the journal reservation.
    }
}

impl Drop for FsTxn {
    fn drop(&mut self) {
        let owned = mem::take(&mut self.owned);
        for (inum, o) in owned {
            *o.slot.obj.lock().unwrap() = None;
            drop(o.slot);
            self.st.lockmap.release(inum);
        }
    }
}
