//! Allocation-aware transactions.
//!
//! `AllocTxn` wraps a journal op with block and inode allocation. The
//! allocators hand out numbers immediately (in memory), but the bitmap
//! bits only reach disk in `pre_commit`, inside the same journal
//! transaction as the data that uses them. `post_commit` extends the
//! in-memory free state with the freed numbers; `post_abort` returns
//! the allocated ones. Either way the transaction leaks no bitmap bits
//! and never double-frees.

use std::sync::Arc;

use log::{debug, trace};

use crate::alloc::Alloc;
use crate::jrnl::{Addr, Buf, Log, Op};
use crate::param::{Bnum, Inum, NBITBLOCK, NULLBNUM, NULLINUM};
use crate::superblock::FsSuper;

pub struct AllocTxn {
    pub sb: Arc<FsSuper>,
    pub op: Op,
    pub balloc: Arc<Alloc>,
    pub ialloc: Arc<Alloc>,
    alloc_inums: Vec<Inum>,
    free_inums: Vec<Inum>,
    alloc_bnums: Vec<Bnum>,
    free_bnums: Vec<Bnum>,
}

impl AllocTxn {
    pub fn begin(
        sb: Arc<FsSuper>,
        log: &Arc<Log>,
        balloc: Arc<Alloc>,
        ialloc: Arc<Alloc>,
    ) -> AllocTxn {
        AllocTxn {
            sb,
            op: Op::begin(log),
            balloc,
            ialloc,
            alloc_inums: Vec::new(),
            free_inums: Vec::new(),
            alloc_bnums: Vec::new(),
            free_bnums: Vec::new(),
        }
    }

    /// Allocate a free inode number, or `NULLINUM` when none is left.
    pub fn alloc_inum(&mut self) -> Inum {
        let inum = self.ialloc.alloc_num();
        debug!("alloc_inum -> # {}", inum);
        if inum != NULLINUM {
            self.alloc_inums.push(inum);
        }
        inum
    }

    /// Schedule an inode number to be freed on commit.
    pub fn free_inum(&mut self, inum: Inum) {
        debug!("free_inum # {}", inum);
        self.free_inums.push(inum);
    }

    fn assert_valid_block(&self, blkno: Bnum) {
        assert!(
            blkno == 0 || (blkno >= self.sb.data_start() && blkno < self.sb.max_bnum()),
            "invalid blkno {} (max={})",
            blkno,
            self.sb.max_bnum()
        );
    }

    /// Allocate a free data block, or `NULLBNUM` when the disk is full.
    /// Free blocks are zero on disk, so the caller gets a zeroed block.
    pub fn alloc_block(&mut self) -> Bnum {
        let bn = self.balloc.alloc_num();
        self.assert_valid_block(bn);
        trace!("alloc_block -> {}", bn);
        if bn != NULLBNUM {
            self.alloc_bnums.push(bn);
        }
        bn
    }

    /// Schedule a block to be freed on commit. Zeroes the block through
    /// the journal, which keeps the free-blocks-are-zero invariant.
    pub fn free_block(&mut self, blkno: Bnum) {
        trace!("free_block {}", blkno);
        self.assert_valid_block(blkno);
        if blkno == 0 {
            return;
        }
        self.zero_block(blkno);
        self.free_bnums.push(blkno);
    }

    /// Load a data block for read or modification.
    pub fn read_block(&mut self, blkno: Bnum) -> &mut Buf {
        assert_ne!(blkno, 0, "read of the null block");
        self.assert_valid_block(blkno);
        let addr = self.sb.block_addr(blkno);
        self.op.read_buf(addr, NBITBLOCK)
    }

    /// Zero `blkno` within the transaction.
    pub fn zero_block(&mut self, blkno: Bnum) {
        let buf = self.read_block(blkno);
        for b in buf.data.iter_mut() {
            *b = 0;
        }
        buf.set_dirty();
    }

    fn write_bits(&mut self, nums: &[u64], base: Bnum, set: bool) {
        for &n in nums {
            let a = Addr::for_bit(base, n);
            let mut b = 1u8 << (n % 8);
            if !set {
                b = !b;
            }
            self.op.over_write(a, 1, &[b]);
        }
    }

    /// Write allocated/freed bits to the on-disk bitmaps.
    pub fn pre_commit(&mut self) {
        debug!(
            "pre_commit: alloc inums {:?} blks {:?}",
            self.alloc_inums, self.alloc_bnums
        );
        let inums = self.alloc_inums.clone();
        self.write_bits(&inums, self.sb.bitmap_inode_start(), true);
        let bnums = self.alloc_bnums.clone();
        self.write_bits(&bnums, self.sb.bitmap_block_start(), true);

        debug!(
            "pre_commit: free inums {:?} blks {:?}",
            self.free_inums, self.free_bnums
        );
        let inums = self.free_inums.clone();
        self.write_bits(&inums, self.sb.bitmap_inode_start(), false);
        let bnums = self.free_bnums.clone();
        self.write_bits(&bnums, self.sb.bitmap_block_start(), false);
    }

    /// The on-disk bitmaps are durable; release freed numbers to the
    /// in-memory allocators. Allocated ones stay claimed.
    pub fn post_commit(&self) {
        debug!(
            "post_commit: free inums {:?} blks {:?}",
            self.free_inums, self.free_bnums
        );
        for &inum in &self.free_inums {
            self.ialloc.free_num(inum);
        }
        for &bn in &self.free_bnums {
            self.balloc.free_num(bn);
        }
    }

    /// The commit never happened: return allocated numbers. Freed ones
    /// need nothing, their in-memory state was never changed.
    pub fn post_abort(&self) {
        debug!(
            "post_abort: alloc inums {:?} blks {:?}",
            self.alloc_inums, self.alloc_bnums
        );
        for &inum in &self.alloc_inums {
            self.ialloc.free_num(inum);
        }
        for &bn in &self.alloc_bnums {
            self.balloc.free_num(bn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{Disk, MemDisk};
    use crate::param::BSIZE;

    struct Env {
        sb: Arc<FsSuper>,
        log: Arc<Log>,
        balloc: Arc<Alloc>,
        ialloc: Arc<Alloc>,
    }

    impl Env {
        fn new() -> Env {
            let disk: Arc<dyn Disk> = Arc::new(MemDisk::new(4096));
            let sb = Arc::new(FsSuper::new(disk));
            let log = Arc::new(Log::new(sb.disk.clone()).unwrap());
            let mut bbytes = vec![0u8; sb.n_block_bitmap as usize * BSIZE];
            for b in 0..sb.data_start() {
                bbytes[(b / 8) as usize] |= 1 << (b % 8);
            }
            let balloc = Arc::new(Alloc::new(bbytes, sb.max_bnum()));
            let mut ibytes = vec![0u8; BSIZE];
            ibytes[0] = 0b11;
            let ialloc = Arc::new(Alloc::new(ibytes, sb.num_inodes()));
            Env {
                sb,
                log,
                balloc,
                ialloc,
            }
        }

        fn begin(&self) -> AllocTxn {
            AllocTxn::begin(
                self.sb.clone(),
                &self.log,
                self.balloc.clone(),
                self.ialloc.clone(),
            )
        }

        fn disk_bit(&self, base: Bnum, n: u64) -> bool {
            let a = Addr::for_bit(base, n);
            let blk = self.sb.disk.read(a.blkno).unwrap();
            blk[(a.off / 8) as usize] & (1 << (a.off % 8)) != 0
        }
    }

    #[test]
    fn aborted_txn_restores_allocators_and_disk() {
        let env = Env::new();
        let free_blocks = env.balloc.free_count();
        let free_inums = env.ialloc.free_count();

        let mut atxn = env.begin();
        let bn = atxn.alloc_block();
        assert_ne!(bn, NULLBNUM);
        let inum = atxn.alloc_inum();
        assert_ne!(inum, NULLINUM);
        assert_eq!(env.balloc.free_count(), free_blocks - 1);
        atxn.post_abort();
        drop(atxn);

        assert_eq!(env.balloc.free_count(), free_blocks);
        assert_eq!(env.ialloc.free_count(), free_inums);
        assert!(!env.disk_bit(env.sb.bitmap_block_start(), bn));
        assert!(!env.disk_bit(env.sb.bitmap_inode_start(), inum));
    }

    #[test]
    fn committed_alloc_then_free_updates_bitmaps() {
        let env = Env::new();
        let free_blocks = env.balloc.free_count();

        let mut atxn = env.begin();
        let bn = atxn.alloc_block();
        assert_ne!(bn, NULLBNUM);
        atxn.pre_commit();
        assert!(atxn.op.commit_wait(true));
        atxn.post_commit();
        assert!(env.disk_bit(env.sb.bitmap_block_start(), bn));
        assert_eq!(env.balloc.free_count(), free_blocks - 1);

        let mut atxn = env.begin();
        atxn.free_block(bn);
        // freed numbers come back only after the commit
        assert_eq!(env.balloc.free_count(), free_blocks - 1);
        atxn.pre_commit();
        assert!(atxn.op.commit_wait(true));
        atxn.post_commit();
        assert!(!env.disk_bit(env.sb.bitmap_block_start(), bn));
        assert_eq!(env.balloc.free_count(), free_blocks);
        // the freed block is zero on disk
        assert_eq!(env.sb.disk.read(bn).unwrap(), vec![0u8; BSIZE]);
    }

    #[test]
    #[should_panic(expected = "invalid blkno")]
    fn out_of_range_block_is_rejected() {
        let env = Env::new();
        let mut atxn = env.begin();
        atxn.free_block(env.sb.max_bnum());
    }

    #[test]
    #[should_panic(expected = "null block")]
    fn read_of_block_zero_is_rejected() {
        let env = Env::new();
        let mut atxn = env.begin();
        let _ = atxn.read_block(0);
    }
}
