//! The NFS server: mount-time assembly, formatting, shutdown.
//!
//! `Nfs::new` recovers the journal, formats a fresh disk if the root
//! inode is unallocated, loads the bitmaps into the allocators, and
//! starts with an empty inode cache. Every NFS procedure in `ops` runs
//! as exactly one filesystem transaction.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use log::info;
use thiserror::Error;

use crate::dir;
use crate::disk::Disk;
use crate::fh;
use crate::fstxn::{FsState, FsTxn};
use crate::inode::{Inode, Kind};
use crate::jrnl::{Log, Op};
use crate::nfstypes::NfsFh3;
use crate::param::{BSIZE, INODEBLK, INODESZ, NBITBLOCK, ROOTINUM};
use crate::shrinker::ShrinkerSt;
use crate::superblock::FsSuper;

mod clnt;
mod mount;
mod ops;

pub use clnt::{parallel, NfsClient};

pub struct Nfs {
    fsstate: Arc<FsState>,
    shrinker: Arc<ShrinkerSt>,
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("disk too small: {0} blocks")]
    DiskTooSmall(u64),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Nfs {
    pub fn new(disk: Arc<dyn Disk>) -> Result<Nfs, MountError> {
        let sb = Arc::new(FsSuper::new(disk));
        if sb.data_start() + 8 > sb.size {
            return Err(MountError::DiskTooSmall(sb.size));
        }
        let log = Arc::new(Log::new(sb.disk.clone())?);
        let fresh = Self::is_fresh(&sb)?;
        if fresh {
            Self::mkfs(&sb, &log);
        }
        let st = Arc::new(FsState::new(sb, log)?);
        if fresh {
            Self::mk_root(&st);
            info!("formatted fresh filesystem");
        }
        let shrinker = ShrinkerSt::new(st.clone());
        info!(
            "mounted: {} blocks, {} inodes, data starts at block {}",
            st.sb.size,
            st.sb.num_inodes(),
            st.sb.data_start()
        );
        Ok(Nfs {
            fsstate: st,
            shrinker,
        })
    }

    /// A disk is fresh when the (journal-recovered) root inode row is
    /// still unallocated.
    fn is_fresh(sb: &FsSuper) -> io::Result<bool> {
        let blk = sb.disk.read(sb.inode_start() + ROOTINUM / INODEBLK)?;
        let off = (ROOTINUM % INODEBLK * INODESZ) as usize;
        Ok(LittleEndian::read_u64(&blk[off..off + 8]) == 0)
    }

    /// Seed a fresh disk in one journal transaction: mark the metadata
    /// region allocated in the block bitmap, claim the null and root
    /// inums, and write the root inode.
    fn mkfs(sb: &Arc<FsSuper>, log: &Arc<Log>) {
        let mut op = Op::begin(log);
        for i in 0..sb.n_block_bitmap {
            let mut blk = vec![0u8; BSIZE];
            let base = i * NBITBLOCK;
            for b in 0..NBITBLOCK {
                if base + b >= sb.data_start() {
                    break;
                }
                blk[(b / 8) as usize] |= 1 << (b % 8);
            }
            // a fresh image reads zero, so untouched bitmap blocks can
            // stay unwritten and the format fits one transaction
            if blk.iter().all(|&x| x == 0) {
                continue;
            }
            op.over_write(sb.block_addr(sb.bitmap_block_start() + i), NBITBLOCK, &blk);
        }
        let mut iblk = vec![0u8; BSIZE];
        iblk[0] = 0b11;
        op.over_write(sb.block_addr(sb.bitmap_inode_start()), NBITBLOCK, &iblk);

        let mut root = Inode::init(ROOTINUM, 1, Kind::Dir);
        root.nlink = 2;
        root.mode = 0o755;
        let now = now_nanos();
        root.atime = now;
        root.mtime = now;
        root.ctime = now;
        op.over_write(sb.inum_addr(ROOTINUM), INODESZ * 8, &root.encode());
        assert!(op.commit_wait(true), "mkfs: commit failed");
    }

    /// Give the fresh root its "." and ".." entries through the normal
    /// transaction path.
    fn mk_root(st: &Arc<FsState>) {
        let mut op = FsTxn::begin(st);
        op.get_inode_inum(ROOTINUM).expect("mk_root: no root inode");
        let (dip, atxn) = op.ip_atxn(ROOTINUM);
        assert!(dir::mk_root_dir(dip, atxn), "mk_root: init failed");
        assert!(op.commit(), "mk_root: commit failed");
    }

    pub fn root_fh(&self) -> NfsFh3 {
        fh::mk_root_fh3()
    }

    /// Drain the shrinker and flush the journal.
    pub fn shutdown(&self) {
        self.shrinker.shutdown();
        self.fsstate.log.shutdown();
        info!("shutdown complete");
    }

    /// Stop serving abruptly: shrinker workers exit between
    /// transactions and the journal is deliberately not flushed, so
    /// the disk holds a prefix of committed transactions.
    pub fn crash(&self) {
        self.shrinker.crash();
    }

    pub fn free_block_count(&self) -> u64 {
        self.fsstate.balloc.free_count()
    }

    pub fn free_inode_count(&self) -> u64 {
        self.fsstate.ialloc.free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfstypes::{Nfsstat3, StableHow};
    use crate::param::{NDIRECT, NINDIRECT, ROOTINUM};

    #[test]
    fn dir_apply_eof() {
        let clnt = NfsClient::new(10_000);
        let root = clnt.root_fh();
        for name in ["a", "b", "c"] {
            assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
        }

        let mut op = FsTxn::begin(&clnt.srv.fsstate);
        op.get_inode_inum(ROOTINUM).unwrap();
        let mut last = 0;
        let eof = dir::apply(&mut op, ROOTINUM, 0, 64, 1 << 20, |_ip, _name, _inum, off| {
            last = off;
        });
        assert!(op.commit());
        assert!(!eof, "expected more entries after the first call");
        assert_ne!(last, 0);

        let mut op = FsTxn::begin(&clnt.srv.fsstate);
        op.get_inode_inum(ROOTINUM).unwrap();
        let eof = dir::apply(&mut op, ROOTINUM, last, 64, 1 << 20, |_ip, _n, _i, _o| {});
        assert!(op.commit());
        assert!(eof, "second call should drain the directory");
        clnt.shutdown();
    }

    #[test]
    fn dir_apply_ents_eof() {
        let clnt = NfsClient::new(10_000);
        let root = clnt.root_fh();
        for name in ["a", "b", "c"] {
            assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
        }

        // small enough to stop partway through the five entries
        let count = 200;
        let mut op = FsTxn::begin(&clnt.srv.fsstate);
        op.get_inode_inum(ROOTINUM).unwrap();
        let mut last = 0;
        let eof = {
            let (dip, atxn) = op.ip_atxn(ROOTINUM);
            dir::apply_ents(dip, atxn, 0, count, |_name, _inum, off| {
                last = off;
            })
        };
        assert!(op.commit());
        assert!(!eof, "expected more entries after the first call");
        assert_ne!(last, 0);

        let mut op = FsTxn::begin(&clnt.srv.fsstate);
        op.get_inode_inum(ROOTINUM).unwrap();
        let eof = {
            let (dip, atxn) = op.ip_atxn(ROOTINUM);
            dir::apply_ents(dip, atxn, last, count, |_n, _i, _o| {})
        };
        assert!(op.commit());
        assert!(eof, "second call should drain the directory");
        clnt.shutdown();
    }

    fn bit_set(bitmap: &[u8], n: u64) -> bool {
        bitmap[(n / 8) as usize] & (1 << (n % 8)) != 0
    }

    fn tree_blocks(sb: &FsSuper, ip: &Inode, used: &mut Vec<u64>) {
        let mut push = |bn: u64| {
            if bn != 0 {
                used.push(bn);
            }
        };
        for &bn in &ip.direct {
            push(bn);
        }
        let read_ptrs = |bn: u64| -> Vec<u64> {
            let blk = sb.disk.read(bn).unwrap();
            (0..crate::param::NINDIRECT)
                .map(|i| LittleEndian::read_u64(&blk[(i * 8) as usize..(i * 8 + 8) as usize]))
                .collect()
        };
        if ip.indirect != 0 {
            push(ip.indirect);
            for p in read_ptrs(ip.indirect) {
                push(p);
            }
        }
        if ip.dindirect != 0 {
            push(ip.dindirect);
            for l1 in read_ptrs(ip.dindirect) {
                if l1 != 0 {
                    push(l1);
                    for p in read_ptrs(l1) {
                        push(p);
                    }
                }
            }
        }
    }

    /// On-disk consistency: every block referenced from an allocated
    /// inode's tree is marked in the bitmap, and no block is
    /// referenced twice.
    fn fsck(st: &FsState) {
        let sb = &st.sb;
        let mut bitmap = Vec::new();
        for i in 0..sb.n_block_bitmap {
            bitmap.extend_from_slice(&sb.disk.read(sb.bitmap_block_start() + i).unwrap());
        }
        let mut used = Vec::new();
        for inum in 1..sb.num_inodes() {
            let blk = sb.disk.read(sb.inum_addr(inum).blkno).unwrap();
            let off = (sb.inum_addr(inum).off / 8) as usize;
            let ip = Inode::decode(inum, &blk[off..off + INODESZ as usize]);
            if ip.kind != Kind::Free {
                tree_blocks(sb, &ip, &mut used);
            }
        }
        let mut sorted = used.clone();
        sorted.sort_unstable();
        for w in sorted.windows(2) {
            assert_ne!(w[0], w[1], "block {} referenced twice", w[0]);
        }
        for &b in &used {
            assert!(
                bit_set(&bitmap, b),
                "block {} is referenced but marked free",
                b
            );
        }
    }

    #[test]
    fn crash_mid_shrink_stays_consistent() {
        let clnt = NfsClient::new(10_000);
        let root = clnt.root_fh();
        let res = clnt.create_op(&root, "big");
        assert_eq!(res.status, Nfsstat3::Ok);
        let fh = res.obj;

        // enough data to need the indirect blocks and several shrink
        // transactions
        let nblocks = NDIRECT as u64 + NINDIRECT + 64;
        let chunk = vec![0x3cu8; BSIZE];
        for i in 0..nblocks {
            let res = clnt.write_op(&fh, i * BSIZE as u64, &chunk, StableHow::FileSync);
            assert_eq!(res.status, Nfsstat3::Ok);
        }

        assert_eq!(clnt.setattr_size_op(&fh, 0).status, Nfsstat3::Ok);
        // stop the shrinker between its transactions
        clnt.crash();

        let clnt = clnt.restart();
        fsck(&clnt.srv.fsstate);
        // the truncate itself committed; the tree may be partially
        // reclaimed but the size is durable
        let attr = clnt.getattr_op(&fh);
        assert_eq!(attr.status, Nfsstat3::Ok);
        assert_eq!(attr.obj_attributes.unwrap().size, 0);

        // a fresh truncate finishes the job
        assert_eq!(clnt.setattr_size_op(&fh, 0).status, Nfsstat3::Ok);
        clnt.shutdown();
        fsck(&clnt.srv.fsstate);
    }
}
