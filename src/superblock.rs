//! Disk layout, derived from the device size at mount.
//!
//! Regions in block order:
//! [ log | block bitmap | inode bitmap | inode table | data blocks ]

use std::sync::Arc;

use static_assertions::const_assert;

use crate::disk::Disk;
use crate::jrnl::Addr;
use crate::param::{Bnum, Inum, BSIZE, INODEBLK, INODESZ, LOGSIZE, NBITBLOCK, NINODEBITMAP};

// An inode row must divide the block evenly.
const_assert!(BSIZE as u64 % INODESZ == 0);

pub struct FsSuper {
    pub disk: Arc<dyn Disk>,
    /// Device size in blocks.
    pub size: u64,
    /// Log region size, including the commit block.
    n_log: u64,
    pub n_block_bitmap: u64,
    pub n_inode_bitmap: u64,
    n_inode_blk: u64,
    max_addr: u64,
}

impl FsSuper {
    pub fn new(disk: Arc<dyn Disk>) -> FsSuper {
        let sz = disk.size();
        FsSuper {
            size: sz,
            n_log: LOGSIZE,
            n_block_bitmap: sz / NBITBLOCK + 1,
            n_inode_bitmap: NINODEBITMAP,
            n_inode_blk: NINODEBITMAP * NBITBLOCK * INODESZ / BSIZE as u64,
            max_addr: sz,
            disk,
        }
    }

    /// Maximum valid block number (exclusive).
    pub fn max_bnum(&self) -> Bnum {
        self.max_addr
    }

    /// First block bitmap block.
    pub fn bitmap_block_start(&self) -> Bnum {
        self.n_log
    }

    /// First inode bitmap block.
    pub fn bitmap_inode_start(&self) -> Bnum {
        self.bitmap_block_start() + self.n_block_bitmap
    }

    /// First block of the inode table.
    pub fn inode_start(&self) -> Bnum {
        self.bitmap_inode_start() + self.n_inode_bitmap
    }

    /// First data block.
    pub fn data_start(&self) -> Bnum {
        self.inode_start() + self.n_inode_blk
    }

    pub fn num_inodes(&self) -> Inum {
        self.n_inode_blk * INODEBLK
    }

    pub fn block_addr(&self, blkno: Bnum) -> Addr {
        Addr::new(blkno, 0)
    }

    /// Disk address of inode `inum` inside the inode table.
    pub fn inum_addr(&self, inum: Inum) -> Addr {
        Addr::new(
            self.inode_start() + inum / INODEBLK,
            (inum % INODEBLK) * INODESZ * 8,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::param::ROOTINUM;

    #[test]
    fn regions_are_ordered_and_sized() {
        let sb = FsSuper::new(Arc::new(MemDisk::new(10_000)));
        assert_eq!(sb.bitmap_block_start(), LOGSIZE);
        assert_eq!(sb.n_block_bitmap, 1);
        assert_eq!(sb.bitmap_inode_start(), LOGSIZE + 1);
        assert_eq!(sb.inode_start(), LOGSIZE + 2);
        assert_eq!(sb.n_inode_blk, 1024);
        assert_eq!(sb.data_start(), LOGSIZE + 2 + 1024);
        assert!(sb.data_start() < sb.max_bnum());
        assert_eq!(sb.num_inodes(), 32768);
    }

    #[test]
    fn inum_addr_strides_by_inode_size() {
        let sb = FsSuper::new(Arc::new(MemDisk::new(10_000)));
        let a = sb.inum_addr(ROOTINUM);
        assert_eq!(a.blkno, sb.inode_start());
        assert_eq!(a.off, INODESZ * 8);
        let b = sb.inum_addr(INODEBLK);
        assert_eq!(b.blkno, sb.inode_start() + 1);
        assert_eq!(b.off, 0);
    }
}
