//! A user-space NFSv3 file server that persists all metadata and data
//! on a block device through a write-ahead journal. Layers, bottom up:
//!   + Disk: the block-device seam (`disk`).
//!   + Journal: crash recovery for multi-step updates (`jrnl`).
//!   + Allocation: bitmap allocators bound to transactions
//!     (`alloc`, `alloctxn`).
//!   + Inodes: cache, per-inode locks, block-pointer trees
//!     (`cache`, `lockmap`, `inode`, `fstxn`).
//!   + Directories: fixed-slot entries with a lookup cache
//!     (`dir`, `dcache`).
//!   + NFS: one transaction per procedure (`nfs`), with background
//!     reclamation of large files (`shrinker`).
//!
//! Crashes leave the disk equivalent to a prefix of committed
//! transactions; remounting replays the journal.

pub mod alloc;
pub mod alloctxn;
pub mod cache;
pub mod dcache;
pub mod dir;
pub mod disk;
pub mod fh;
pub mod fstxn;
pub mod inode;
pub mod jrnl;
pub mod lockmap;
pub mod marshal;
pub mod nfs;
pub mod nfstypes;
pub mod param;
pub mod shrinker;
pub mod superblock;
