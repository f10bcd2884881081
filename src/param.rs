//! Filesystem-wide constants.

/// Block size in bytes.
pub const BSIZE: usize = 4096;

/// Bits per block.
pub const NBITBLOCK: u64 = (BSIZE * 8) as u64;

/// On-disk inode size in bytes.
pub const INODESZ: u64 = 128;

/// Inodes per block.
pub const INODEBLK: u64 = BSIZE as u64 / INODESZ;

/// Number of inode bitmap blocks.
pub const NINODEBITMAP: u64 = 1;

/// Journal region size in blocks, including the header block.
pub const LOGSIZE: u64 = 513;

/// Max # of blocks any single transaction writes.
pub const MAXOPBLOCKS: usize = 128;

/// Max # of file blocks one shrinker transaction reclaims.
pub const SHRINK_BATCH: u64 = 64;

/// Capacity of the inode cache.
pub const ICACHESZ: usize = 100;

/// Fixed directory entry size in bytes.
pub const DIRENTSZ: u64 = 128;

/// Largest permissible file name; names must be strictly shorter.
pub const MAXNAMELEN: u64 = DIRENTSZ - 16;

/// Inode number of the root directory.
pub const ROOTINUM: u64 = 1;

/// The null inode number.
pub const NULLINUM: u64 = 0;

/// The null block number.
pub const NULLBNUM: u64 = 0;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 4;

/// Block pointers per indirect block.
pub const NINDIRECT: u64 = (BSIZE / 8) as u64;

/// Largest count a single READ or WRITE moves; a procedure is one
/// transaction, so this bounds the journal space any call can take.
pub const WSIZE: u64 = 32 * BSIZE as u64;

pub type Inum = u64;
pub type Bnum = u64;
