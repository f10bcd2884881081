//! Inodes.
//!
//! An inode describes a single unnamed file: type, link count,
//! generation, size, ownership, timestamps, and a block-pointer tree
//! of `NDIRECT` direct pointers, one indirect block and one
//! double-indirect block. The on-disk form is a 128-byte row inside
//! the inode table, read and written through the journal at row
//! granularity.
//!
//! Truncation is incremental: `shrink_size` records the allocation
//! high-water mark in blocks, and `shrink` frees a bounded batch from
//! the tail of the tree per call so one call fits in one transaction.
//! Freed blocks are zeroed through the journal, which keeps the
//! invariant that free blocks are zero on disk and lets allocation
//! skip explicit zeroing.

use std::cmp;

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;

use crate::alloctxn::AllocTxn;
use crate::dcache::Dcache;
use crate::marshal::{Dec, Enc};
use crate::param::{Bnum, Inum, BSIZE, INODESZ, NDIRECT, NINDIRECT, SHRINK_BATCH};

// kind, nlink, gen, size, shrink_size; mode, uid, gid, pad;
// atime, mtime, ctime; direct[NDIRECT], indirect, dindirect
const_assert_eq!(5 * 8 + 4 * 4 + 3 * 8 + (NDIRECT + 2) * 8, INODESZ as usize);

/// Largest file the pointer tree can address, in bytes.
pub const MAXFILESZ: u64 =
    (NDIRECT as u64 + NINDIRECT + NINDIRECT * NINDIRECT) * BSIZE as u64;

/// File type of a live inode, plus the free state a strict reader must
/// treat explicitly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Free,
    Reg,
    Dir,
    Blk,
    Chr,
    Lnk,
    Sock,
    Fifo,
}

impl Kind {
    // Numbering follows the NFSv3 ftype3 values; 0 marks a free row.
    fn to_u64(self) -> u64 {
        match self {
            Kind::Free => 0,
            Kind::Reg => 1,
            Kind::Dir => 2,
            Kind::Blk => 3,
            Kind::Chr => 4,
            Kind::Lnk => 5,
            Kind::Sock => 6,
            Kind::Fifo => 7,
        }
    }

    fn from_u64(x: u64) -> Kind {
        match x {
            1 => Kind::Reg,
            2 => Kind::Dir,
            3 => Kind::Blk,
            4 => Kind::Chr,
            5 => Kind::Lnk,
            6 => Kind::Sock,
            7 => Kind::Fifo,
            _ => Kind::Free,
        }
    }
}

pub fn size_to_blocks(size: u64) -> u64 {
    (size + BSIZE as u64 - 1) / BSIZE as u64
}

pub struct Inode {
    pub inum: Inum,
    pub kind: Kind,
    pub nlink: u64,
    pub gen: u64,
    pub size: u64,
    /// Allocation high-water mark in blocks; the tree holds no pointer
    /// at or past this index.
    pub shrink_size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Timestamps in nanoseconds since the epoch.
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub direct: [Bnum; NDIRECT],
    pub indirect: Bnum,
    pub dindirect: Bnum,
    /// Lookup cache, present only for directories and built lazily.
    pub dcache: Option<Dcache>,
}

impl Inode {
    pub fn init(inum: Inum, gen: u64, kind: Kind) -> Inode {
        Inode {
            inum,
            kind,
            nlink: 0,
            gen,
            size: 0,
            shrink_size: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            direct: [0; NDIRECT],
            indirect: 0,
            dindirect: 0,
            dcache: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new(INODESZ as usize);
        enc.put_int(self.kind.to_u64());
        enc.put_int(self.nlink);
        enc.put_int(self.gen);
        enc.put_int(self.size);
        enc.put_int(self.shrink_size);
        enc.put_u32(self.mode);
        enc.put_u32(self.uid);
        enc.put_u32(self.gid);
        enc.put_u32(0);
        enc.put_int(self.atime);
        enc.put_int(self.mtime);
        enc.put_int(self.ctime);
        for &bn in &self.direct {
            enc.put_int(bn);
        }
        enc.put_int(self.indirect);
        enc.put_int(self.dindirect);
        enc.finish()
    }

    pub fn decode(inum: Inum, data: &[u8]) -> Inode {
        let mut dec = Dec::new(data);
        let kind = Kind::from_u64(dec.get_int());
        let nlink = dec.get_int();
        let gen = dec.get_int();
        let size = dec.get_int();
        let shrink_size = dec.get_int();
        let mode = dec.get_u32();
        let uid = dec.get_u32();
        let gid = dec.get_u32();
        let _ = dec.get_u32();
        let atime = dec.get_int();
        let mtime = dec.get_int();
        let ctime = dec.get_int();
        let mut direct = [0u64; NDIRECT];
        for d in direct.iter_mut() {
            *d = dec.get_int();
        }
        let indirect = dec.get_int();
        let dindirect = dec.get_int();
        Inode {
            inum,
            kind,
            nlink,
            gen,
            size,
            shrink_size,
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            direct,
            indirect,
            dindirect,
            dcache: None,
        }
    }

    /// Field copy for attribute reporting; leaves the directory cache
    /// behind.
    pub fn snapshot(&self) -> Inode {
        Inode {
            inum: self.inum,
            kind: self.kind,
            nlink: self.nlink,
            gen: self.gen,
            size: self.size,
            shrink_size: self.shrink_size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            direct: self.direct,
            indirect: self.indirect,
            dindirect: self.dindirect,
            dcache: None,
        }
    }

    /// Load inode `inum` through the transaction.
    pub fn read_inode(atxn: &mut AllocTxn, inum: Inum) -> Inode {
        let addr = atxn.sb.inum_addr(inum);
        let buf = atxn.op.read_buf(addr, INODESZ * 8);
        Inode::decode(inum, &buf.data)
    }

    /// Write this inode's on-disk row through the transaction. Must be
    /// called after every change to a field that lives on disk.
    pub fn write_inode(&self, atxn: &mut AllocTxn) {
        let addr = atxn.sb.inum_addr(self.inum);
        atxn.op.over_write(addr, INODESZ * 8, &self.encode());
    }

    /// Disk block holding file block `idx`, or 0 for a hole.
    fn bmap(&self, atxn: &mut AllocTxn, idx: u64) -> Bnum {
        if idx < NDIRECT as u64 {
            return self.direct[idx as usize];
        }
        let idx = idx - NDIRECT as u64;
        if idx < NINDIRECT {
            if self.indirect == 0 {
                return 0;
            }
            let buf = atxn.read_block(self.indirect);
            return read_ptr(&buf.data, idx);
        }
        let idx = idx - NINDIRECT;
        assert!(idx < NINDIRECT * NINDIRECT, "bmap: out of range");
        if self.dindirect == 0 {
            return 0;
        }
        let (d1, d2) = (idx / NINDIRECT, idx % NINDIRECT);
        let l1 = {
            let buf = atxn.read_block(self.dindirect);
            read_ptr(&buf.data, d1)
        };
        if l1 == 0 {
            return 0;
        }
        let buf = atxn.read_block(l1);
        read_ptr(&buf.data, d2)
    }

    /// Like `bmap`, but allocates missing tree nodes. Returns 0 only
    /// when the disk is out of blocks.
    fn bmap_alloc(&mut self, atxn: &mut AllocTxn, idx: u64) -> Bnum {
        self.shrink_size = cmp::max(self.shrink_size, idx + 1);
        if idx < NDIRECT as u64 {
            let i = idx as usize;
            if self.direct[i] == 0 {
                self.direct[i] = atxn.alloc_block();
            }
            return self.direct[i];
        }
        let idx = idx - NDIRECT as u64;
        if idx < NINDIRECT {
            if self.indirect == 0 {
                self.indirect = atxn.alloc_block();
                if self.indirect == 0 {
                    return 0;
                }
            }
            return alloc_slot(atxn, self.indirect, idx);
        }
        let idx = idx - NINDIRECT;
        assert!(idx < NINDIRECT * NINDIRECT, "bmap: out of range");
        if self.dindirect == 0 {
            self.dindirect = atxn.alloc_block();
            if self.dindirect == 0 {
                return 0;
            }
        }
        let (d1, d2) = (idx / NINDIRECT, idx % NINDIRECT);
        let l1 = {
            let buf = atxn.read_block(self.dindirect);
            read_ptr(&buf.data, d1)
        };
        let l1 = if l1 == 0 {
            let bn = atxn.alloc_block();
            if bn == 0 {
                return 0;
            }
            write_ptr(atxn, self.dindirect, d1, bn);
            bn
        } else {
            l1
        };
        alloc_slot(atxn, l1, d2)
    }

    /// Read `n` bytes at `off`. Returns the data (short at end of
    /// file) and whether the read reached the end.
    pub fn read(&self, atxn: &mut AllocTxn, off: u64, n: u64) -> (Vec<u8>, bool) {
        if off >= self.size {
            return (Vec::new(), true);
        }
        let n = cmp::min(n, self.size - off);
        let mut data = Vec::with_capacity(n as usize);
        let mut off = off;
        let mut tot = 0u64;
        while tot < n {
            let m = cmp::min(n - tot, BSIZE as u64 - off % BSIZE as u64);
            let bn = self.bmap(atxn, off / BSIZE as u64);
            if bn == 0 {
                data.resize(data.len() + m as usize, 0);
            } else {
                let buf = atxn.read_block(bn);
                let s = (off % BSIZE as u64) as usize;
                data.extend_from_slice(&buf.data[s..s + m as usize]);
            }
            tot += m;
            off += m;
        }
        (data, off >= self.size)
    }

    /// Write `data` at `off`, allocating through the transaction.
    /// Returns the number of bytes written and whether all were;
    /// a short write means the disk filled up.
    pub fn write(&mut self, atxn: &mut AllocTxn, off: u64, data: &[u8]) -> (u64, bool) {
        let n = data.len() as u64;
        if off.checked_add(n).map_or(true, |end| end > MAXFILESZ) {
            return (0, false);
        }
        let mut tot = 0u64;
        while tot < n {
            let pos = off + tot;
            let bn = self.bmap_alloc(atxn, pos / BSIZE as u64);
            if bn == 0 {
                break;
            }
            let s = (pos % BSIZE as u64) as usize;
            let m = cmp::min(n - tot, (BSIZE - s) as u64);
            let buf = atxn.read_block(bn);
            buf.data[s..s + m as usize].copy_from_slice(&data[tot as usize..(tot + m) as usize]);
            buf.set_dirty();
            tot += m;
        }
        if off + tot > self.size {
            self.size = off + tot;
        }
        // The row goes back even on a short write: bmap_alloc may have
        // grown the tree.
        self.write_inode(atxn);
        (tot, tot == n)
    }

    /// Whether a size change left blocks past the end of the file.
    pub fn shrink_needed(&self) -> bool {
        size_to_blocks(self.size) < self.shrink_size
    }

    /// Free one transaction-bounded batch of blocks from the tail of
    /// the tree. Returns whether more remain.
    pub fn shrink(&mut self, atxn: &mut AllocTxn) -> bool {
        let want = size_to_blocks(self.size);
        let mut freed = 0;
        while self.shrink_size > want && freed < SHRINK_BATCH {
            self.free_index(atxn, self.shrink_size - 1);
            self.shrink_size -= 1;
            freed += 1;
        }
        self.write_inode(atxn);
        self.shrink_size > want
    }

    /// Free the block at tree index `idx` and any indirect block whose
    /// last pointer it was. Only called tail-first.
    fn free_index(&mut self, atxn: &mut AllocTxn, idx: u64) {
        if idx < NDIRECT as u64 {
            let i = idx as usize;
            atxn.free_block(self.direct[i]);
            self.direct[i] = 0;
            return;
        }
        let idx = idx - NDIRECT as u64;
        if idx < NINDIRECT {
            if self.indirect == 0 {
                return;
            }
            let ptr = {
                let buf = atxn.read_block(self.indirect);
                read_ptr(&buf.data, idx)
            };
            atxn.free_block(ptr);
            if idx == 0 {
                atxn.free_block(self.indirect);
                self.indirect = 0;
            } else {
                write_ptr(atxn, self.indirect, idx, 0);
            }
            return;
        }
        let idx = idx - NINDIRECT;
        if self.dindirect == 0 {
            return;
        }
        let (d1, d2) = (idx / NINDIRECT, idx % NINDIRECT);
        let l1 = {
            let buf = atxn.read_block(self.dindirect);
            read_ptr(&buf.data, d1)
        };
        if l1 != 0 {
            let ptr = {
                let buf = atxn.read_block(l1);
                read_ptr(&buf.data, d2)
            };
            atxn.free_block(ptr);
            if d2 == 0 {
                atxn.free_block(l1);
            } else {
                write_ptr(atxn, l1, d2, 0);
            }
        }
        if d2 == 0 {
            if d1 == 0 {
                atxn.free_block(self.dindirect);
                self.dindirect = 0;
            } else {
                write_ptr(atxn, self.dindirect, d1, 0);
            }
        }
    }
}

fn read_ptr(data: &[u8], slot: u64) -> Bnum {
    let o = (slot * 8) as usize;
    LittleEndian::read_u64(&data[o..o + 8])
}

fn write_ptr(atxn: &mut AllocTxn, blkno: Bnum, slot: u64, val: Bnum) {
    let buf = atxn.read_block(blkno);
    let o = (slot * 8) as usize;
    LittleEndian::write_u64(&mut buf.data[o..o + 8], val);
    buf.set_dirty();
}

/// Pointer at `slot` of indirect block `blkno`, allocating the target
/// block if the slot is empty.
fn alloc_slot(atxn: &mut AllocTxn, blkno: Bnum, slot: u64) -> Bnum {
    let cur = {
        let buf = atxn.read_block(blkno);
        read_ptr(&buf.data, slot)
    };
    if cur != 0 {
        return cur;
    }
    let bn = atxn.alloc_block();
    if bn == 0 {
        return 0;
    }
    write_ptr(atxn, blkno, slot, bn);
    bn
}
