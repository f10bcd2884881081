//! Write-ahead journal with sub-block transactions.
//!
//! A transaction (`Op`) buffers reads and writes at bit granularity;
//! nothing reaches the shared log until `commit_wait`. At commit the
//! op's dirty buffers are absorbed into an in-memory log of whole
//! blocks, applied read-modify-write so two transactions touching
//! different bits of one bitmap block never lose each other's update.
//!
//! A stable commit flushes the absorbed log: data blocks into the log
//! region, then the header block (the real commit point), then the
//! blocks to their home locations, then an empty header. An unstable
//! commit leaves its writes absorbed in memory; the next stable commit
//! or `shutdown` flushes them together, which is the group commit. A
//! crash discards absorbed-but-unflushed writes and recovery replays a
//! committed header, so the disk always holds a prefix of committed
//! transactions.
//!
//! On-disk layout of the log region, blocks `[0, LOGSIZE)`:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...

use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use arrayvec::ArrayVec;
use byteorder::{ByteOrder, LittleEndian};
use itertools::izip;
use log::{debug, error, trace};

use crate::disk::Disk;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS, NBITBLOCK};

/// Blocks of log payload (the region minus the header block).
pub const LOGBLOCKS: usize = LOGSIZE as usize - 1;

/// A disk address at bit granularity: block number plus bit offset
/// within the block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Addr {
    pub blkno: u64,
    pub off: u64,
}

impl Addr {
    pub fn new(blkno: u64, off: u64) -> Addr {
        assert!(off < NBITBLOCK);
        Addr { blkno, off }
    }

    /// Address of bit `n` counted from the start of the bitmap at
    /// `base`.
    pub fn for_bit(base: u64, n: u64) -> Addr {
        Addr::new(base + n / NBITBLOCK, n % NBITBLOCK)
    }
}

/// A buffered view of `nbits` starting at `addr`, private to one op.
/// For `nbits == 1` the payload is a single byte whose bit
/// `addr.off % 8` carries the new value.
pub struct Buf {
    pub addr: Addr,
    pub nbits: u64,
    pub data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }
}

fn payload_len(nbits: u64) -> usize {
    if nbits == 1 {
        1
    } else {
        assert_eq!(nbits % 8, 0, "unaligned buffer size");
        (nbits / 8) as usize
    }
}

struct LogBlock {
    blkno: u64,
    data: Vec<u8>,
}

struct LogState {
    /// Absorbed, not yet installed writes, one entry per block.
    memlog: ArrayVec<LogBlock, LOGBLOCKS>,
    /// How many ops are executing?
    outstanding: usize,
}

pub struct Log {
    disk: Arc<dyn Disk>,
    state: Mutex<LogState>,
    space: Condvar,
}

impl Log {
    /// Open the log, replaying a committed transaction if the header
    /// records one.
    pub fn new(disk: Arc<dyn Disk>) -> io::Result<Log> {
        Self::recover(&*disk)?;
        Ok(Log {
            disk,
            state: Mutex::new(LogState {
                memlog: ArrayVec::new(),
                outstanding: 0,
            }),
            space: Condvar::new(),
        })
    }

    fn recover(disk: &dyn Disk) -> io::Result<()> {
        let hdr = disk.read(0)?;
        let n = LittleEndian::read_u32(&hdr[0..4]) as usize;
        assert!(n <= LOGBLOCKS, "corrupt log header");
        if n == 0 {
            return Ok(());
        }
        debug!("recover: installing {} blocks", n);
        for i in 0..n {
            let blkno = LittleEndian::read_u32(&hdr[4 + 4 * i..8 + 4 * i]) as u64;
            let data = disk.read(1 + i as u64)?;
            disk.write(blkno, &data)?;
        }
        disk.barrier()?;
        Self::write_head(disk, &[])?;
        disk.barrier()?;
        Ok(())
    }

    /// Write the in-memory log header to disk. This is the true point
    /// at which a transaction commits.
    fn write_head(disk: &dyn Disk, blknos: &[u64]) -> io::Result<()> {
        let mut buf = vec![0u8; BSIZE];
        LittleEndian::write_u32(&mut buf[0..4], blknos.len() as u32);
        for (slot, b) in izip!(buf[4..].chunks_exact_mut(4), blknos) {
            assert!(*b <= u32::MAX as u64);
            LittleEndian::write_u32(slot, *b as u32);
        }
        disk.write(0, &buf)
    }

    /// Current contents of `blkno`: absorbed writes shadow the disk.
    fn read_block_view(&self, blkno: u64) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        if let Some(lb) = st.memlog.iter().find(|lb| lb.blkno == blkno) {
            return lb.data.clone();
        }
        drop(st);
        self.disk.read(blkno).expect("disk read failed")
    }

    /// Reserve log space for a new op, waiting while a full set of
    /// worst-case ops would overflow the log.
    fn reserve(&self) {
        let mut st = self.state.lock().unwrap();
        while st.memlog.len() + (st.outstanding + 1) * MAXOPBLOCKS > LOGBLOCKS {
            st = self.space.wait(st).unwrap();
        }
        st.outstanding += 1;
    }

    fn abort_op(&self) {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        self.space.notify_all();
    }

    fn absorb(st: &mut LogState, disk: &dyn Disk, b: Buf) {
        let idx = match st.memlog.iter().position(|lb| lb.blkno == b.addr.blkno) {
            Some(i) => i,
            None => {
                let data = disk.read(b.addr.blkno).expect("disk read failed");
                st.memlog.push(LogBlock {
                    blkno: b.addr.blkno,
                    data,
                });
                st.memlog.len() - 1
            }
        };
        let blk = &mut st.memlog[idx].data;
        if b.nbits == 1 {
            let byte = (b.addr.off / 8) as usize;
            let mask = 1u8 << (b.addr.off % 8);
            if b.data[0] & mask != 0 {
                blk[byte] |= mask;
            } else {
                blk[byte] &= !mask;
            }
        } else {
            let s = (b.addr.off / 8) as usize;
            let n = (b.nbits / 8) as usize;
            blk[s..s + n].copy_from_slice(&b.data[..n]);
        }
    }

    fn commit(&self, bufs: Vec<Buf>, stable: bool) -> bool {
        let mut blknos: Vec<u64> = bufs.iter().map(|b| b.addr.blkno).collect();
        blknos.sort_unstable();
        blknos.dedup();
        assert!(blknos.len() <= MAXOPBLOCKS, "too big a transaction");

        let mut st = self.state.lock().unwrap();
        for b in bufs {
            Self::absorb(&mut st, &*self.disk, b);
        }
        let ok = if stable {
            self.flush_locked(&mut st)
        } else if st.memlog.len() + 2 * MAXOPBLOCKS > LOGBLOCKS {
            // an overfull log would wedge admission with no op left to
            // flush it, so unstable commits flush early near the limit
            self.flush_locked(&mut st)
        } else {
            true
        };
        st.outstanding -= 1;
        self.space.notify_all();
        ok
    }

    fn flush_locked(&self, st: &mut LogState) -> bool {
        if st.memlog.is_empty() {
            return true;
        }
        trace!("flush: {} blocks", st.memlog.len());
        let res = (|| -> io::Result<()> {
            for (i, lb) in st.memlog.iter().enumerate() {
                self.disk.write(1 + i as u64, &lb.data)?;
            }
            self.disk.barrier()?;
            let blknos: Vec<u64> = st.memlog.iter().map(|lb| lb.blkno).collect();
            Self::write_head(&*self.disk, &blknos)?;
            self.disk.barrier()?;
            for lb in st.memlog.iter() {
                self.disk.write(lb.blkno, &lb.data)?;
            }
            self.disk.barrier()?;
            Self::write_head(&*self.disk, &[])?;
            self.disk.barrier()?;
            Ok(())
        })();
        match res {
            Ok(()) => {
                st.memlog.clear();
                true
            }
            Err(e) => {
                // memlog is kept; a later flush may still succeed
                error!("journal flush failed: {}", e);
                false
            }
        }
    }

    /// Flush everything absorbed so far.
    pub fn flush(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        self.flush_locked(&mut st)
    }

    /// Graceful flush at server shutdown.
    pub fn shutdown(&self) -> bool {
        self.flush()
    }
}

/// One journal transaction.
pub struct Op {
    log: Arc<Log>,
    bufs: Vec<Buf>,
    committed: bool,
}

impl Op {
    pub fn begin(log: &Arc<Log>) -> Op {
        log.reserve();
        Op {
            log: log.clone(),
            bufs: Vec::new(),
            committed: false,
        }
    }

    /// Buffered read of `nbits` at `addr`; mutations become part of the
    /// transaction once the buffer is marked dirty.
    pub fn read_buf(&mut self, addr: Addr, nbits: u64) -> &mut Buf {
        let i = match self
            .bufs
            .iter()
            .position(|b| b.addr == addr && b.nbits == nbits)
        {
            Some(i) => i,
            None => {
                let blk = self.log.read_block_view(addr.blkno);
                let s = (addr.off / 8) as usize;
                let n = payload_len(nbits);
                self.bufs.push(Buf {
                    addr,
                    nbits,
                    data: blk[s..s + n].to_vec(),
                    dirty: false,
                });
                self.bufs.len() - 1
            }
        };
        &mut self.bufs[i]
    }

    /// Blind write of `nbits` at `addr`.
    pub fn over_write(&mut self, addr: Addr, nbits: u64, bytes: &[u8]) {
        let n = payload_len(nbits);
        assert!(bytes.len() >= n);
        match self
            .bufs
            .iter_mut()
            .find(|b| b.addr == addr && b.nbits == nbits)
        {
            Some(b) => {
                b.data.clear();
                b.data.extend_from_slice(&bytes[..n]);
                b.dirty = true;
            }
            None => self.bufs.push(Buf {
                addr,
                nbits,
                data: bytes[..n].to_vec(),
                dirty: true,
            }),
        }
    }

    /// Commit the transaction. Durable on return when `stable`; an
    /// unstable commit may be lost by a crash but never torn.
    pub fn commit_wait(&mut self, stable: bool) -> bool {
        assert!(!self.committed, "op committed twice");
        self.committed = true;
        let bufs = mem::take(&mut self.bufs);
        let dirty: Vec<Buf> = bufs.into_iter().filter(|b| b.dirty).collect();
        self.log.commit(dirty, stable)
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        if !self.committed {
            self.log.abort_op();
        }
    }
}
