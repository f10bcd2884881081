//! Block devices.
//!
//! The journal and superblock talk to storage through the `Disk` trait.
//! `FileDisk` backs the daemon with a disk image; `MemDisk` is a sparse
//! in-memory device for tests.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::param::BSIZE;

pub trait Disk: Send + Sync {
    /// Read block `bno`; always returns `BSIZE` bytes.
    fn read(&self, bno: u64) -> io::Result<Vec<u8>>;

    /// Write block `bno`.
    fn write(&self, bno: u64, data: &[u8]) -> io::Result<()>;

    /// Device size in blocks.
    fn size(&self) -> u64;

    /// Make preceding writes durable.
    fn barrier(&self) -> io::Result<()>;
}

/// A disk image file.
pub struct FileDisk {
    file: File,
    size: u64,
}

impl FileDisk {
    /// Open an existing image, or create a fresh one of `size` blocks.
    pub fn open(path: &Path, size: u64) -> io::Result<FileDisk> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let size = if len == 0 {
            file.set_len(size * BSIZE as u64)?;
            size
        } else {
            if len % BSIZE as u64 != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "image size is not block-aligned",
                ));
            }
            len / BSIZE as u64
        };
        Ok(FileDisk { file, size })
    }
}

impl Disk for FileDisk {
    fn read(&self, bno: u64) -> io::Result<Vec<u8>> {
        assert!(bno < self.size, "read past end of disk");
        let mut buf = vec![0u8; BSIZE];
        self.file.read_exact_at(&mut buf, bno * BSIZE as u64)?;
        Ok(buf)
    }

    fn write(&self, bno: u64, data: &[u8]) -> io::Result<()> {
        assert!(bno < self.size, "write past end of disk");
        assert_eq!(data.len(), BSIZE);
        self.file.write_all_at(data, bno * BSIZE as u64)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn barrier(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Sparse in-memory disk; unwritten blocks read as zeros.
pub struct MemDisk {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    size: u64,
}

impl MemDisk {
    pub fn new(size: u64) -> MemDisk {
        MemDisk {
            blocks: Mutex::new(HashMap::new()),
            size,
        }
    }
}

impl Disk for MemDisk {
    fn read(&self, bno: u64) -> io::Result<Vec<u8>> {
        assert!(bno < self.size, "read past end of disk");
        let blocks = self.blocks.lock().unwrap();
        Ok(match blocks.get(&bno) {
            Some(b) => b.clone(),
            None => vec![0u8; BSIZE],
        })
    }

    fn write(&self, bno: u64, data: &[u8]) -> io::Result<()> {
        assert!(bno < self.size, "write past end of disk");
        assert_eq!(data.len(), BSIZE);
        self.blocks.lock().unwrap().insert(bno, data.to_vec());
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn barrier(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_sparse_reads_zero() {
        let d = MemDisk::new(10);
        assert_eq!(d.read(3).unwrap(), vec![0u8; BSIZE]);
        let mut blk = vec![0u8; BSIZE];
        blk[0] = 0xab;
        d.write(3, &blk).unwrap();
        assert_eq!(d.read(3).unwrap()[0], 0xab);
    }

    #[test]
    fn filedisk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let d = FileDisk::open(&path, 8).unwrap();
        assert_eq!(d.size(), 8);
        let mut blk = vec![0u8; BSIZE];
        blk[100] = 0x5a;
        d.write(7, &blk).unwrap();
        d.barrier().unwrap();
        assert_eq!(d.read(7).unwrap()[100], 0x5a);
        assert_eq!(d.read(0).unwrap(), vec![0u8; BSIZE]);

        // reopen keeps contents and size
        drop(d);
        let d = FileDisk::open(&path, 0).unwrap();
        assert_eq!(d.size(), 8);
        assert_eq!(d.read(7).unwrap()[100], 0x5a);
    }
}
