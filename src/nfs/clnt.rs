//! In-process client, for tests and benchmarks. Wraps a server backed
//! by a memory disk and exposes one helper per procedure.

use std::sync::Arc;
use std::thread;

use super::Nfs;
use crate::disk::{Disk, MemDisk};
use crate::fh;
use crate::nfstypes::*;

pub struct NfsClient {
    pub srv: Nfs,
    disk: Arc<MemDisk>,
}

impl NfsClient {
    /// A fresh server over a memory disk of `sz` blocks.
    pub fn new(sz: u64) -> NfsClient {
        let disk = Arc::new(MemDisk::new(sz));
        let srv = Nfs::new(disk.clone() as Arc<dyn Disk>).expect("mount failed");
        NfsClient { srv, disk }
    }

    /// Tear the server down and mount the same disk again, as a
    /// restart after a crash would.
    pub fn restart(self) -> NfsClient {
        let NfsClient { srv, disk } = self;
        drop(srv);
        let srv = Nfs::new(disk.clone() as Arc<dyn Disk>).expect("re-mount failed");
        NfsClient { srv, disk }
    }

    pub fn root_fh(&self) -> NfsFh3 {
        fh::mk_root_fh3()
    }

    pub fn shutdown(&self) {
        self.srv.shutdown();
    }

    pub fn crash(&self) {
        self.srv.crash();
    }

    pub fn create_op(&self, dir: &NfsFh3, name: &str) -> Create3Res {
        self.srv.create(Create3Args {
            where_: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
            how: Createhow3::Unchecked(Sattr3::default()),
        })
    }

    pub fn lookup_op(&self, dir: &NfsFh3, name: &str) -> Lookup3Res {
        self.srv.lookup(Lookup3Args {
            what: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
        })
    }

    pub fn getattr_op(&self, fh: &NfsFh3) -> Getattr3Res {
        self.srv.getattr(Getattr3Args { object: fh.clone() })
    }

    pub fn setattr_size_op(&self, fh: &NfsFh3, size: u64) -> Setattr3Res {
        self.srv.setattr(Setattr3Args {
            object: fh.clone(),
            new_attributes: Sattr3 {
                size: Some(size),
                ..Sattr3::default()
            },
        })
    }

    pub fn write_op(&self, fh: &NfsFh3, off: u64, data: &[u8], how: StableHow) -> Write3Res {
        self.srv.write(Write3Args {
            file: fh.clone(),
            offset: off,
            stable: how,
            data: data.to_vec(),
        })
    }

    /// Write the whole buffer, looping over the server's short writes.
    pub fn write_all(&self, fh: &NfsFh3, mut off: u64, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let res = self.write_op(fh, off, rest, StableHow::FileSync);
            assert_eq!(res.status, Nfsstat3::Ok, "write failed");
            assert!(res.count > 0, "no progress writing");
            off += res.count as u64;
            rest = &rest[res.count as usize..];
        }
    }

    pub fn read_op(&self, fh: &NfsFh3, off: u64, count: u32) -> Read3Res {
        self.srv.read(Read3Args {
            file: fh.clone(),
            offset: off,
            count,
        })
    }

    /// Read the whole range, looping over short reads.
    pub fn read_all(&self, fh: &NfsFh3, mut off: u64, mut count: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while count > 0 {
            let res = self.read_op(fh, off, count.min(u32::MAX as u64) as u32);
            assert_eq!(res.status, Nfsstat3::Ok, "read failed");
            if res.data.is_empty() {
                break;
            }
            off += res.data.len() as u64;
            count -= res.data.len() as u64;
            out.extend_from_slice(&res.data);
            if res.eof {
                break;
            }
        }
        out
    }

    pub fn remove_op(&self, dir: &NfsFh3, name: &str) -> Remove3Res {
        self.srv.remove(Remove3Args {
            object: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
        })
    }

    pub fn mkdir_op(&self, dir: &NfsFh3, name: &str) -> Mkdir3Res {
        self.srv.mkdir(Mkdir3Args {
            where_: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
            attributes: Sattr3::default(),
        })
    }

    pub fn rmdir_op(&self, dir: &NfsFh3, name: &str) -> Rmdir3Res {
        self.srv.rmdir(Rmdir3Args {
            object: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
        })
    }

    pub fn symlink_op(&self, dir: &NfsFh3, name: &str, path: &str) -> Symlink3Res {
        self.srv.symlink(Symlink3Args {
            where_: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
            symlink_attributes: Sattr3::default(),
            symlink_data: path.to_string(),
        })
    }

    pub fn readlink_op(&self, fh: &NfsFh3) -> Readlink3Res {
        self.srv.readlink(Readlink3Args {
            symlink: fh.clone(),
        })
    }

    pub fn rename_op(&self, from_dir: &NfsFh3, from: &str, to_dir: &NfsFh3, to: &str) -> Nfsstat3 {
        self.srv
            .rename(Rename3Args {
                from: Diropargs3 {
                    dir: from_dir.clone(),
                    name: from.to_string(),
                },
                to: Diropargs3 {
                    dir: to_dir.clone(),
                    name: to.to_string(),
                },
            })
            .status
    }

    pub fn link_op(&self, file: &NfsFh3, dir: &NfsFh3, name: &str) -> Link3Res {
        self.srv.link(Link3Args {
            file: file.clone(),
            link: Diropargs3 {
                dir: dir.clone(),
                name: name.to_string(),
            },
        })
    }

    pub fn commit_op(&self, fh: &NfsFh3, count: u32) -> Commit3Res {
        self.srv.commit(Commit3Args {
            file: fh.clone(),
            offset: 0,
            count,
        })
    }

    pub fn readdir_op(&self, dir: &NfsFh3, cookie: u64, count: u32) -> Readdir3Res {
        self.srv.readdir(Readdir3Args {
            dir: dir.clone(),
            cookie,
            count,
        })
    }

    pub fn readdirplus_op(
        &self,
        dir: &NfsFh3,
        cookie: u64,
        dircount: u32,
        maxcount: u32,
    ) -> Readdirplus3Res {
        self.srv.readdirplus(Readdirplus3Args {
            dir: dir.clone(),
            cookie,
            dircount,
            maxcount,
        })
    }
}

/// Run `nthread` workers against one server, each in its own fresh
/// directory `d<i>` under the root. Returns the sum of their results.
pub fn parallel<F>(nthread: usize, disksz: u64, f: F) -> usize
where
    F: Fn(&NfsClient, NfsFh3) -> usize + Send + Sync + 'static,
{
    let clnt = Arc::new(NfsClient::new(disksz));
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for i in 0..nthread {
        let clnt = clnt.clone();
        let f = f.clone();
        handles.push(thread::spawn(move || {
            let root = clnt.root_fh();
            let name = format!("d{}", i);
            let res = clnt.mkdir_op(&root, &name);
            assert_eq!(res.status, Nfsstat3::Ok, "parallel: mkdir failed");
            let reply = clnt.lookup_op(&root, &name);
            assert_eq!(reply.status, Nfsstat3::Ok, "parallel: lookup failed");
            (*f)(&clnt, reply.object)
        }));
    }
    let n = handles.into_iter().map(|h| h.join().unwrap()).sum();
    clnt.shutdown();
    n
}
