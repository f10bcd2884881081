//! NFSv3 procedures. Each call is exactly one filesystem transaction:
//! acquire the inodes it names, mutate through the alloc-transaction,
//! commit (releasing the inodes), and only then hand freed inodes to
//! the shrinker.

use std::cmp;

use log::debug;

use super::{now_nanos, Nfs};
use crate::dir;
use crate::fh::Fh;
use crate::fstxn::FsTxn;
use crate::inode::{Inode, Kind, MAXFILESZ};
use crate::nfstypes::*;
use crate::param::{Inum, BSIZE, MAXNAMELEN, NULLINUM, WSIZE};

fn to_nfstime(nanos: u64) -> Nfstime3 {
    Nfstime3 {
        seconds: (nanos / 1_000_000_000) as u32,
        nseconds: (nanos % 1_000_000_000) as u32,
    }
}

fn from_nfstime(t: Nfstime3) -> u64 {
    t.seconds as u64 * 1_000_000_000 + t.nseconds as u64
}

fn kind_ftype(kind: Kind) -> Ftype3 {
    match kind {
        Kind::Reg => Ftype3::Reg,
        Kind::Dir => Ftype3::Dir,
        Kind::Blk => Ftype3::Blk,
        Kind::Chr => Ftype3::Chr,
        Kind::Lnk => Ftype3::Lnk,
        Kind::Sock => Ftype3::Sock,
        Kind::Fifo => Ftype3::Fifo,
        Kind::Free => panic!("attributes of a free inode"),
    }
}

fn attrs(ip: &Inode) -> Fattr3 {
    Fattr3 {
        ftype: kind_ftype(ip.kind),
        mode: ip.mode,
        nlink: ip.nlink as u32,
        uid: ip.uid,
        gid: ip.gid,
        size: ip.size,
        used: ip.shrink_size * BSIZE as u64,
        fileid: ip.inum,
        atime: to_nfstime(ip.atime),
        mtime: to_nfstime(ip.mtime),
        ctime: to_nfstime(ip.ctime),
    }
}

fn apply_sattr(ip: &mut Inode, sa: &Sattr3) {
    if let Some(mode) = sa.mode {
        ip.mode = mode;
    }
    if let Some(uid) = sa.uid {
        ip.uid = uid;
    }
    if let Some(gid) = sa.gid {
        ip.gid = gid;
    }
    if let Some(size) = sa.size {
        ip.size = size;
    }
    if let Some(t) = sa.atime {
        ip.atime = from_nfstime(t);
    }
    if let Some(t) = sa.mtime {
        ip.mtime = from_nfstime(t);
    }
}

impl Nfs {
    fn begin(&self) -> FsTxn {
        FsTxn::begin(&self.fsstate)
    }

    /// Resolve a file handle inside the transaction, verifying the
    /// generation against the loaded inode.
    fn get_fh(&self, op: &mut FsTxn, fh3: &NfsFh3) -> Result<Inum, Nfsstat3> {
        let fh = Fh::from_nfs(fh3);
        let inum = op.get_inode_inum(fh.ino).ok_or(Nfsstat3::Stale)?;
        if op.ip(inum).gen != fh.gen {
            return Err(Nfsstat3::Stale);
        }
        Ok(inum)
    }

    fn get_dir_fh(&self, op: &mut FsTxn, fh3: &NfsFh3) -> Result<Inum, Nfsstat3> {
        let inum = self.get_fh(op, fh3)?;
        if op.ip(inum).kind != Kind::Dir {
            return Err(Nfsstat3::Notdir);
        }
        Ok(inum)
    }

    fn finish(op: FsTxn) -> Nfsstat3 {
        if op.commit() {
            Nfsstat3::Ok
        } else {
            Nfsstat3::Serverfault
        }
    }

    pub fn null(&self) {
        debug!("NULL");
    }

    pub fn getattr(&self, args: Getattr3Args) -> Getattr3Res {
        debug!("GETATTR {:?}", args.object);
        let mut op = self.begin();
        let inum = match self.get_fh(&mut op, &args.object) {
            Ok(i) => i,
            Err(status) => {
                op.abort();
                return Getattr3Res {
                    status,
                    obj_attributes: None,
                };
            }
        };
        let attr = attrs(op.ip(inum));
        Getattr3Res {
            status: Self::finish(op),
            obj_attributes: Some(attr),
        }
    }

    pub fn setattr(&self, args: Setattr3Args) -> Setattr3Res {
        debug!("SETATTR {:?}", args.object);
        let mut op = self.begin();
        let inum = match self.get_fh(&mut op, &args.object) {
            Ok(i) => i,
            Err(status) => {
                op.abort();
                return Setattr3Res { status };
            }
        };
        if args.new_attributes.size.is_some() && op.ip(inum).kind != Kind::Reg {
            op.abort();
            return Setattr3Res {
                status: Nfsstat3::Inval,
            };
        }
        let (ip, atxn) = op.ip_atxn(inum);
        apply_sattr(ip, &args.new_attributes);
        ip.ctime = now_nanos();
        ip.write_inode(atxn);
        let shrink = ip.shrink_needed();
        let status = Self::finish(op);
        if status == Nfsstat3::Ok && shrink {
            self.shrinker.start_shrinker(inum);
        }
        Setattr3Res { status }
    }

    pub fn lookup(&self, args: Lookup3Args) -> Lookup3Res {
        debug!("LOOKUP {}", args.what.name);
        fn err(status: Nfsstat3) -> Lookup3Res {
            Lookup3Res {
                status,
                object: NfsFh3::default(),
                obj_attributes: None,
            }
        }
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.what.dir) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        let (dip, atxn) = op.ip_atxn(dinum);
        let (inum, _) = dir::lookup_name(dip, atxn, &args.what.name);
        if inum == NULLINUM {
            op.abort();
            return err(Nfsstat3::Noent);
        }
        if op.get_inode_inum(inum).is_none() {
            op.abort();
            return err(Nfsstat3::Stale);
        }
        let child = op.ip(inum);
        let object = Fh {
            ino: inum,
            gen: child.gen,
        }
        .to_nfs();
        let attr = attrs(child);
        Lookup3Res {
            status: Self::finish(op),
            object,
            obj_attributes: Some(attr),
        }
    }

    pub fn readlink(&self, args: Readlink3Args) -> Readlink3Res {
        debug!("READLINK {:?}", args.symlink);
        fn err(status: Nfsstat3) -> Readlink3Res {
            Readlink3Res {
                status,
                data: String::new(),
            }
        }
        let mut op = self.begin();
        let inum = match self.get_fh(&mut op, &args.symlink) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        if op.ip(inum).kind != Kind::Lnk {
            op.abort();
            return err(Nfsstat3::Inval);
        }
        let (ip, atxn) = op.ip_atxn(inum);
        let size = ip.size;
        let (data, _) = ip.read(atxn, 0, size);
        let path = String::from_utf8_lossy(&data).into_owned();
        Readlink3Res {
            status: Self::finish(op),
            data: path,
        }
    }

    pub fn read(&self, args: Read3Args) -> Read3Res {
        debug!("READ {:?} off {} count {}", args.file, args.offset, args.count);
        fn err(status: Nfsstat3) -> Read3Res {
            Read3Res {
                status,
                count: 0,
                eof: false,
                data: Vec::new(),
            }
        }
        let mut op = self.begin();
        let inum = match self.get_fh(&mut op, &args.file) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        match op.ip(inum).kind {
            Kind::Reg => {}
            Kind::Dir => {
                op.abort();
                return err(Nfsstat3::Isdir);
            }
            _ => {
                op.abort();
                return err(Nfsstat3::Inval);
            }
        }
        let count = cmp::min(args.count as u64, WSIZE);
        let (ip, atxn) = op.ip_atxn(inum);
        let (data, eof) = ip.read(atxn, args.offset, count);
        Read3Res {
            status: Self::finish(op),
            count: data.len() as u32,
            eof,
            data,
        }
    }

    pub fn write(&self, args: Write3Args) -> Write3Res {
        debug!(
            "WRITE {:?} off {} len {}",
            args.file,
            args.offset,
            args.data.len()
        );
        fn err(status: Nfsstat3) -> Write3Res {
            Write3Res {
                status,
                count: 0,
                committed: StableHow::FileSync,
            }
        }
        let mut op = self.begin();
        let inum = match self.get_fh(&mut op, &args.file) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        if op.ip(inum).kind != Kind::Reg {
            op.abort();
            return err(Nfsstat3::Inval);
        }
        // One procedure is one transaction; a short write keeps the
        // transaction within the journal's bound.
        let n = cmp::min(args.data.len() as u64, WSIZE) as usize;
        if args.offset.checked_add(n as u64).map_or(true, |e| e > MAXFILESZ) {
            op.abort();
            return err(Nfsstat3::Fbig);
        }
        let (ip, atxn) = op.ip_atxn(inum);
        let now = now_nanos();
        ip.mtime = now;
        ip.ctime = now;
        let (count, ok) = ip.write(atxn, args.offset, &args.data[..n]);
        if count == 0 && !ok {
            op.abort();
            return err(Nfsstat3::Nospc);
        }
        let stable = args.stable != StableHow::Unstable;
        let committed = if stable { op.commit() } else { op.commit_unstable() };
        Write3Res {
            status: if committed {
                Nfsstat3::Ok
            } else {
                Nfsstat3::Serverfault
            },
            count: count as u32,
            committed: if stable {
                StableHow::FileSync
            } else {
                StableHow::Unstable
            },
        }
    }

    /// Common name checks for procedures creating an entry.
    fn check_new_name(name: &str) -> Result<(), Nfsstat3> {
        if dir::illegal_name(name) {
            return Err(Nfsstat3::Inval);
        }
        if name.len() as u64 >= MAXNAMELEN {
            return Err(Nfsstat3::Nametoolong);
        }
        Ok(())
    }

    pub fn create(&self, args: Create3Args) -> Create3Res {
        debug!("CREATE {}", args.where_.name);
        fn err(status: Nfsstat3) -> Create3Res {
            Create3Res {
                status,
                obj: NfsFh3::default(),
                obj_attributes: None,
            }
        }
        let sattr = match args.how {
            Createhow3::Unchecked(s) | Createhow3::Guarded(s) => s,
            Createhow3::Exclusive(_) => return err(Nfsstat3::Notsupp),
        };
        let name = &args.where_.name;
        if let Err(s) = Self::check_new_name(name) {
            return err(s);
        }
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.where_.dir) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let (existing, _) = dir::lookup_name(dip, atxn, name);
            if existing != NULLINUM {
                op.abort();
                return err(Nfsstat3::Exist);
            }
        }
        let inum = match op.alloc_inode(Kind::Reg, sattr.mode.unwrap_or(0o644)) {
            Some(i) => i,
            None => {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        };
        {
            let (ip, atxn) = op.ip_atxn(inum);
            ip.nlink = 1;
            let now = now_nanos();
            ip.atime = now;
            ip.mtime = now;
            ip.ctime = now;
            ip.uid = sattr.uid.unwrap_or(0);
            ip.gid = sattr.gid.unwrap_or(0);
            ip.write_inode(atxn);
        }
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let now = now_nanos();
            dip.mtime = now;
            dip.ctime = now;
            if !dir::add_name(dip, atxn, inum, name) {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        }
        let child = op.ip(inum);
        let obj = Fh {
            ino: inum,
            gen: child.gen,
        }
        .to_nfs();
        let attr = attrs(child);
        Create3Res {
            status: Self::finish(op),
            obj,
            obj_attributes: Some(attr),
        }
    }

    pub fn mkdir(&self, args: Mkdir3Args) -> Mkdir3Res {
        debug!("MKDIR {}", args.where_.name);
        fn err(status: Nfsstat3) -> Mkdir3Res {
            Mkdir3Res {
                status,
                obj: NfsFh3::default(),
                obj_attributes: None,
            }
        }
        let name = &args.where_.name;
        if let Err(s) = Self::check_new_name(name) {
            return err(s);
        }
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.where_.dir) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let (existing, _) = dir::lookup_name(dip, atxn, name);
            if existing != NULLINUM {
                op.abort();
                return err(Nfsstat3::Exist);
            }
        }
        let inum = match op.alloc_inode(Kind::Dir, args.attributes.mode.unwrap_or(0o755)) {
            Some(i) => i,
            None => {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        };
        {
            let (ip, atxn) = op.ip_atxn(inum);
            ip.nlink = 2; // "." plus the parent's entry
            let now = now_nanos();
            ip.atime = now;
            ip.mtime = now;
            ip.ctime = now;
            ip.uid = args.attributes.uid.unwrap_or(0);
            ip.gid = args.attributes.gid.unwrap_or(0);
            if !dir::init_dir(ip, atxn, dinum) {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        }
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let now = now_nanos();
            dip.mtime = now;
            dip.ctime = now;
            if !dir::add_name(dip, atxn, inum, name) {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
            dip.nlink += 1; // the child's ".."
            dip.write_inode(atxn);
        }
        let child = op.ip(inum);
        let obj = Fh {
            ino: inum,
            gen: child.gen,
        }
        .to_nfs();
        let attr = attrs(child);
        Mkdir3Res {
            status: Self::finish(op),
            obj,
            obj_attributes: Some(attr),
        }
    }

    pub fn symlink(&self, args: Symlink3Args) -> Symlink3Res {
        debug!("SYMLINK {} -> {}", args.where_.name, args.symlink_data);
        fn err(status: Nfsstat3) -> Symlink3Res {
            Symlink3Res {
                status,
                obj: NfsFh3::default(),
            }
        }
        let name = &args.where_.name;
        if let Err(s) = Self::check_new_name(name) {
            return err(s);
        }
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.where_.dir) {
            Ok(i) => i,
            Err(s) => {
                op.abort();
                return err(s);
            }
        };
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let (existing, _) = dir::lookup_name(dip, atxn, name);
            if existing != NULLINUM {
                op.abort();
                return err(Nfsstat3::Exist);
            }
        }
        let inum = match op.alloc_inode(Kind::Lnk, args.symlink_attributes.mode.unwrap_or(0o777)) {
            Some(i) => i,
            None => {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        };
        {
            let (ip, atxn) = op.ip_atxn(inum);
            ip.nlink = 1;
            let now = now_nanos();
            ip.atime = now;
            ip.mtime = now;
            ip.ctime = now;
            let (_, ok) = ip.write(atxn, 0, args.symlink_data.as_bytes());
            if !ok {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        }
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            if !dir::add_name(dip, atxn, inum, name) {
                op.abort();
                return err(Nfsstat3::Nospc);
            }
        }
        let obj = Fh {
            ino: inum,
            gen: op.ip(inum).gen,
        }
        .to_nfs();
        Symlink3Res {
            status: Self::finish(op),
            obj,
        }
    }

    pub fn remove(&self, args: Remove3Args) -> Remove3Res {
        debug!("REMOVE {}", args.object.name);
        let name = &args.object.name;
        if dir::illegal_name(name) {
            return Remove3Res {
                status: Nfsstat3::Inval,
            };
        }
        let mut op = self.begin();
        let status = match self.remove_locked(&mut op, &args.object.dir, name) {
            Ok(freed) => {
                let status = Self::finish(op);
                if status == Nfsstat3::Ok {
                    if let Some(inum) = freed {
                        self.shrinker.start_shrinker(inum);
                    }
                }
                status
            }
            Err(s) => {
                op.abort();
                s
            }
        };
        Remove3Res { status }
    }

    fn remove_locked(
        &self,
        op: &mut FsTxn,
        dir_fh: &NfsFh3,
        name: &str,
    ) -> Result<Option<Inum>, Nfsstat3> {
        let dinum = self.get_dir_fh(op, dir_fh)?;
        let inum = {
            let (dip, atxn) = op.ip_atxn(dinum);
            let (inum, _) = dir::lookup_name(dip, atxn, name);
            inum
        };
        if inum == NULLINUM {
            return Err(Nfsstat3::Noent);
        }
        if op.get_inode_inum(inum).is_none() {
            return Err(Nfsstat3::Stale);
        }
        if op.ip(inum).kind == Kind::Dir {
            return Err(Nfsstat3::Isdir);
        }
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let now = now_nanos();
            dip.mtime = now;
            dip.ctime = now;
            if !dir::rem_name(dip, atxn, name) {
                return Err(Nfsstat3::Serverfault);
            }
        }
        let (ip, atxn) = op.ip_atxn(inum);
        ip.nlink -= 1;
        ip.ctime = now_nanos();
        if ip.nlink == 0 {
            // last name gone; the shrinker reclaims blocks and inum
            ip.size = 0;
        }
        ip.write_inode(atxn);
        Ok(if ip.nlink == 0 { Some(inum) } else { None })
    }

    pub fn rmdir(&self, args: Rmdir3Args) -> Rmdir3Res {
        debug!("RMDIR {}", args.object.name);
        let name = &args.object.name;
        if dir::illegal_name(name) {
            return Rmdir3Res {
                status: Nfsstat3::Inval,
            };
        }
        let mut op = self.begin();
        let status = match self.rmdir_locked(&mut op, &args.object.dir, name) {
            Ok(inum) => {
                let status = Self::finish(op);
                if status == Nfsstat3::Ok {
                    self.shrinker.start_shrinker(inum);
                }
                status
            }
            Err(s) => {
                op.abort();
                s
            }
        };
        Rmdir3Res { status }
    }

    fn rmdir_locked(&self, op: &mut FsTxn, dir_fh: &NfsFh3, name: &str) -> Result<Inum, Nfsstat3> {
        let dinum = self.get_dir_fh(op, dir_fh)?;
        let inum = {
            let (dip, atxn) = op.ip_atxn(dinum);
            let (inum, _) = dir::lookup_name(dip, atxn, name);
            inum
        };
        if inum == NULLINUM {
            return Err(Nfsstat3::Noent);
        }
        if op.get_inode_inum(inum).is_none() {
            return Err(Nfsstat3::Stale);
        }
        if op.ip(inum).kind != Kind::Dir {
            return Err(Nfsstat3::Notdir);
        }
        {
            let (ip, atxn) = op.ip_atxn(inum);
            if !dir::is_dir_empty(ip, atxn) {
                return Err(Nfsstat3::Notempty);
            }
        }
        {
            let (dip, atxn) = op.ip_atxn(dinum);
            let now = now_nanos();
            dip.mtime = now;
            dip.ctime = now;
            dip.nlink -= 1; // the child's ".."
            if !dir::rem_name(dip, atxn, name) {
                return Err(Nfsstat3::Serverfault);
            }
        }
        let (ip, atxn) = op.ip_atxn(inum);
        ip.nlink = 0;
        ip.size = 0;
        ip.ctime = now_nanos();
        ip.write_inode(atxn);
        Ok(inum)
    }

    pub fn rename(&self, args: Rename3Args) -> Rename3Res {
        debug!("RENAME {} -> {}", args.from.name, args.to.name);
        let res = |status| Rename3Res { status };
        let from_name = &args.from.name;
        let to_name = &args.to.name;
        if dir::illegal_name(from_name) || dir::illegal_name(to_name) {
            return res(Nfsstat3::Inval);
        }
        if to_name.len() as u64 >= MAXNAMELEN {
            return res(Nfsstat3::Nametoolong);
        }
        let ffh = Fh::from_nfs(&args.from.dir);
        let tfh = Fh::from_nfs(&args.to.dir);
        let mut op = self.begin();
        match self.rename_locked(&mut op, ffh, tfh, from_name, to_name) {
            Ok(freed) => {
                let status = Self::finish(op);
                if status == Nfsstat3::Ok {
                    if let Some(inum) = freed {
                        self.shrinker.start_shrinker(inum);
                    }
                }
                res(status)
            }
            Err(s) => {
                op.abort();
                res(s)
            }
        }
    }

    fn rename_locked(
        &self,
        op: &mut FsTxn,
        ffh: Fh,
        tfh: Fh,
        from_name: &str,
        to_name: &str,
    ) -> Result<Option<Inum>, Nfsstat3> {
        // Every inode this transaction touches must be acquired in one
        // globally ascending pass. The children are only discoverable
        // under the directory locks, so discovery is optimistic: lock
        // the directories, look the names up, and if a child sorts
        // below a directory, drop everything and re-acquire the whole
        // set in order, revalidating the lookups.
        let (lo, hi) = if ffh.ino <= tfh.ino {
            (ffh.ino, tfh.ino)
        } else {
            (tfh.ino, ffh.ino)
        };
        let mut attempts = 0;
        let (src_inum, dst_inum) = loop {
            if op.get_inode_inum(lo).is_none() {
                return Err(Nfsstat3::Stale);
            }
            if hi != lo && op.get_inode_inum(hi).is_none() {
                return Err(Nfsstat3::Stale);
            }
            if op.ip(ffh.ino).gen != ffh.gen || op.ip(tfh.ino).gen != tfh.gen {
                return Err(Nfsstat3::Stale);
            }
            if op.ip(ffh.ino).kind != Kind::Dir || op.ip(tfh.ino).kind != Kind::Dir {
                return Err(Nfsstat3::Notdir);
            }

            let (src_inum, _) = {
                let (dip, atxn) = op.ip_atxn(ffh.ino);
                dir::lookup_name(dip, atxn, from_name)
            };
            if src_inum == NULLINUM {
                return Err(Nfsstat3::Noent);
            }
            let (dst_inum, _) = {
                let (dip, atxn) = op.ip_atxn(tfh.ino);
                dir::lookup_name(dip, atxn, to_name)
            };
            if ffh.ino == tfh.ino && from_name == to_name {
                return Ok(None);
            }
            if src_inum == dst_inum {
                // both names already link the same inode
                return Ok(None);
            }

            let mut all = vec![ffh.ino, tfh.ino, src_inum];
            if dst_inum != NULLINUM {
                all.push(dst_inum);
            }
            all.sort_unstable();
            all.dedup();

            let pending: Vec<Inum> =
                all.iter().copied().filter(|i| !op.own_inum(*i)).collect();
            if pending.first().map_or(true, |&k| k > hi) {
                // the children sort after the held directories, so the
                // ascending order extends in place
                if pending.iter().all(|&k| op.get_inode_inum(k).is_some()) {
                    break (src_inum, dst_inum);
                }
            } else {
                op.release_all();
                if all.iter().all(|&i| op.get_inode_inum(i).is_some()) {
                    let fresh = op.ip(ffh.ino).gen == ffh.gen
                        && op.ip(tfh.ino).gen == tfh.gen
                        && op.ip(ffh.ino).kind == Kind::Dir
                        && op.ip(tfh.ino).kind == Kind::Dir;
                    if fresh {
                        let src2 = {
                            let (dip, atxn) = op.ip_atxn(ffh.ino);
                            dir::lookup_name(dip, atxn, from_name).0
                        };
                        let dst2 = {
                            let (dip, atxn) = op.ip_atxn(tfh.ino);
                            dir::lookup_name(dip, atxn, to_name).0
                        };
                        if src2 == src_inum && dst2 == dst_inum {
                            break (src_inum, dst_inum);
                        }
                    }
                }
            }
            // the directories changed while unlocked; start over
            op.release_all();
            attempts += 1;
            if attempts >= 8 {
                return Err(Nfsstat3::Serverfault);
            }
        };

        let src_kind = op.ip(src_inum).kind;
        let mut freed = None;
        if dst_inum != NULLINUM {
            let dst_kind = op.ip(dst_inum).kind;
            if dst_kind == Kind::Dir {
                if src_kind != Kind::Dir {
                    return Err(Nfsstat3::Isdir);
                }
                let empty = {
                    let (dst, atxn) = op.ip_atxn(dst_inum);
                    dir::is_dir_empty(dst, atxn)
                };
                if !empty {
                    return Err(Nfsstat3::Notempty);
                }
            } else if src_kind == Kind::Dir {
                return Err(Nfsstat3::Exist);
            }
            {
                let (tdip, atxn) = op.ip_atxn(tfh.ino);
                if !dir::rem_name(tdip, atxn, to_name) {
                    return Err(Nfsstat3::Serverfault);
                }
                if dst_kind == Kind::Dir {
                    tdip.nlink -= 1;
                    tdip.write_inode(atxn);
                }
            }
            let (dst, atxn) = op.ip_atxn(dst_inum);
            if dst.kind == Kind::Dir {
                dst.nlink = 0;
            } else {
                dst.nlink -= 1;
            }
            dst.ctime = now_nanos();
            if dst.nlink == 0 {
                dst.size = 0;
                freed = Some(dst_inum);
            }
            dst.write_inode(atxn);
        }

        {
            let (sdip, atxn) = op.ip_atxn(ffh.ino);
            let now = now_nanos();
            sdip.mtime = now;
            sdip.ctime = now;
            if !dir::rem_name(sdip, atxn, from_name) {
                return Err(Nfsstat3::Serverfault);
            }
        }
        {
            let (tdip, atxn) = op.ip_atxn(tfh.ino);
            let now = now_nanos();
            tdip.mtime = now;
            tdip.ctime = now;
            if !dir::add_name(tdip, atxn, src_inum, to_name) {
                return Err(Nfsstat3::Nospc);
            }
        }
        if src_kind == Kind::Dir && ffh.ino != tfh.ino {
            // a moved directory re-parents: fix ".." and both link counts
            {
                let (sdip, atxn) = op.ip_atxn(ffh.ino);
                sdip.nlink -= 1;
                sdip.write_inode(atxn);
            }
            {
                let (tdip, atxn) = op.ip_atxn(tfh.ino);
                tdip.nlink += 1;
                tdip.write_inode(atxn);
            }
            let (child, atxn) = op.ip_atxn(src_inum);
            if !dir::rem_name(child, atxn, "..") || !dir::add_name(child, atxn, tfh.ino, "..") {
                return Err(Nfsstat3::Serverfault);
            }
        }
        let (src, atxn) = op.ip_atxn(src_inum);
        src.ctime = now_nanos();
        src.write_inode(atxn);
        Ok(freed)
    }

    pub fn link(&self, args: Link3Args) -> Link3Res {
        debug!("LINK {:?} as {}", args.file, args.link.name);
        let res = |status| Link3Res { status };
        let name = &args.link.name;
        if let Err(s) = Self::check_new_name(name) {
            return res(s);
        }
        let ffh = Fh::from_nfs(&args.file);
        let dfh = Fh::from_nfs(&args.link.dir);
        let mut op = self.begin();
        match self.link_locked(&mut op, ffh, dfh, name) {
            Ok(()) => res(Self::finish(op)),
            Err(s) => {
                op.abort();
                res(s)
            }
        }
    }

    fn link_locked(
        &self,
        op: &mut FsTxn,
        ffh: Fh,
        dfh: Fh,
        name: &str,
    ) -> Result<(), Nfsstat3> {
        let (lo, hi) = if ffh.ino <= dfh.ino {
            (ffh.ino, dfh.ino)
        } else {
            (dfh.ino, ffh.ino)
        };
        if op.get_inode_inum(lo).is_none() {
            return Err(Nfsstat3::Stale);
        }
        if hi != lo && op.get_inode_inum(hi).is_none() {
            return Err(Nfsstat3::Stale);
        }
        if op.ip(ffh.ino).gen != ffh.gen || op.ip(dfh.ino).gen != dfh.gen {
            return Err(Nfsstat3::Stale);
        }
        if op.ip(dfh.ino).kind != Kind::Dir {
            return Err(Nfsstat3::Notdir);
        }
        if op.ip(ffh.ino).kind == Kind::Dir {
            return Err(Nfsstat3::Inval);
        }
        {
            let (dip, atxn) = op.ip_atxn(dfh.ino);
            let (existing, _) = dir::lookup_name(dip, atxn, name);
            if existing != NULLINUM {
                return Err(Nfsstat3::Exist);
            }
            let now = now_nanos();
            dip.mtime = now;
            dip.ctime = now;
            if !dir::add_name(dip, atxn, ffh.ino, name) {
                return Err(Nfsstat3::Nospc);
            }
        }
        let (ip, atxn) = op.ip_atxn(ffh.ino);
        ip.nlink += 1;
        ip.ctime = now_nanos();
        ip.write_inode(atxn);
        Ok(())
    }

    pub fn readdir(&self, args: Readdir3Args) -> Readdir3Res {
        debug!("READDIR {:?} cookie {}", args.dir, args.cookie);
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.dir) {
            Ok(i) => i,
            Err(status) => {
                op.abort();
                return Readdir3Res {
                    status,
                    entries: Vec::new(),
                    eof: false,
                };
            }
        };
        let mut entries = Vec::new();
        let (dip, atxn) = op.ip_atxn(dinum);
        let eof = dir::apply_ents(dip, atxn, args.cookie, args.count as u64, |name, inum, off| {
            entries.push(Entry3 {
                fileid: inum,
                name: name.to_string(),
                cookie: off,
            });
        });
        Readdir3Res {
            status: Self::finish(op),
            entries,
            eof,
        }
    }

    pub fn readdirplus(&self, args: Readdirplus3Args) -> Readdirplus3Res {
        debug!("READDIRPLUS {:?} cookie {}", args.dir, args.cookie);
        let mut op = self.begin();
        let dinum = match self.get_dir_fh(&mut op, &args.dir) {
            Ok(i) => i,
            Err(status) => {
                op.abort();
                return Readdirplus3Res {
                    status,
                    entries: Vec::new(),
                    eof: false,
                };
            }
        };
        let mut entries = Vec::new();
        let eof = dir::apply(
            &mut op,
            dinum,
            args.cookie,
            args.dircount as u64,
            args.maxcount as u64,
            |ip, name, inum, off| {
                entries.push(Entryplus3 {
                    fileid: inum,
                    name: name.to_string(),
                    cookie: off,
                    name_attributes: ip.map(attrs),
                    name_handle: ip.map(|ip| {
                        Fh {
                            ino: inum,
                            gen: ip.gen,
                        }
                        .to_nfs()
                    }),
                });
            },
        );
        Readdirplus3Res {
            status: Self::finish(op),
            entries,
            eof,
        }
    }

    /// Flush everything the journal has absorbed, including unstable
    /// writes.
    pub fn commit(&self, args: Commit3Args) -> Commit3Res {
        debug!("COMMIT {:?}", args.file);
        let mut op = self.begin();
        if let Err(status) = self.get_fh(&mut op, &args.file) {
            op.abort();
            return Commit3Res { status };
        }
        Commit3Res {
            status: Self::finish(op),
        }
    }
}
