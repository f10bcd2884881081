//! NFSv3 vocabulary (RFC 1813), trimmed to the procedures this server
//! implements.

pub type Filename3 = String;
pub type Nfspath3 = String;
pub type Cookie3 = u64;

/// Status codes, with their wire values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Nfsstat3 {
    Ok = 0,
    Perm = 1,
    Noent = 2,
    Io = 5,
    Acces = 13,
    Exist = 17,
    Xdev = 18,
    Notdir = 20,
    Isdir = 21,
    Inval = 22,
    Fbig = 27,
    Nospc = 28,
    Rofs = 30,
    Mlink = 31,
    Nametoolong = 63,
    Notempty = 66,
    Stale = 70,
    Badhandle = 10001,
    Notsupp = 10004,
    Serverfault = 10006,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ftype3 {
    Reg = 1,
    Dir = 2,
    Blk = 3,
    Chr = 4,
    Lnk = 5,
    Sock = 6,
    Fifo = 7,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct NfsFh3 {
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Nfstime3 {
    pub seconds: u32,
    pub nseconds: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Fattr3 {
    pub ftype: Ftype3,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub fileid: u64,
    pub atime: Nfstime3,
    pub mtime: Nfstime3,
    pub ctime: Nfstime3,
}

/// Settable attributes; `None` means leave unchanged.
#[derive(Clone, Debug, Default)]
pub struct Sattr3 {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Nfstime3>,
    pub mtime: Option<Nfstime3>,
}

#[derive(Clone, Debug)]
pub struct Diropargs3 {
    pub dir: NfsFh3,
    pub name: Filename3,
}

#[derive(Clone, Debug)]
pub enum Createhow3 {
    Unchecked(Sattr3),
    Guarded(Sattr3),
    Exclusive([u8; 8]),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StableHow {
    Unstable,
    DataSync,
    FileSync,
}

// GETATTR

#[derive(Clone, Debug)]
pub struct Getattr3Args {
    pub object: NfsFh3,
}

#[derive(Clone, Debug)]
pub struct Getattr3Res {
    pub status: Nfsstat3,
    pub obj_attributes: Option<Fattr3>,
}

// SETATTR

#[derive(Clone, Debug)]
pub struct Setattr3Args {
    pub object: NfsFh3,
    pub new_attributes: Sattr3,
}

#[derive(Clone, Debug)]
pub struct Setattr3Res {
    pub status: Nfsstat3,
}

// LOOKUP

#[derive(Clone, Debug)]
pub struct Lookup3Args {
    pub what: Diropargs3,
}

#[derive(Clone, Debug)]
pub struct Lookup3Res {
    pub status: Nfsstat3,
    pub object: NfsFh3,
    pub obj_attributes: Option<Fattr3>,
}

// READLINK

#[derive(Clone, Debug)]
pub struct Readlink3Args {
    pub symlink: NfsFh3,
}

#[derive(Clone, Debug)]
pub struct Readlink3Res {
    pub status: Nfsstat3,
    pub data: Nfspath3,
}

// READ

#[derive(Clone, Debug)]
pub struct Read3Args {
    pub file: NfsFh3,
    pub offset: u64,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct Read3Res {
    pub status: Nfsstat3,
    pub count: u32,
    pub eof: bool,
    pub data: Vec<u8>,
}

// WRITE

#[derive(Clone, Debug)]
pub struct Write3Args {
    pub file: NfsFh3,
    pub offset: u64,
    pub stable: StableHow,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Write3Res {
    pub status: Nfsstat3,
    pub count: u32,
    pub committed: StableHow,
}

// CREATE

#[derive(Clone, Debug)]
pub struct Create3Args {
    pub where_: Diropargs3,
    pub how: Createhow3,
}

#[derive(Clone, Debug)]
pub struct Create3Res {
    pub status: Nfsstat3,
    pub obj: NfsFh3,
    pub obj_attributes: Option<Fattr3>,
}

// MKDIR

#[derive(Clone, Debug)]
pub struct Mkdir3Args {
    pub where_: Diropargs3,
    pub attributes: Sattr3,
}

#[derive(Clone, Debug)]
pub struct Mkdir3Res {
    pub status: Nfsstat3,
    pub obj: NfsFh3,
    pub obj_attributes: Option<Fattr3>,
}

// SYMLINK

#[derive(Clone, Debug)]
pub struct Symlink3Args {
    pub where_: Diropargs3,
    pub symlink_attributes: Sattr3,
    pub symlink_data: Nfspath3,
}

#[derive(Clone, Debug)]
pub struct Symlink3Res {
    pub status: Nfsstat3,
    pub obj: NfsFh3,
}

// REMOVE / RMDIR

#[derive(Clone, Debug)]
pub struct Remove3Args {
    pub object: Diropargs3,
}

#[derive(Clone, Debug)]
pub struct Remove3Res {
    pub status: Nfsstat3,
}

#[derive(Clone, Debug)]
pub struct Rmdir3Args {
    pub object: Diropargs3,
}

#[derive(Clone, Debug)]
pub struct Rmdir3Res {
    pub status: Nfsstat3,
}

// RENAME

#[derive(Clone, Debug)]
pub struct Rename3Args {
    pub from: Diropargs3,
    pub to: Diropargs3,
}

#[derive(Clone, Debug)]
pub struct Rename3Res {
    pub status: Nfsstat3,
}

// LINK

#[derive(Clone, Debug)]
pub struct Link3Args {
    pub file: NfsFh3,
    pub link: Diropargs3,
}

#[derive(Clone, Debug)]
pub struct Link3Res {
    pub status: Nfsstat3,
}

// READDIR

#[derive(Clone, Debug)]
pub struct Readdir3Args {
    pub dir: NfsFh3,
    pub cookie: Cookie3,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct Entry3 {
    pub fileid: u64,
    pub name: Filename3,
    pub cookie: Cookie3,
}

#[derive(Clone, Debug)]
pub struct Readdir3Res {
    pub status: Nfsstat3,
    pub entries: Vec<Entry3>,
    pub eof: bool,
}

// READDIRPLUS

#[derive(Clone, Debug)]
pub struct Readdirplus3Args {
    pub dir: NfsFh3,
    pub cookie: Cookie3,
    pub dircount: u32,
    pub maxcount: u32,
}

#[derive(Clone, Debug)]
pub struct Entryplus3 {
    pub fileid: u64,
    pub name: Filename3,
    pub cookie: Cookie3,
    pub name_attributes: Option<Fattr3>,
    pub name_handle: Option<NfsFh3>,
}

#[derive(Clone, Debug)]
pub struct Readdirplus3Res {
    pub status: Nfsstat3,
    pub entries: Vec<Entryplus3>,
    pub eof: bool,
}

// COMMIT

#[derive(Clone, Debug)]
pub struct Commit3Args {
    pub file: NfsFh3,
    pub offset: u64,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct Commit3Res {
    pub status: Nfsstat3,
}

// MOUNT protocol

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mountstat3 {
    Ok = 0,
    NoEnt = 2,
    Acces = 13,
}

#[derive(Clone, Debug)]
pub struct Mountres3 {
    pub status: Mountstat3,
    pub fhandle: NfsFh3,
}
