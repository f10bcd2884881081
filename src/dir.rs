//! Directories.
//!
//! A directory is a file holding fixed 128-byte slots: inum, name
//! length, then the raw name bytes. A slot with inum 0 is a tombstone
//! and may be reused. Lookups go through a per-directory cache built
//! lazily from a full scan; inserts probe forward from the cache's
//! `lastoff` cursor so tombstones are refilled before the directory
//! grows.

use std::cmp;
use std::collections::HashMap;

use log::trace;

use crate::alloctxn::AllocTxn;
use crate::dcache::Dcache;
use crate::fstxn::FsTxn;
use crate::inode::{Inode, Kind};
use crate::marshal::{Dec, Enc};
use crate::param::{Inum, DIRENTSZ, MAXNAMELEN, NULLINUM};

/// XDR size of a fattr3: type, mode, nlink, uid, gid, size, used,
/// rdev, fsid, fileid, and the three timestamps.
const FATTR3_XDR_SIZE: u64 = 4 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8 + 3 * 8;

/// Best estimate of an entryplus3's XDR size excluding the file name:
/// fileid, name length, cookie, post_op_attr header plus fattr3, the
/// name handle, and the next-entry pointer.
const ENTRYPLUS3_BAGGAGE: u64 = 8 + 4 + 8 + 4 + FATTR3_XDR_SIZE + 16 + 8;

/// Fixed portion of a READDIR/READDIRPLUS reply: directory attributes,
/// cookie verifier, first-entry pointer, and the final EOF flag.
const READDIR_BASE: u64 = 88 + 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEnt {
    pub inum: Inum,
    pub name: String, // strictly shorter than MAXNAMELEN
}

/// Caller must ensure the name fits.
pub fn encode_dirent(de: &DirEnt) -> Vec<u8> {
    let mut enc = Enc::new(DIRENTSZ as usize);
    enc.put_int(de.inum);
    enc.put_int(de.name.len() as u64);
    enc.put_bytes(de.name.as_bytes());
    enc.finish()
}

pub fn decode_dirent(d: &[u8]) -> DirEnt {
    let mut dec = Dec::new(d);
    let inum = dec.get_int();
    // the stored length is untrusted
    let len = cmp::min(dec.get_int(), MAXNAMELEN) as usize;
    let name = String::from_utf8_lossy(dec.get_bytes(len)).into_owned();
    DirEnt { inum, name }
}

pub fn illegal_name(name: &str) -> bool {
    name == "." || name == ".."
}

fn pad4(n: usize) -> u64 {
    if n % 4 == 0 {
        0
    } else {
        (4 - n % 4) as u64
    }
}

/// Bytes one entry contributes to the directory portion of the reply:
/// fileid, name length, name, padding, cookie, pointer.
fn dir_entry_size(name: &str) -> u64 {
    8 + 4 + name.len() as u64 + pad4(name.len()) + 8 + 4
}

fn read_slot(dip: &Inode, atxn: &mut AllocTxn, off: u64) -> Option<DirEnt> {
    let (data, _) = dip.read(atxn, off, DIRENTSZ);
    if data.len() as u64 != DIRENTSZ {
        return None;
    }
    Some(decode_dirent(&data))
}

/// Cacheless linear scan for `name`; returns `(NULLINUM, 0)` if
/// absent.
pub fn scan_name(dip: &Inode, atxn: &mut AllocTxn, name: &str) -> (Inum, u64) {
    if dip.kind != Kind::Dir {
        return (NULLINUM, 0);
    }
    let mut off = 0;
    while off < dip.size {
        let de = match read_slot(dip, atxn, off) {
            Some(de) => de,
            None => break,
        };
        if de.inum != NULLINUM && de.name == name {
            return (de.inum, off);
        }
        off += DIRENTSZ;
    }
    (NULLINUM, 0)
}

fn build_dcache(dip: &mut Inode, atxn: &mut AllocTxn) {
    let mut dc = Dcache::new();
    let mut off = 0;
    while off < dip.size {
        match read_slot(dip, atxn, off) {
            Some(de) => {
                if de.inum != NULLINUM {
                    dc.add(&de.name, de.inum, off);
                }
            }
            None => break,
        }
        off += DIRENTSZ;
    }
    dip.dcache = Some(dc);
}

/// Look `name` up through the directory cache, building it on first
/// use. Returns `(NULLINUM, 0)` if absent.
pub fn lookup_name(dip: &mut Inode, atxn: &mut AllocTxn, name: &str) -> (Inum, u64) {
    if dip.kind != Kind::Dir {
        return (NULLINUM, 0);
    }
    if dip.dcache.is_none() {
        build_dcache(dip, atxn);
    }
    match dip.dcache.as_ref().unwrap().lookup(name) {
        Some(d) => (d.inum, d.off),
        None => (NULLINUM, 0),
    }
}

/// Write the entry into the first free slot at or after `lastoff`,
/// extending the directory if none is free.
fn add_name_dir(
    dip: &mut Inode,
    atxn: &mut AllocTxn,
    inum: Inum,
    name: &str,
    lastoff: u64,
) -> (u64, bool) {
    let mut final_off = 0;
    let mut off = lastoff;
    while off < dip.size {
        match read_slot(dip, atxn, off) {
            Some(de) => {
                if de.inum == NULLINUM {
                    final_off = off;
                    break;
                }
            }
            None => break,
        }
        off += DIRENTSZ;
    }
    // Slot 0 is always "."; 0 here means no tombstone was found.
    if final_off == 0 {
        final_off = dip.size;
    }
    let ent = encode_dirent(&DirEnt {
        inum,
        name: name.to_string(),
    });
    trace!("add_name_dir # {}: {} -> {} off {}", dip.inum, name, inum, final_off);
    let (n, _) = dip.write(atxn, final_off, &ent);
    (final_off, n == DIRENTSZ)
}

/// Add `name -> inum` to the directory. Rejects non-directories and
/// names that do not fit a slot.
pub fn add_name(dip: &mut Inode, atxn: &mut AllocTxn, inum: Inum, name: &str) -> bool {
    if dip.kind != Kind::Dir || name.len() as u64 >= MAXNAMELEN {
        return false;
    }
    if dip.dcache.is_none() {
        build_dcache(dip, atxn);
    }
    let lastoff = dip.dcache.as_ref().unwrap().lastoff;
    let (off, ok) = add_name_dir(dip, atxn, inum, name, lastoff);
    if ok {
        let dc = dip.dcache.as_mut().unwrap();
        dc.lastoff = off;
        dc.add(name, inum, off);
    }
    ok
}

/// Replace the entry for `name` with a tombstone.
pub fn rem_name(dip: &mut Inode, atxn: &mut AllocTxn, name: &str) -> bool {
    if dip.kind != Kind::Dir || name.len() as u64 >= MAXNAMELEN {
        return false;
    }
    if dip.dcache.is_none() {
        build_dcache(dip, atxn);
    }
    let (inum, off) = lookup_name(dip, atxn, name);
    if inum == NULLINUM {
        return false;
    }
    trace!("rem_name # {}: {} {} off {}", dip.inum, name, inum, off);
    let ent = encode_dirent(&DirEnt {
        inum: NULLINUM,
        name: String::new(),
    });
    let (n, _) = dip.write(atxn, off, &ent);
    if n != DIRENTSZ {
        return false;
    }
    let dc = dip.dcache.as_mut().unwrap();
    dc.lastoff = off;
    if !dc.del(name) {
        panic!("rem_name: dcache out of sync");
    }
    true
}

/// Whether the directory holds only "." and "..".
pub fn is_dir_empty(dip: &Inode, atxn: &mut AllocTxn) -> bool {
    let mut off = 2 * DIRENTSZ;
    while off < dip.size {
        match read_slot(dip, atxn, off) {
            Some(de) => {
                if de.inum != NULLINUM {
                    return false;
                }
            }
            None => break,
        }
        off += DIRENTSZ;
    }
    true
}

/// Seed a fresh directory with "." and its parent.
pub fn init_dir(dip: &mut Inode, atxn: &mut AllocTxn, parent: Inum) -> bool {
    let self_inum = dip.inum;
    if !add_name(dip, atxn, self_inum, ".") {
        return false;
    }
    add_name(dip, atxn, parent, "..")
}

/// Seed the root directory, which is its own parent.
pub fn mk_root_dir(dip: &mut Inode, atxn: &mut AllocTxn) -> bool {
    let self_inum = dip.inum;
    init_dir(dip, atxn, self_inum)
}

/// Iterate live entries for READDIRPLUS, invoking `f` with each
/// child's attributes, name, inum and slot offset (the cookie). A
/// nonzero `start` is the cookie of the last returned entry, so
/// iteration resumes one slot past it. Returns `eof = false` the
/// moment the directory bytes reach `dircount` or the full reply
/// estimate reaches `maxcount`.
///
/// Runs in two passes so that directory and child locks are never
/// held together: the first collects entries under the directory
/// lock, then the directory is released (and stays released on
/// return) and each child is looked up with at most one lock held at
/// a time, in ascending inum order. A child unlinked between the
/// passes is reported with `None` attributes. The transaction must
/// own no inode other than the directory.
pub fn apply<F>(
    op: &mut FsTxn,
    dinum: Inum,
    start: u64,
    dircount: u64,
    maxcount: u64,
    mut f: F,
) -> bool
where
    F: FnMut(Option<&Inode>, &str, Inum, u64),
{
    let mut ents: Vec<(Inum, String, u64)> = Vec::new();
    let mut eof = true;
    {
        let (dip, atxn) = op.ip_atxn(dinum);
        let mut off = if start != 0 { start + DIRENTSZ } else { 0 };
        let mut n = READDIR_BASE;
        let mut dirbytes = 0u64;
        while off < dip.size {
            let de = match read_slot(dip, atxn, off) {
                Some(de) => de,
                None => break,
            };
            if de.inum == NULLINUM {
                off += DIRENTSZ;
                continue;
            }
            dirbytes += dir_entry_size(&de.name);
            n += ENTRYPLUS3_BAGGAGE + de.name.len() as u64 + pad4(de.name.len());
            ents.push((de.inum, de.name, off));
            off += DIRENTSZ;
            if dirbytes >= dircount || n >= maxcount {
                eof = false;
                break;
            }
        }
    }
    op.release_inode(dinum);

    let mut inums: Vec<Inum> = ents.iter().map(|e| e.0).collect();
    inums.sort_unstable();
    inums.dedup();
    let mut snaps: HashMap<Inum, Inode> = HashMap::new();
    for &inum in &inums {
        let own = op.own_inum(inum);
        if !own && op.get_inode_inum(inum).is_none() {
            // unlinked between the passes; its entry carries no
            // attributes
            continue;
        }
        snaps.insert(inum, op.ip(inum).snapshot());
        if !own {
            op.release_inode(inum);
        }
    }
    for (inum, name, off) in &ents {
        f(snaps.get(inum), name, *inum, *off);
    }
    eof
}

/// READDIR variant: enumerate entries without inode lookups, bounded
/// by the single reply-size counter.
pub fn apply_ents<F>(dip: &Inode, atxn: &mut AllocTxn, start: u64, count: u64, mut f: F) -> bool
where
    F: FnMut(&str, Inum, u64),
{
    let mut eof = true;
    let mut off = if start != 0 { start + DIRENTSZ } else { 0 };
    let mut n = READDIR_BASE;
    while off < dip.size {
        let de = match read_slot(dip, atxn, off) {
            Some(de) => de,
            None => break,
        };
        if de.inum == NULLINUM {
            off += DIRENTSZ;
            continue;
        }
        f(&de.name, de.inum, off);
        off += DIRENTSZ;
        n += dir_entry_size(&de.name);
        if n >= count {
            eof = false;
            break;
        }
    }
    eof
}
