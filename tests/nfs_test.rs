//! End-to-end scenarios against the in-process server.

use std::sync::Arc;
use std::thread;

use jnfsd::nfs::{parallel, NfsClient};
use jnfsd::nfstypes::{Nfsstat3, StableHow};
use jnfsd::param::{BSIZE, MAXNAMELEN};

const DISKSZ: u64 = 10_000;

#[test]
fn create_three_files_and_list() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    for name in ["a", "b", "c"] {
        assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
    }

    let res = clnt.readdirplus_op(&root, 0, 64, 1 << 20);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert!(!res.eof, "small dircount must stop early");
    assert!(!res.entries.is_empty());
    let cookie = res.entries.last().unwrap().cookie;
    assert_ne!(cookie, 0);

    let res = clnt.readdirplus_op(&root, cookie, 64, 1 << 20);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert!(res.eof, "second call should reach end of directory");

    // a full listing sees ".", "..", and the three files
    let res = clnt.readdirplus_op(&root, 0, 1 << 20, 1 << 20);
    assert!(res.eof);
    let mut names: Vec<_> = res.entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "a", "b", "c"]);
    clnt.shutdown();
}

#[test]
fn degenerate_dircount_returns_at_most_one_entry() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let res = clnt.readdirplus_op(&root, 0, 0, 1 << 20);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert!(!res.eof);
    assert!(res.entries.len() <= 1);
    clnt.shutdown();
}

#[test]
fn trailing_tombstone_still_reports_eof() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    for name in ["a", "b", "c"] {
        assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
    }
    // "c" occupies the last slot; removing it leaves a trailing
    // tombstone
    assert_eq!(clnt.remove_op(&root, "c").status, Nfsstat3::Ok);
    let res = clnt.readdirplus_op(&root, 0, 1 << 20, 1 << 20);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert!(res.eof);
    let mut names: Vec<_> = res.entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "a", "b"]);
    clnt.shutdown();
}

#[test]
fn truncate_triggers_shrinker() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let free_before = clnt.srv.free_block_count();

    let res = clnt.create_op(&root, "big");
    assert_eq!(res.status, Nfsstat3::Ok);
    let fh = res.obj;

    let data = vec![0x7fu8; 4 << 20];
    clnt.write_all(&fh, 0, &data);
    assert!(clnt.srv.free_block_count() < free_before);

    let got = clnt.read_all(&fh, 0, data.len() as u64);
    assert_eq!(got.len(), data.len());
    assert!(got == data);

    assert_eq!(clnt.setattr_size_op(&fh, 0).status, Nfsstat3::Ok);
    clnt.shutdown(); // waits for the shrinker

    let attr = clnt.getattr_op(&fh);
    assert_eq!(attr.status, Nfsstat3::Ok);
    assert_eq!(attr.obj_attributes.unwrap().size, 0);
    assert_eq!(clnt.srv.free_block_count(), free_before);
}

#[test]
fn rename_across_directories() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    assert_eq!(clnt.mkdir_op(&root, "d1").status, Nfsstat3::Ok);
    assert_eq!(clnt.mkdir_op(&root, "d2").status, Nfsstat3::Ok);
    let d1 = clnt.lookup_op(&root, "d1").object;
    let d2 = clnt.lookup_op(&root, "d2").object;

    let res = clnt.create_op(&d1, "x");
    assert_eq!(res.status, Nfsstat3::Ok);
    let xfh = res.obj;

    assert_eq!(clnt.rename_op(&d1, "x", &d2, "y"), Nfsstat3::Ok);

    assert_eq!(clnt.lookup_op(&d1, "x").status, Nfsstat3::Noent);
    let looked = clnt.lookup_op(&d2, "y");
    assert_eq!(looked.status, Nfsstat3::Ok);
    assert_eq!(looked.object, xfh, "rename must preserve the handle");

    // root links: itself, "..", and the two subdirectories
    let attr = clnt.getattr_op(&root).obj_attributes.unwrap();
    assert_eq!(attr.nlink, 4);
    clnt.shutdown();
}

#[test]
fn rename_directory_updates_dotdot() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    assert_eq!(clnt.mkdir_op(&root, "d1").status, Nfsstat3::Ok);
    assert_eq!(clnt.mkdir_op(&root, "d2").status, Nfsstat3::Ok);
    let d1 = clnt.lookup_op(&root, "d1").object;
    let d2 = clnt.lookup_op(&root, "d2").object;
    assert_eq!(clnt.mkdir_op(&d1, "sub").status, Nfsstat3::Ok);
    let sub = clnt.lookup_op(&d1, "sub").object;

    assert_eq!(clnt.rename_op(&d1, "sub", &d2, "sub"), Nfsstat3::Ok);

    let dotdot = clnt.lookup_op(&sub, "..");
    assert_eq!(dotdot.status, Nfsstat3::Ok);
    assert_eq!(dotdot.object, d2);

    let d1_attr = clnt.getattr_op(&d1).obj_attributes.unwrap();
    let d2_attr = clnt.getattr_op(&d2).obj_attributes.unwrap();
    assert_eq!(d1_attr.nlink, 2);
    assert_eq!(d2_attr.nlink, 3);
    clnt.shutdown();
}

#[test]
fn rename_replaces_target_file() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let a = clnt.create_op(&root, "a").obj;
    assert_eq!(clnt.create_op(&root, "b").status, Nfsstat3::Ok);
    clnt.write_all(&a, 0, b"from a");

    assert_eq!(clnt.rename_op(&root, "a", &root, "b"), Nfsstat3::Ok);
    assert_eq!(clnt.lookup_op(&root, "a").status, Nfsstat3::Noent);
    let b = clnt.lookup_op(&root, "b");
    assert_eq!(b.status, Nfsstat3::Ok);
    assert_eq!(b.object, a);
    let res = clnt.read_op(&a, 0, 16);
    assert_eq!(res.data, b"from a");
    clnt.shutdown();
}

#[test]
fn parallel_directory_creation() {
    let n = parallel(8, DISKSZ, |clnt, dirfh| {
        assert_eq!(clnt.create_op(&dirfh, "f0").status, Nfsstat3::Ok);
        assert_eq!(clnt.create_op(&dirfh, "f1").status, Nfsstat3::Ok);
        1
    });
    assert_eq!(n, 8);
}

#[test]
fn parallel_mkdir_accounting() {
    let clnt = Arc::new(NfsClient::new(DISKSZ));
    let free_before = clnt.srv.free_block_count();
    let mut handles = Vec::new();
    for i in 0..8 {
        let clnt = clnt.clone();
        handles.push(thread::spawn(move || {
            let root = clnt.root_fh();
            let res = clnt.mkdir_op(&root, &format!("p{}", i));
            assert_eq!(res.status, Nfsstat3::Ok);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let root = clnt.root_fh();
    let res = clnt.readdirplus_op(&root, 0, 1 << 20, 1 << 20);
    assert!(res.eof);
    let mut names: Vec<_> = res.entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    let mut expect = vec![".".to_string(), "..".to_string()];
    expect.extend((0..8).map(|i| format!("p{}", i)));
    assert_eq!(names, expect);

    // each directory allocated exactly its one data block
    assert_eq!(clnt.srv.free_block_count(), free_before - 8);
    let attr = clnt.getattr_op(&root).obj_attributes.unwrap();
    assert_eq!(attr.nlink, 2 + 8);
    clnt.shutdown();
}

#[test]
fn stale_handle_after_generation_reuse() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let res = clnt.create_op(&root, "f");
    assert_eq!(res.status, Nfsstat3::Ok);
    let old = res.obj;

    assert_eq!(clnt.remove_op(&root, "f").status, Nfsstat3::Ok);
    assert_eq!(clnt.getattr_op(&old).status, Nfsstat3::Stale);

    // wait out the reclaimer so the inum is free on disk; the stale
    // answer must hold whether or not later creates reuse it
    clnt.shutdown();
    for i in 0..64 {
        assert_eq!(
            clnt.create_op(&root, &format!("g{}", i)).status,
            Nfsstat3::Ok
        );
    }
    assert_eq!(clnt.getattr_op(&old).status, Nfsstat3::Stale);
    clnt.shutdown();
}

#[test]
fn remove_then_lookup_is_noent() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    assert_eq!(clnt.create_op(&root, "x").status, Nfsstat3::Ok);
    assert_eq!(clnt.remove_op(&root, "x").status, Nfsstat3::Ok);
    assert_eq!(clnt.lookup_op(&root, "x").status, Nfsstat3::Noent);
    assert_eq!(clnt.remove_op(&root, "x").status, Nfsstat3::Noent);
    clnt.shutdown();
}

#[test]
fn directory_error_statuses() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    assert_eq!(clnt.mkdir_op(&root, "d").status, Nfsstat3::Ok);
    let d = clnt.lookup_op(&root, "d").object;
    assert_eq!(clnt.create_op(&d, "f").status, Nfsstat3::Ok);

    assert_eq!(clnt.mkdir_op(&root, "d").status, Nfsstat3::Exist);
    assert_eq!(clnt.create_op(&root, "d").status, Nfsstat3::Exist);
    assert_eq!(clnt.rmdir_op(&root, "d").status, Nfsstat3::Notempty);
    assert_eq!(clnt.remove_op(&root, "d").status, Nfsstat3::Isdir);
    assert_eq!(clnt.rmdir_op(&d, "f").status, Nfsstat3::Notdir);

    assert_eq!(clnt.remove_op(&d, "f").status, Nfsstat3::Ok);
    assert_eq!(clnt.rmdir_op(&root, "d").status, Nfsstat3::Ok);
    assert_eq!(clnt.lookup_op(&root, "d").status, Nfsstat3::Noent);
    clnt.shutdown();
}

#[test]
fn name_length_boundary() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let too_long = "x".repeat(MAXNAMELEN as usize);
    assert_eq!(
        clnt.create_op(&root, &too_long).status,
        Nfsstat3::Nametoolong
    );
    let just_fits = "x".repeat(MAXNAMELEN as usize - 1);
    assert_eq!(clnt.create_op(&root, &just_fits).status, Nfsstat3::Ok);
    assert_eq!(clnt.lookup_op(&root, &just_fits).status, Nfsstat3::Ok);
    clnt.shutdown();
}

#[test]
fn symlink_roundtrip() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let res = clnt.symlink_op(&root, "ln", "/some/target");
    assert_eq!(res.status, Nfsstat3::Ok);
    let read = clnt.readlink_op(&res.obj);
    assert_eq!(read.status, Nfsstat3::Ok);
    assert_eq!(read.data, "/some/target");
    // reading a symlink as a file is refused
    assert_eq!(clnt.read_op(&res.obj, 0, 8).status, Nfsstat3::Inval);
    clnt.shutdown();
}

#[test]
fn hard_links_share_data() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let f = clnt.create_op(&root, "f").obj;
    clnt.write_all(&f, 0, b"shared");
    assert_eq!(clnt.link_op(&f, &root, "g").status, Nfsstat3::Ok);
    assert_eq!(clnt.getattr_op(&f).obj_attributes.unwrap().nlink, 2);

    assert_eq!(clnt.remove_op(&root, "f").status, Nfsstat3::Ok);
    // the inode is alive through the second name
    let g = clnt.lookup_op(&root, "g");
    assert_eq!(g.status, Nfsstat3::Ok);
    assert_eq!(g.object, f);
    assert_eq!(clnt.read_op(&g.object, 0, 16).data, b"shared");

    assert_eq!(clnt.remove_op(&root, "g").status, Nfsstat3::Ok);
    clnt.shutdown();
    assert_eq!(clnt.getattr_op(&f).status, Nfsstat3::Stale);
}

#[test]
fn stable_writes_survive_crash() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let f = clnt.create_op(&root, "f").obj;
    clnt.write_all(&f, 0, b"durable data");

    clnt.crash();
    let clnt = clnt.restart();
    let f = clnt.lookup_op(&clnt.root_fh(), "f").object;
    let res = clnt.read_op(&f, 0, 32);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert_eq!(res.data, b"durable data");
    clnt.shutdown();
}

#[test]
fn unstable_writes_are_lost_by_crash_until_committed() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let f = clnt.create_op(&root, "f").obj;
    let res = clnt.write_op(&f, 0, b"maybe", StableHow::Unstable);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert_eq!(res.committed, StableHow::Unstable);
    // visible before any flush
    assert_eq!(clnt.read_op(&f, 0, 8).data, b"maybe");

    clnt.crash();
    let clnt = clnt.restart();
    let f = clnt.lookup_op(&clnt.root_fh(), "f").object;
    let attr = clnt.getattr_op(&f).obj_attributes.unwrap();
    assert_eq!(attr.size, 0, "uncommitted write must vanish");

    // the same write followed by COMMIT survives
    let res = clnt.write_op(&f, 0, b"surely", StableHow::Unstable);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert_eq!(clnt.commit_op(&f, 6).status, Nfsstat3::Ok);
    clnt.crash();
    let clnt = clnt.restart();
    let f = clnt.lookup_op(&clnt.root_fh(), "f").object;
    assert_eq!(clnt.read_op(&f, 0, 8).data, b"surely");
    clnt.shutdown();
}

#[test]
fn readdir_plain_enumeration() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    for name in ["u", "v"] {
        assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
    }
    let res = clnt.readdir_op(&root, 0, 1 << 16);
    assert_eq!(res.status, Nfsstat3::Ok);
    assert!(res.eof);
    let mut names: Vec<_> = res.entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec![".", "..", "u", "v"]);

    // resuming from an entry's cookie skips everything up to it
    let second = clnt.readdir_op(&root, 0, 1 << 16).entries[1].cookie;
    let rest = clnt.readdir_op(&root, second, 1 << 16);
    assert_eq!(rest.entries.len(), 2);
    clnt.shutdown();
}

#[test]
fn deleted_slot_is_reused_before_growing() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    for name in ["a", "b", "c"] {
        assert_eq!(clnt.create_op(&root, name).status, Nfsstat3::Ok);
    }
    let size_before = clnt.getattr_op(&root).obj_attributes.unwrap().size;
    assert_eq!(clnt.remove_op(&root, "b").status, Nfsstat3::Ok);
    assert_eq!(clnt.create_op(&root, "d").status, Nfsstat3::Ok);
    let size_after = clnt.getattr_op(&root).obj_attributes.unwrap().size;
    assert_eq!(size_before, size_after, "tombstone should be reused");
    clnt.shutdown();
}

#[test]
fn grow_then_shrink_with_setattr() {
    let clnt = NfsClient::new(DISKSZ);
    let root = clnt.root_fh();
    let f = clnt.create_op(&root, "f").obj;
    clnt.write_all(&f, 0, &vec![9u8; 3 * BSIZE]);

    // growing leaves a hole that reads as zeros
    assert_eq!(
        clnt.setattr_size_op(&f, 5 * BSIZE as u64).status,
        Nfsstat3::Ok
    );
    let attr = clnt.getattr_op(&f).obj_attributes.unwrap();
    assert_eq!(attr.size, 5 * BSIZE as u64);
    let tail = clnt.read_op(&f, 4 * BSIZE as u64, BSIZE as u32);
    assert_eq!(tail.data, vec![0u8; BSIZE]);

    assert_eq!(clnt.setattr_size_op(&f, 10).status, Nfsstat3::Ok);
    clnt.shutdown();
    let attr = clnt.getattr_op(&f).obj_attributes.unwrap();
    assert_eq!(attr.size, 10);
    let res = clnt.read_op(&f, 0, 64);
    assert_eq!(res.data, vec![9u8; 10]);
    assert!(res.eof);
}
