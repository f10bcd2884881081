//! File handles: 16 bytes, inode number then generation, both
//! little-endian.

use crate::marshal::{Dec, Enc};
use crate::nfstypes::NfsFh3;
use crate::param::{Inum, NULLINUM, ROOTINUM};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fh {
    pub ino: Inum,
    pub gen: u64,
}

impl Fh {
    /// Decode an NFS handle; malformed handles map to the null inode,
    /// which no lookup will accept.
    pub fn from_nfs(fh3: &NfsFh3) -> Fh {
        if fh3.data.len() != 16 {
            return Fh {
                ino: NULLINUM,
                gen: 0,
            };
        }
        let mut dec = Dec::new(&fh3.data);
        Fh {
            ino: dec.get_int(),
            gen: dec.get_int(),
        }
    }

    pub fn to_nfs(self) -> NfsFh3 {
        let mut enc = Enc::new(16);
        enc.put_int(self.ino);
        enc.put_int(self.gen);
        NfsFh3 { data: enc.finish() }
    }
}

/// Handle of the root directory.
pub fn mk_root_fh3() -> NfsFh3 {
    Fh {
        ino: ROOTINUM,
        gen: 1,
    }
    .to_nfs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let fh = Fh { ino: 17, gen: 5 };
        let fh3 = fh.to_nfs();
        assert_eq!(fh3.data.len(), 16);
        assert_eq!(Fh::from_nfs(&fh3), fh);
    }

    #[test]
    fn equality_is_bytewise() {
        let a = Fh { ino: 3, gen: 1 }.to_nfs();
        let b = Fh { ino: 3, gen: 1 }.to_nfs();
        let c = Fh { ino: 3, gen: 2 }.to_nfs();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn malformed_handle_is_null() {
        let fh = Fh::from_nfs(&NfsFh3 { data: vec![1, 2, 3] });
        assert_eq!(fh.ino, NULLINUM);
    }

    #[test]
    fn root_handle() {
        let fh = Fh::from_nfs(&mk_root_fh3());
        assert_eq!(fh.ino, ROOTINUM);
        assert_eq!(fh.gen, 1);
    }
}
