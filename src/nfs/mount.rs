//! Mount-protocol surface. The transport is elsewhere; these are the
//! semantic handlers.

use log::debug;

use super::Nfs;
use crate::fh;
use crate::nfstypes::{Mountres3, Mountstat3, Nfspath3};

impl Nfs {
    pub fn mountproc3_null(&self) {
        debug!("MOUNT null");
    }

    /// Mount the (single) export: every path maps to the root handle.
    pub fn mountproc3_mnt(&self, dirpath: Nfspath3) -> Mountres3 {
        debug!("MOUNT mnt {}", dirpath);
        Mountres3 {
            status: Mountstat3::Ok,
            fhandle: fh::mk_root_fh3(),
        }
    }

    pub fn mountproc3_umnt(&self, dirpath: Nfspath3) {
        debug!("MOUNT umnt {}", dirpath);
    }

    pub fn mountproc3_umntall(&self) {
        debug!("MOUNT umntall");
    }

    pub fn mountproc3_export(&self) -> Vec<Nfspath3> {
        vec!["/".to_string()]
    }
}
