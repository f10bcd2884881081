use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;
use nix::sys::signal::{signal, SigHandler, Signal};

use jnfsd::disk::{Disk, FileDisk};
use jnfsd::nfs::Nfs;
use jnfsd::param::BSIZE;

/// Journaled user-space NFSv3 file server.
#[derive(Parser)]
#[command(name = "jnfsd", version)]
struct Args {
    /// Disk image backing the filesystem.
    #[arg(long)]
    disk: PathBuf,

    /// Size of a newly created disk image, in MiB.
    #[arg(long, default_value_t = 400)]
    size_mb: u64,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: i32) {
    STOP.store(true, Ordering::SeqCst);
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let blocks = args.size_mb * 1024 * 1024 / BSIZE as u64;
    let disk = FileDisk::open(&args.disk, blocks)
        .with_context(|| format!("opening disk image {}", args.disk.display()))?;
    let nfs = Nfs::new(Arc::new(disk) as Arc<dyn Disk>).context("mounting filesystem")?;
    info!("root file handle: {:02x?}", nfs.root_fh().data);

    // SAFETY: the handler only stores to an atomic flag.
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(on_sigint)) }
        .context("installing SIGINT handler")?;
    while !STOP.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    nfs.shutdown();
    Ok(())
}
