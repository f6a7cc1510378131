//! bblocks Disk Benchmark
//!
//! Sequential write then read of a file or block device through
//! `SpinningDevice` and the io_uring AIO processor, keeping `depth`
//! requests in flight. Every block carries its index so the read pass
//! verifies what the write pass stored.
//!
//! Usage:
//!     cargo build --release -p bb-diskbench
//!     ./target/release/bb-diskbench <path> [size_mb] [block_kb] [depth] [--direct]
//!
//! A missing path is created as a regular file of `size_mb`.
//!
//! Environment:
//!     BB_AIO_THREADS=2        poller threads
//!     BB_AIO_RING_ENTRIES=256 ring size per poller

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use bblocks::{
    kerror, roundup, AsyncProcessor, BlockDevice, Completion, Error, IoBuffer, Result, Runtime,
    RuntimeConfig, SpinningDevice, SECTOR_SIZE,
};

struct Args {
    path: PathBuf,
    size: u64,
    block: usize,
    depth: usize,
    direct: bool,
}

fn usage() -> ! {
    eprintln!("usage: bb-diskbench <path> [size_mb] [block_kb] [depth] [--direct]");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut direct = false;
    let mut pos = Vec::new();
    for a in std::env::args().skip(1) {
        if a == "--direct" {
            direct = true;
        } else {
            pos.push(a);
        }
    }
    let path = match pos.first() {
        Some(p) => PathBuf::from(p),
        None => usage(),
    };
    let size_mb: u64 = pos.get(1).and_then(|s| s.parse().ok()).unwrap_or(64);
    let block_kb: usize = pos.get(2).and_then(|s| s.parse().ok()).unwrap_or(64);
    let depth: usize = pos.get(3).and_then(|s| s.parse().ok()).unwrap_or(32);
    if size_mb == 0 || block_kb == 0 || depth == 0 {
        usage();
    }
    Args {
        path,
        size: size_mb << 20,
        block: roundup(block_kb << 10, SECTOR_SIZE),
        depth,
        direct,
    }
}

/// One sequential pass over the device.
struct Pass {
    dev: Arc<SpinningDevice>,
    write: bool,
    block: usize,
    nblocks: u64,
    next: AtomicU64,
    done: AtomicU64,
    bad: AtomicU64,
    errors: AtomicU64,
    finished: Mutex<Option<mpsc::Sender<()>>>,
}

impl Pass {
    fn fill(buf: &IoBuffer, index: u64) {
        buf.with_mut(|b| {
            for chunk in b.chunks_mut(8) {
                let bytes = index.to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        });
    }

    fn verify(buf: &IoBuffer, index: u64) -> bool {
        buf.with(|b| b.chunks(8).all(|c| c == &index.to_le_bytes()[..c.len()]))
    }

    /// Issue the next block, if any remain.
    fn issue(self: &Arc<Self>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        if index >= self.nblocks {
            return;
        }
        let buf = IoBuffer::alloc(self.block);
        if self.write {
            Self::fill(&buf, index);
        }
        let offset = index * self.block as u64;
        let this = Arc::clone(self);
        let check = buf.clone();
        let done = Completion::new(move |res: Result<usize>| this.on_done(index, &check, res));

        let started = if self.write {
            self.dev.write(buf, offset, self.block, done)
        } else {
            self.dev.read(buf, offset, self.block, done)
        };
        if let Err(e) = started {
            kerror!("block {}: submit failed: {}", index, e);
            self.errors.fetch_add(1, Ordering::Relaxed);
            self.complete_one();
        }
    }

    fn on_done(self: &Arc<Self>, index: u64, buf: &IoBuffer, res: Result<usize>) {
        match res {
            Ok(_) => {
                if !self.write && !Self::verify(buf, index) {
                    self.bad.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                kerror!("block {}: {}", index, e);
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.complete_one();
        self.issue();
    }

    fn complete_one(&self) {
        if self.done.fetch_add(1, Ordering::AcqRel) + 1 == self.nblocks {
            let tx = self.finished.lock().ok().and_then(|mut f| f.take());
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }
    }
}

fn run_pass(dev: &Arc<SpinningDevice>, args: &Args, write: bool) -> Duration {
    let (tx, rx) = mpsc::channel();
    let pass = Arc::new(Pass {
        dev: Arc::clone(dev),
        write,
        block: args.block,
        nblocks: args.size / args.block as u64,
        next: AtomicU64::new(0),
        done: AtomicU64::new(0),
        bad: AtomicU64::new(0),
        errors: AtomicU64::new(0),
        finished: Mutex::new(Some(tx)),
    });

    let start = Instant::now();
    for _ in 0..args.depth {
        pass.issue();
    }
    if rx.recv().is_err() {
        kerror!("pass ended without completing");
    }
    let elapsed = start.elapsed();

    let bytes = pass.nblocks * args.block as u64;
    eprintln!(
        "{:>5}: {} blocks x {} KB in {:.3}s = {:.1} MB/s, errors={} mismatches={}",
        if write { "write" } else { "read" },
        pass.nblocks,
        args.block >> 10,
        elapsed.as_secs_f64(),
        bytes as f64 / (1 << 20) as f64 / elapsed.as_secs_f64().max(1e-9),
        pass.errors.load(Ordering::Relaxed),
        pass.bad.load(Ordering::Relaxed),
    );
    elapsed
}

fn prepare(args: &Args) -> std::io::Result<()> {
    if args.path.exists() {
        return Ok(());
    }
    let f = OpenOptions::new().write(true).create(true).open(&args.path)?;
    f.set_len(args.size)
}

fn main() {
    bblocks::init_logging();
    let args = parse_args();

    if args.size < args.block as u64 {
        eprintln!("bb-diskbench: size smaller than one block");
        std::process::exit(2);
    }
    if let Err(e) = prepare(&args) {
        eprintln!("bb-diskbench: cannot create {}: {}", args.path.display(), e);
        std::process::exit(1);
    }

    let mut rt = match Runtime::start(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bb-diskbench: runtime start failed: {}", e);
            std::process::exit(1);
        }
    };
    let aio = match rt.aio() {
        Some(aio) => aio,
        None => {
            eprintln!("bb-diskbench: no AIO processor");
            std::process::exit(1);
        }
    };

    let nsectors = args.size / SECTOR_SIZE as u64;
    let dev = match SpinningDevice::open_with(&args.path, nsectors, aio, args.direct) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            eprintln!("bb-diskbench: open {} failed: {}", args.path.display(), e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "bb-diskbench: {} size={} MB block={} KB depth={}{}",
        args.path.display(),
        args.size >> 20,
        args.block >> 10,
        args.depth,
        if args.direct { " direct" } else { "" }
    );

    run_pass(&dev, &args, true);
    run_pass(&dev, &args, false);

    let (done, rx) = Completion::<()>::channel();
    match dev.stop(done) {
        Ok(()) => {
            if rx.recv_timeout(Duration::from_secs(30)).is_err() {
                kerror!("{}: stop timed out", dev.fqn());
            }
        }
        Err(Error::Stopped) => {}
        Err(e) => kerror!("{}: stop failed: {}", dev.fqn(), e),
    }
    drop(dev);
    rt.shutdown();
}
