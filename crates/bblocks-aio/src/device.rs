//! # SpinningDevice
//!
//! Sector-addressed policy layer over an `AioProcessor`. Offsets and sizes
//! are in bytes but must be sector multiples, and every request must fit
//! inside `device_size = nsectors * 512`. Both checks fail synchronously.
//!
//! Each accepted request is forwarded with an intermediate handler that
//! records stats, turns a short transfer into `ShortTransfer`, and only
//! then calls the caller's handler.
//!
//! ```text
//!   read/write ──► align/range check ──► barrier.enter ──► aio.read/write
//!   poller ──► stats + short check ──► caller handler ──► barrier.exit
//!   stop ──► barrier.stop ──► (last op exits) ──► close ──► stop handler
//! ```

use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use bblocks_core::constants::SECTOR_SIZE;
use bblocks_core::{
    invariant, is_aligned, kdebug, kinfo, kwarn, AsyncProcessor, Completion, Error, IoBuffer,
    Lifecycle, OpBarrier, Result, SpinLock, StopHandler,
};

use crate::processor::{AioProcessor, IoCompletion};

/// A block device addressed in bytes.
pub trait BlockDevice: AsyncProcessor {
    fn read(&self, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()>;

    fn write(&self, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()>;

    /// Blocking write on the calling thread.
    fn write_sync(&self, buf: &IoBuffer, offset: u64, size: usize) -> Result<usize>;

    /// Capacity in bytes.
    fn device_size(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
}

/// Leaves the op barrier on drop, unwinding included.
struct BarrierExit(Arc<OpBarrier>);

impl Drop for BarrierExit {
    fn drop(&mut self) {
        self.0.exit();
    }
}

impl DeviceStats {
    fn record(&self, write: bool, res: &Result<usize>) {
        match (write, res) {
            (false, Ok(n)) => {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(*n as u64, Ordering::Relaxed);
            }
            (true, Ok(n)) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(*n as u64, Ordering::Relaxed);
            }
            (_, Err(_)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct SpinningDevice {
    fqn: String,
    path: PathBuf,
    fd: RawFd,
    /// Owns `fd`; taken and closed once stop drains
    file: Arc<SpinLock<Option<OwnedFd>>>,
    nsectors: u64,
    aio: Arc<dyn AioProcessor>,
    barrier: Arc<OpBarrier>,
    stats: Arc<DeviceStats>,
}

impl SpinningDevice {
    /// Open `path` read-write for buffered I/O.
    pub fn open(path: impl AsRef<Path>, nsectors: u64, aio: Arc<dyn AioProcessor>) -> Result<Self> {
        Self::open_with(path, nsectors, aio, false)
    }

    /// Open `path`, bypassing the page cache when `direct` is set.
    pub fn open_with(
        path: impl AsRef<Path>,
        nsectors: u64,
        aio: Arc<dyn AioProcessor>,
        direct: bool,
    ) -> Result<Self> {
        if nsectors == 0 {
            return Err(Error::InvalidArgument("device has no sectors"));
        }
        nsectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(Error::InvalidArgument("device size overflows"))?;

        let path = path.as_ref().to_path_buf();
        let mut flags = OFlag::O_RDWR | OFlag::O_CLOEXEC;
        if direct {
            flags |= OFlag::O_DIRECT;
        }
        let fd = open(&path, flags, Mode::empty())?;
        // Safety: `open` just returned this descriptor and nothing else owns it
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let fqn = format!("/dev/spinning/{}", path.display());
        kinfo!(
            "{}: opened fd {}, {} sectors{}",
            fqn,
            fd,
            nsectors,
            if direct { ", direct" } else { "" }
        );
        Ok(Self {
            fqn,
            path,
            fd,
            file: Arc::new(SpinLock::new(Some(owned))),
            nsectors,
            aio,
            barrier: Arc::new(OpBarrier::new()),
            stats: Arc::new(DeviceStats::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nsectors(&self) -> u64 {
        self.nsectors
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Device ops accepted but not yet resolved.
    pub fn inflight(&self) -> usize {
        self.barrier.inflight()
    }

    fn check(&self, buf: &IoBuffer, offset: u64, size: usize) -> Result<()> {
        let sector = SECTOR_SIZE as u64;
        if !is_aligned(offset, sector) || !is_aligned(size as u64, sector) {
            return Err(Error::Misaligned);
        }
        if size == 0 {
            return Err(Error::InvalidArgument("zero-length request"));
        }
        if size > buf.capacity() {
            return Err(Error::InvalidArgument("size exceeds buffer"));
        }
        match offset.checked_add(size as u64) {
            Some(end) if end <= self.device_size() => Ok(()),
            _ => Err(Error::OutOfRange),
        }
    }

    fn submit(&self, write: bool, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()> {
        self.check(&buf, offset, size)?;
        self.barrier.enter()?;

        let stats = Arc::clone(&self.stats);
        let barrier = Arc::clone(&self.barrier);
        let forward: IoCompletion = Completion::new(move |res: Result<usize>| {
            let _exit = BarrierExit(barrier);
            let res = match res {
                Ok(n) if n != size => Err(Error::ShortTransfer {
                    expected: size,
                    actual: n,
                }),
                other => other,
            };
            stats.record(write, &res);
            done.accept().complete(res);
        });

        let started = if write {
            self.aio.write(self.fd, buf, offset, size, forward)
        } else {
            self.aio.read(self.fd, buf, offset, size, forward)
        };
        if let Err(e) = started {
            self.barrier.exit();
            return Err(e);
        }
        Ok(())
    }
}

impl BlockDevice for SpinningDevice {
    fn read(&self, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()> {
        self.submit(false, buf, offset, size, done)
    }

    fn write(&self, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()> {
        self.submit(true, buf, offset, size, done)
    }

    fn write_sync(&self, buf: &IoBuffer, offset: u64, size: usize) -> Result<usize> {
        self.check(buf, offset, size)?;
        self.barrier.enter()?;

        let ret = unsafe {
            libc::pwrite(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                size,
                offset as libc::off_t,
            )
        };
        let res = if ret < 0 {
            Err(Error::last_os())
        } else if ret as usize != size {
            Err(Error::ShortTransfer {
                expected: size,
                actual: ret as usize,
            })
        } else {
            Ok(size)
        };
        self.stats.record(true, &res);
        self.barrier.exit();
        res
    }

    #[inline]
    fn device_size(&self) -> u64 {
        self.nsectors * SECTOR_SIZE as u64
    }
}

impl AsyncProcessor for SpinningDevice {
    fn fqn(&self) -> String {
        self.fqn.clone()
    }

    fn stop(&self, done: StopHandler) -> Result<()> {
        let file = Arc::clone(&self.file);
        let fqn = self.fqn.clone();
        let stats = Arc::clone(&self.stats);
        self.barrier.stop(done.map(move |()| {
            drop(file.lock().take());
            kdebug!(
                "{}: stopped, {} reads {} writes {} errors",
                fqn,
                stats.reads.load(Ordering::Relaxed),
                stats.writes.load(Ordering::Relaxed),
                stats.errors.load(Ordering::Relaxed)
            );
        }))
    }
}

impl Drop for SpinningDevice {
    fn drop(&mut self) {
        let inflight = self.barrier.inflight();
        invariant!(inflight == 0, "{}: dropped with {} ops in flight", self.fqn, inflight);
        if self.barrier.lifecycle() == Lifecycle::Running {
            kwarn!("{}: dropped without stop", self.fqn);
        }
    }
}
