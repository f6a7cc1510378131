//! # LinuxAioProcessor
//!
//! Kernel-queued block I/O over io_uring. The processor owns N rings, each
//! driven by its own poller thread. Submitters never touch a ring: they
//! push an op into the ring's request queue and poke its eventfd, whose
//! read is kept armed inside the ring so an idle poller sleeps in
//! `io_uring_enter` and wakes on either a completion or new work.
//!
//! ```text
//!   read/write ──► validate ──► queue[rr] (ArrayQueue) ──► eventfd
//!                                   │
//!   poller[i]: pop ──► slots[tag] ──► SQE ──► submit_and_wait(1)
//!                                                  │
//!   handler(Ok(n) / Err) ◄── slots.take(tag) ◄── CQE
//! ```
//!
//! Each poller sets up its ring on its own thread. Handlers always run on
//! a poller thread.
//!
//! ## Stop
//!
//! `stop` rejects new requests, then every poller aborts what is still
//! queued, cancels what is in flight and waits for the kernel to hand every
//! op back. The last poller to drain fires the stop handler.

use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};

use bblocks_core::{
    invariant, kdebug, kerror, kinfo, ktrace, kwarn, AsyncProcessor, Completion, Error, IoBuffer,
    Lifecycle, Pending, Result, SpinLock, StopHandler,
};
use bblocks_runtime::{EventFd, Thread, ThreadRole};

use crate::config::AioConfig;

/// Handler for a block transfer: bytes moved or the failure.
pub type IoCompletion = Completion<Result<usize>>;

/// Tag of the eventfd read kept armed in every ring.
const WAKE_TAG: u64 = u64::MAX;
/// Tag of cancel requests issued on stop.
const CANCEL_TAG: u64 = u64::MAX - 1;
/// Submission slots held back for the wake read and stop-time cancels.
const RESERVED: usize = 2;

/// Asynchronous positioned reads and writes on raw descriptors.
pub trait AioProcessor: AsyncProcessor {
    /// Read `size` bytes at byte `offset` into the start of `buf`.
    fn read(&self, fd: RawFd, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()>;

    /// Write the first `size` bytes of `buf` at byte `offset`.
    fn write(&self, fd: RawFd, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Read,
    Write,
}

struct AioOp {
    kind: OpKind,
    fd: RawFd,
    buf: IoBuffer,
    offset: u64,
    size: u32,
    done: Pending<Result<usize>>,
}

impl AioOp {
    fn entry(&self, tag: u64) -> squeue::Entry {
        let fd = types::Fd(self.fd);
        let entry = match self.kind {
            OpKind::Read => opcode::Read::new(fd, self.buf.as_mut_ptr(), self.size)
                .offset(self.offset)
                .build(),
            OpKind::Write => opcode::Write::new(fd, self.buf.as_ptr(), self.size)
                .offset(self.offset)
                .build(),
        };
        entry.user_data(tag)
    }
}

struct RingQueue {
    queue: ArrayQueue<AioOp>,
    wake: EventFd,
}

struct ProcState {
    lifecycle: Lifecycle,
    stop: Option<Pending<()>>,
}

struct Shared {
    fqn: String,
    /// Producers push only while holding this lock
    state: SpinLock<ProcState>,
    stopping: AtomicBool,
    rings: Vec<RingQueue>,
    /// Pollers that have not drained yet
    live: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn begin_stop(&self, done: Option<StopHandler>) -> Result<()> {
        {
            let mut st = self.state.lock();
            st.lifecycle.begin_stop()?;
            st.stop = done.map(Completion::accept);
            self.stopping.store(true, Ordering::SeqCst);
        }
        kdebug!("{}: stopping", self.fqn);
        for r in &self.rings {
            if let Err(e) = r.wake.notify() {
                kerror!("{}: wake failed: {}", self.fqn, e);
            }
        }
        Ok(())
    }

    /// Called once by each poller as it exits.
    fn poller_done(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let stop = {
            let mut st = self.state.lock();
            st.lifecycle.finish_stop();
            st.stop.take()
        };
        kinfo!(
            "{}: stopped, {} submitted, {} completed",
            self.fqn,
            self.submitted.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed)
        );
        if let Some(s) = stop {
            s.complete(());
        }
    }
}

fn fire<T>(fqn: &str, p: Pending<T>, value: T) {
    if catch_unwind(AssertUnwindSafe(move || p.complete(value))).is_err() {
        kerror!("{}: completion handler panicked", fqn);
    }
}

/// One ring and the thread that owns it.
struct Poller {
    fqn: String,
    index: usize,
    ring: IoUring,
    shared: Arc<Shared>,
    /// In-flight ops indexed by their ring tag
    slots: Vec<Option<AioOp>>,
    free: Vec<usize>,
    inflight: usize,
    max_inflight: usize,
    wake_armed: bool,
    cancelled: bool,
    /// Target of the wake read; outlives the ring (field order)
    wake_buf: Box<u64>,
    reaped: Vec<(u64, i32)>,
}

impl Poller {
    fn new(index: usize, ring: IoUring, shared: Arc<Shared>, entries: usize) -> Self {
        let max_inflight = entries - RESERVED;
        Self {
            fqn: format!("{}/poller/{}", shared.fqn, index),
            index,
            ring,
            shared,
            slots: Vec::with_capacity(max_inflight),
            free: Vec::with_capacity(max_inflight),
            inflight: 0,
            max_inflight,
            wake_armed: false,
            cancelled: false,
            wake_buf: Box::new(0),
            reaped: Vec::with_capacity(entries * 2),
        }
    }

    fn run(mut self) {
        kdebug!("{}: polling", self.fqn);
        self.arm_wake();

        loop {
            if self.shared.stopping.load(Ordering::SeqCst) {
                if !self.cancelled {
                    self.abort_queued();
                    self.cancel_inflight();
                    self.cancelled = true;
                }
                if self.inflight == 0 && !self.wake_armed {
                    break;
                }
            } else {
                self.fill();
            }

            if let Err(e) = self.ring.submit_and_wait(1) {
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => {}
                    _ => {
                        let err = Error::from(e);
                        invariant!(false, "{}: ring enter failed: {}", self.fqn, err);
                    }
                }
            }
            self.reap();
        }

        kdebug!("{}: drained", self.fqn);
        let shared = Arc::clone(&self.shared);
        drop(self);
        shared.poller_done();
    }

    /// Push one SQE, flushing the queue to the kernel once if it is full.
    fn push_entry(&mut self, entry: &squeue::Entry) -> bool {
        for _ in 0..2 {
            // Safety: buffers referenced by the entry live in `slots` (or
            // `wake_buf`) until the matching CQE is reaped.
            if unsafe { self.ring.submission().push(entry) }.is_ok() {
                return true;
            }
            if let Err(e) = self.ring.submit() {
                kwarn!("{}: flush failed: {}", self.fqn, e);
            }
        }
        false
    }

    fn arm_wake(&mut self) {
        let fd = self.shared.rings[self.index].wake.fd();
        let ptr = &mut *self.wake_buf as *mut u64 as *mut u8;
        let entry = opcode::Read::new(types::Fd(fd), ptr, 8)
            .offset(u64::MAX)
            .build()
            .user_data(WAKE_TAG);
        self.wake_armed = self.push_entry(&entry);
        invariant!(self.wake_armed, "{}: cannot arm wake read", self.fqn);
    }

    /// Move queued requests into the ring while there is room.
    fn fill(&mut self) {
        let shared = Arc::clone(&self.shared);
        let queue = &shared.rings[self.index].queue;

        while self.inflight < self.max_inflight {
            if self.ring.submission().is_full() {
                break;
            }
            let op = match queue.pop() {
                Some(op) => op,
                None => break,
            };
            let slot = match self.free.pop() {
                Some(s) => s,
                None => {
                    self.slots.push(None);
                    self.slots.len() - 1
                }
            };
            let entry = op.entry(slot as u64);
            // Safety: see push_entry
            if unsafe { self.ring.submission().push(&entry) }.is_err() {
                self.free.push(slot);
                fire(&self.fqn, op.done, Err(Error::QueueFull));
                break;
            }
            ktrace!(
                "{}: {:?} fd {} off {} len {} -> slot {}",
                self.fqn,
                op.kind,
                op.fd,
                op.offset,
                op.size,
                slot
            );
            self.slots[slot] = Some(op);
            self.inflight += 1;
        }
    }

    fn reap(&mut self) {
        let mut reaped = std::mem::take(&mut self.reaped);
        reaped.clear();
        reaped.extend(self.ring.completion().map(|c| (c.user_data(), c.result())));

        for &(tag, res) in &reaped {
            match tag {
                WAKE_TAG => {
                    self.wake_armed = false;
                    if !self.shared.stopping.load(Ordering::SeqCst) {
                        self.arm_wake();
                    }
                }
                CANCEL_TAG => ktrace!("{}: cancel -> {}", self.fqn, res),
                _ => self.complete(tag as usize, res),
            }
        }
        self.reaped = reaped;
    }

    fn complete(&mut self, slot: usize, res: i32) {
        let op = match self.slots.get_mut(slot).and_then(Option::take) {
            Some(op) => op,
            None => {
                kwarn!("{}: completion for empty slot {}", self.fqn, slot);
                return;
            }
        };
        self.free.push(slot);
        self.inflight -= 1;
        self.shared.completed.fetch_add(1, Ordering::Relaxed);

        let result = if res < 0 {
            Err(Error::from_neg(res))
        } else {
            Ok(res as usize)
        };
        fire(&self.fqn, op.done, result);
    }

    fn abort_queued(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut n = 0;
        while let Some(op) = shared.rings[self.index].queue.pop() {
            fire(&self.fqn, op.done, Err(Error::Aborted));
            n += 1;
        }
        if n > 0 {
            kdebug!("{}: aborted {} queued", self.fqn, n);
        }
    }

    fn cancel_inflight(&mut self) {
        let tags: Vec<u64> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as u64)
            .collect();
        for tag in tags {
            let entry = opcode::AsyncCancel::new(tag).build().user_data(CANCEL_TAG);
            if !self.push_entry(&entry) {
                // the op still completes on its own
                kwarn!("{}: no room to cancel slot {}", self.fqn, tag);
            }
        }
    }
}

/// io_uring-backed `AioProcessor`.
pub struct LinuxAioProcessor {
    shared: Arc<Shared>,
    next: AtomicUsize,
    threads: Vec<Thread>,
}

impl LinuxAioProcessor {
    /// Start the pollers, each setting up its own ring.
    ///
    /// Fails if the kernel refuses ring setup.
    pub fn start(config: AioConfig) -> Result<Arc<LinuxAioProcessor>> {
        config.validate()?;

        let mut queues = Vec::with_capacity(config.threads);
        for _ in 0..config.threads {
            queues.push(RingQueue {
                queue: ArrayQueue::new(config.max_events),
                wake: EventFd::blocking()?,
            });
        }

        let shared = Arc::new(Shared {
            fqn: "/aio".to_string(),
            state: SpinLock::new(ProcState {
                lifecycle: Lifecycle::Running,
                stop: None,
            }),
            stopping: AtomicBool::new(false),
            rings: queues,
            live: AtomicUsize::new(config.threads),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let mut proc = LinuxAioProcessor {
            shared: Arc::clone(&shared),
            next: AtomicUsize::new(0),
            threads: Vec::with_capacity(config.threads),
        };

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        for i in 0..config.threads {
            let poller_shared = Arc::clone(&shared);
            let ready = ready_tx.clone();
            let entries = config.ring_entries;
            let spawned = Thread::spawn(format!("bb-aio-{}", i), ThreadRole::AioPoller(i), move || {
                let ring = match IoUring::builder().build(entries) {
                    Ok(ring) => ring,
                    Err(e) => {
                        // never ran, so never counted as draining
                        poller_shared.live.fetch_sub(1, Ordering::AcqRel);
                        let _ = ready.send(Err(Error::from(e)));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));
                Poller::new(i, ring, poller_shared, entries as usize).run();
            });
            match spawned {
                Ok(t) => proc.threads.push(t),
                Err(e) => {
                    kerror!("{}: poller {} spawn failed: {}", shared.fqn, i, e);
                    shared.live.fetch_sub(config.threads - i, Ordering::AcqRel);
                    let _ = shared.begin_stop(None);
                    return Err(e);
                }
            }
        }
        drop(ready_tx);

        let mut failed = None;
        for _ in 0..config.threads {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed.get_or_insert(e);
                }
                Err(_) => {
                    failed.get_or_insert(Error::Aborted);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            kerror!("{}: ring setup failed: {}", shared.fqn, e);
            let _ = shared.begin_stop(None);
            return Err(e);
        }

        kinfo!(
            "{}: {} pollers, {} ring entries, queue depth {}",
            shared.fqn,
            config.threads,
            config.ring_entries,
            config.max_events
        );
        Ok(Arc::new(proc))
    }

    pub fn threads(&self) -> usize {
        self.shared.rings.len()
    }

    /// Requests accepted so far.
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    /// Requests the kernel has handed back.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    fn submit(
        &self,
        kind: OpKind,
        fd: RawFd,
        buf: IoBuffer,
        offset: u64,
        size: usize,
        done: IoCompletion,
    ) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument("bad descriptor"));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("zero-length request"));
        }
        if size > buf.capacity() {
            return Err(Error::InvalidArgument("size exceeds buffer"));
        }
        let size = u32::try_from(size).map_err(|_| Error::InvalidArgument("size exceeds u32"))?;

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.shared.rings.len();
        let ring = &self.shared.rings[idx];
        let rejected = {
            let st = self.shared.state.lock();
            st.lifecycle.check_running()?;
            if ring.queue.is_full() {
                return Err(Error::QueueFull);
            }
            let op = AioOp {
                kind,
                fd,
                buf,
                offset,
                size,
                done: done.accept(),
            };
            // producers are serialized by the lock, so this cannot fail
            ring.queue.push(op).err()
        };
        if let Some(op) = rejected {
            op.done.complete(Err(Error::QueueFull));
            return Ok(());
        }

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = ring.wake.notify() {
            kerror!("{}: wake poller {} failed: {}", self.shared.fqn, idx, e);
        }
        Ok(())
    }
}

impl AioProcessor for LinuxAioProcessor {
    fn read(&self, fd: RawFd, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()> {
        self.submit(OpKind::Read, fd, buf, offset, size, done)
    }

    fn write(&self, fd: RawFd, buf: IoBuffer, offset: u64, size: usize, done: IoCompletion) -> Result<()> {
        self.submit(OpKind::Write, fd, buf, offset, size, done)
    }
}

impl AsyncProcessor for LinuxAioProcessor {
    fn fqn(&self) -> String {
        self.shared.fqn.clone()
    }

    fn stop(&self, done: StopHandler) -> Result<()> {
        self.shared.begin_stop(Some(done))
    }
}

impl Drop for LinuxAioProcessor {
    fn drop(&mut self) {
        let running = self.shared.state.lock().lifecycle.is_running();
        if running {
            kwarn!("{}: dropped without stop", self.shared.fqn);
            let _ = self.shared.begin_stop(None);
        }
        for t in self.threads.drain(..) {
            t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TempFile;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    const T: Duration = Duration::from_secs(10);

    fn processor(config: AioConfig) -> Option<Arc<LinuxAioProcessor>> {
        match LinuxAioProcessor::start(config) {
            Ok(p) => Some(p),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    fn stop(p: &LinuxAioProcessor) {
        let (done, rx) = Completion::<()>::channel();
        p.stop(done).unwrap();
        rx.recv_timeout(T).unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let Some(aio) = processor(AioConfig::new().ring_entries(32)) else {
            return;
        };
        let file = TempFile::new("rw", 0);

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let (wd, wrx) = Completion::channel();
        aio.write(file.fd(), IoBuffer::from_slice(&data), 8192, 4096, wd).unwrap();
        assert_eq!(wrx.recv_timeout(T).unwrap(), Ok(4096));

        let buf = IoBuffer::alloc(4096);
        let (rd, rrx) = Completion::channel();
        aio.read(file.fd(), buf.clone(), 8192, 4096, rd).unwrap();
        assert_eq!(rrx.recv_timeout(T).unwrap(), Ok(4096));
        assert_eq!(buf.to_vec(), data);

        stop(&aio);
        assert_eq!(aio.completed(), 2);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let Some(aio) = processor(AioConfig::new().threads(1).ring_entries(16)) else {
            return;
        };
        let file = TempFile::new("eof", 1000);
        let buf = IoBuffer::alloc(4096);
        let (rd, rrx) = Completion::channel();
        aio.read(file.fd(), buf, 0, 4096, rd).unwrap();
        assert_eq!(rrx.recv_timeout(T).unwrap(), Ok(1000));
        stop(&aio);
    }

    #[test]
    fn test_kernel_error_reaches_handler() {
        let Some(aio) = processor(AioConfig::new().threads(1).ring_entries(16)) else {
            return;
        };
        let file = TempFile::new("ro", 512);
        let ro = std::fs::File::open(file.path()).unwrap();
        let (wd, wrx) = Completion::channel();
        aio.write(ro.as_raw_fd(), IoBuffer::alloc(512), 0, 512, wd).unwrap();
        assert_eq!(wrx.recv_timeout(T).unwrap(), Err(Error::Os(libc::EBADF)));
        stop(&aio);
    }

    #[test]
    fn test_invalid_requests_rejected_synchronously() {
        let Some(aio) = processor(AioConfig::new().threads(1).ring_entries(16)) else {
            return;
        };
        let file = TempFile::new("inval", 0);
        let (tx, rx) = mpsc::channel::<Result<usize>>();
        let handler = |tx: &mpsc::Sender<Result<usize>>| {
            let tx = tx.clone();
            Completion::new(move |r| {
                let _ = tx.send(r);
            })
        };

        assert!(matches!(
            aio.write(-1, IoBuffer::alloc(512), 0, 512, handler(&tx)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            aio.write(file.fd(), IoBuffer::alloc(512), 0, 0, handler(&tx)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            aio.read(file.fd(), IoBuffer::alloc(512), 0, 1024, handler(&tx)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(aio.submitted(), 0);
        stop(&aio);
    }

    #[test]
    fn test_many_ops_each_complete_once() {
        let Some(aio) = processor(AioConfig::new().ring_entries(16).max_events(512)) else {
            return;
        };
        let file = TempFile::new("many", 0);
        let (tx, rx) = mpsc::channel();
        const N: usize = 200;
        for i in 0..N {
            let tx = tx.clone();
            let done = Completion::new(move |r: Result<usize>| {
                let _ = tx.send((i, r));
            });
            let buf = IoBuffer::from_slice(&[i as u8; 512]);
            aio.write(file.fd(), buf, (i * 512) as u64, 512, done).unwrap();
        }

        let mut seen = vec![0u32; N];
        for _ in 0..N {
            let (i, r) = rx.recv_timeout(T).unwrap();
            assert_eq!(r, Ok(512));
            seen[i] += 1;
        }
        assert!(seen.iter().all(|&n| n == 1));
        stop(&aio);
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
        assert_eq!(file.len(), (N * 512) as u64);
    }

    #[test]
    fn test_stop_rejects_new_requests() {
        let Some(aio) = processor(AioConfig::new().threads(2).ring_entries(16)) else {
            return;
        };
        let file = TempFile::new("stopped", 0);
        stop(&aio);

        let (done, rx) = Completion::channel();
        assert_eq!(aio.write(file.fd(), IoBuffer::alloc(512), 0, 512, done), Err(Error::Stopped));
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        let (again, _) = Completion::<()>::channel();
        assert_eq!(aio.stop(again), Err(Error::Stopped));
    }

    #[test]
    fn test_stop_fires_after_outstanding_ops() {
        let Some(aio) = processor(AioConfig::new().threads(1).ring_entries(16).max_events(256)) else {
            return;
        };
        let file = TempFile::new("drain", 0);
        let (tx, rx) = mpsc::channel();
        for i in 0..64usize {
            let tx = tx.clone();
            let done = Completion::new(move |r: Result<usize>| {
                let _ = tx.send(r);
            });
            aio.write(file.fd(), IoBuffer::alloc(4096), (i * 4096) as u64, 4096, done)
                .unwrap();
        }
        let (sd, srx) = Completion::<()>::channel();
        aio.stop(sd).unwrap();
        srx.recv_timeout(T).unwrap();

        // every op resolved before the stop handler, either done or aborted
        let results: Vec<_> = rx.try_iter().collect();
        assert_eq!(results.len(), 64);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(4096) | Err(Error::Aborted))));
    }
}
