//! Thread-pool scheduler
//!
//! A fixed pool of worker threads, each draining its own FIFO queue of
//! deferred callbacks. Callbacks scheduled for the same target are routed
//! to the same worker, so they run in the order they were scheduled.
//!
//! ```text
//!   schedule(&target, op) ──hash(target)──► queue[i] ──► worker i
//!   schedule_fn(f)        ──round robin───► queue[j] ──► worker j
//! ```
//!
//! `schedule` never blocks and never runs the callback inline. Shutdown
//! closes the queues, lets every worker drain what was already accepted,
//! and joins the threads.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bblocks_core::{kdebug, kerror, kinfo, Error, Result, SpinLock};

use crate::config::SchedulerConfig;
use crate::parking::{PlatformParking, WorkerParking};
use crate::thread::{Thread, ThreadRole};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct WorkerSlot {
    queue: SpinLock<VecDeque<Task>>,
    parking: PlatformParking,
}

struct Shared {
    workers: Box<[WorkerSlot]>,
    /// Checked under each queue lock so shutdown can close queues atomically
    accepting: AtomicBool,
    running: AtomicBool,
    next: AtomicUsize,
    executed: AtomicU64,
    park_timeout: Duration,
    signal: Mutex<bool>,
    signal_cv: Condvar,
}

impl Shared {
    fn push(&self, idx: usize, task: Task) -> Result<()> {
        let slot = &self.workers[idx];
        {
            let mut q = slot.queue.lock();
            if !self.accepting.load(Ordering::Acquire) {
                return Err(Error::Stopped);
            }
            q.push_back(task);
        }
        slot.parking.unpark();
        Ok(())
    }

    fn wakeup(&self) {
        let mut flag = match self.signal.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *flag = true;
        self.signal_cv.notify_all();
    }

    fn worker_loop(&self, idx: usize) {
        let slot = &self.workers[idx];
        loop {
            let task = slot.queue.lock().pop_front();
            match task {
                Some(task) => {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        kerror!("/scheduler/worker/{}: callback panicked", idx);
                    }
                    self.executed.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    slot.parking.park(Some(self.park_timeout));
                }
            }
        }
        kdebug!("/scheduler/worker/{}: exit", idx);
    }
}

/// Handle that lets any thread release a caller parked in [`Scheduler::wait`].
#[derive(Clone)]
pub struct Waker {
    shared: Arc<Shared>,
}

impl Waker {
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }
}

/// Fixed pool of workers running scheduled callbacks.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<Thread>>,
    started: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler. Callbacks may be scheduled before `start`; they
    /// run once the workers are up.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let workers = (0..config.num_workers)
            .map(|_| WorkerSlot {
                queue: SpinLock::new(VecDeque::new()),
                parking: PlatformParking::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            shared: Arc::new(Shared {
                workers,
                accepting: AtomicBool::new(true),
                running: AtomicBool::new(true),
                next: AtomicUsize::new(0),
                executed: AtomicU64::new(0),
                park_timeout: config.park_timeout,
                signal: Mutex::new(false),
                signal_cv: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Launch the worker threads.
    pub fn start(&self) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }

        let mut threads = self.lock_threads();
        for idx in 0..self.shared.workers.len() {
            let shared = Arc::clone(&self.shared);
            let t = Thread::spawn(
                format!("bb-worker-{}", idx),
                ThreadRole::Worker(idx),
                move || shared.worker_loop(idx),
            )?;
            threads.push(t);
        }
        kinfo!("/scheduler: started {} workers", threads.len());
        Ok(())
    }

    /// Defer `op(target)` onto the worker that owns `target`.
    ///
    /// Calls for the same target run in scheduling order. Fails with
    /// `Error::Stopped` after shutdown; the callback is then dropped unrun.
    pub fn schedule<T, F>(&self, target: &Arc<T>, op: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) + Send + 'static,
    {
        let idx = self.worker_for(Arc::as_ptr(target) as *const () as usize);
        let target = Arc::clone(target);
        self.shared.push(idx, Box::new(move || op(&target)))
    }

    /// Defer a free-standing callback, distributed round robin.
    pub fn schedule_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.shared.next.fetch_add(1, Ordering::Relaxed) % self.shared.workers.len();
        self.shared.push(idx, Box::new(f))
    }

    /// Block until some thread calls `wakeup`. Consumes the wake signal.
    pub fn wait(&self) {
        let mut flag = match self.shared.signal.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*flag {
            flag = match self.shared.signal_cv.wait(flag) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *flag = false;
    }

    /// Like `wait` with an upper bound. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = match self.shared.signal.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flag = match self.shared.signal_cv.wait_timeout(flag, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *flag = false;
        true
    }

    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// A cloneable handle for calling `wakeup` from callbacks.
    pub fn waker(&self) -> Waker {
        Waker {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop accepting, drain every queue, join the workers. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        // A schedule racing with the flag either pushed already or sees it
        for slot in self.shared.workers.iter() {
            drop(slot.queue.lock());
        }
        self.shared.running.store(false, Ordering::Release);
        for slot in self.shared.workers.iter() {
            slot.parking.unpark();
        }

        let threads = std::mem::take(&mut *self.lock_threads());
        for t in threads {
            t.join();
        }

        // Never started: nothing will run what is still queued
        let mut dropped = 0;
        for slot in self.shared.workers.iter() {
            let mut q = slot.queue.lock();
            dropped += q.len();
            q.clear();
        }
        if dropped > 0 {
            kerror!("/scheduler: {} callbacks dropped at shutdown (never started)", dropped);
        }
        kinfo!("/scheduler: shutdown, {} callbacks executed", self.executed());
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Callbacks run so far.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    fn worker_for(&self, key: usize) -> usize {
        // Drop alignment bits so neighbouring allocations spread out
        let h = (key >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize);
        (h >> 16) % self.shared.workers.len()
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<Thread>> {
        match self.threads.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    const MAX_CALLS: usize = 1000;

    struct Counter {
        calls: AtomicUsize,
        waker: Waker,
    }

    impl Counter {
        fn handle(&self, val: u32) {
            assert_eq!(val, 0xfeaf);
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == MAX_CALLS {
                self.waker.wakeup();
            }
        }
    }

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig::new().num_workers(workers)).unwrap()
    }

    #[test]
    fn test_thousand_messages_one_target() {
        let s = scheduler(4);
        s.start().unwrap();

        let target = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            waker: s.waker(),
        });
        for _ in 0..MAX_CALLS {
            s.schedule(&target, |c| c.handle(0xfeaf)).unwrap();
        }

        assert!(s.wait_timeout(Duration::from_secs(10)));
        assert_eq!(target.calls.load(Ordering::SeqCst), MAX_CALLS);
        s.shutdown();
        assert_eq!(s.executed(), MAX_CALLS as u64);
    }

    #[test]
    fn test_per_target_order() {
        let s = scheduler(4);
        s.start().unwrap();

        let targets: Vec<Arc<StdMutex<Vec<usize>>>> =
            (0..8).map(|_| Arc::new(StdMutex::new(Vec::new()))).collect();
        for i in 0..200 {
            for t in &targets {
                s.schedule(t, move |log| log.lock().unwrap().push(i)).unwrap();
            }
        }
        s.shutdown();

        for t in &targets {
            let log = t.lock().unwrap();
            assert_eq!(*log, (0..200).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_never_runs_inline() {
        let s = scheduler(1);
        let (tx, rx) = std::sync::mpsc::channel();
        s.schedule_fn(move || tx.send(crate::thread::current_worker()).unwrap())
            .unwrap();
        // not started yet, so nothing may have run
        assert!(rx.try_recv().is_err());

        s.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(0));
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let s = scheduler(2);
        s.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let h = hits.clone();
            s.schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        s.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 500);

        assert_eq!(s.schedule_fn(|| {}), Err(Error::Stopped));
        assert!(!s.is_accepting());
        assert_eq!(s.start(), Err(Error::Stopped));
    }

    #[test]
    fn test_double_start_rejected() {
        let s = scheduler(1);
        s.start().unwrap();
        assert_eq!(s.start(), Err(Error::Busy));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let s = scheduler(1);
        assert!(!s.wait_timeout(Duration::from_millis(20)));
        s.wakeup();
        assert!(s.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Scheduler::new(SchedulerConfig::new().num_workers(0)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
