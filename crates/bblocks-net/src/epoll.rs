//! # Epoll reactor
//!
//! One dedicated thread owns `epoll_wait`. Each loop iteration:
//!
//! 1. Dispatches kernel readiness events to registered handlers
//! 2. Dispatches kicks (synthetic events queued by other threads)
//! 3. Runs barriers queued before the iteration's wakeup
//!
//! Registrations hold a weak reference to the handler; the reactor never
//! keeps a component alive. A barrier queued after `remove(fd)` runs only
//! once every event fetched for that fd has been dispatched, which is what
//! makes it safe for a component to close its descriptor and fail its
//! pending operations from inside the barrier.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use bblocks_core::{kdebug, kerror, kinfo, ktrace, Error, Result, SpinLock};
use bblocks_runtime::{EventFd, Thread, ThreadRole};

use crate::config::EpollConfig;
use crate::sys::{self, cvt};

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;

/// Token used for the reactor's own wakeup descriptor.
const WAKE_TOKEN: u64 = u64::MAX;

/// Receiver of readiness events. Invoked on the reactor thread only.
pub trait FdHandler: Send + Sync {
    fn on_event(&self, fd: RawFd, events: u32);
}

type Barrier = Box<dyn FnOnce() + Send + 'static>;

struct Kick {
    handler: Weak<dyn FdHandler>,
    fd: RawFd,
    events: u32,
}

/// State shared between the reactor thread and components.
pub struct EpollShared {
    epfd: RawFd,
    wake: EventFd,
    registry: SpinLock<HashMap<RawFd, Weak<dyn FdHandler>>>,
    kicks: SpinLock<Vec<Kick>>,
    barriers: SpinLock<Vec<Barrier>>,
    shutdown: AtomicBool,
    reactor: OnceLock<ThreadId>,
    config: EpollConfig,
}

impl EpollShared {
    fn new(config: EpollConfig) -> Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let wake = match EventFd::create() {
            Ok(w) => w,
            Err(e) => {
                sys::close(epfd);
                return Err(e);
            }
        };
        let shared = Self {
            epfd,
            wake,
            registry: SpinLock::new(HashMap::new()),
            kicks: SpinLock::new(Vec::new()),
            barriers: SpinLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            reactor: OnceLock::new(),
            config,
        };
        shared.ctl(libc::EPOLL_CTL_ADD, shared.wake.fd(), EV_IN, WAKE_TOKEN)?;
        Ok(shared)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }

    /// Register `fd` for `events`, dispatching to `handler`.
    pub fn add(&self, fd: RawFd, events: u32, handler: Weak<dyn FdHandler>) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        if fd < 0 {
            return Err(Error::InvalidArgument("negative descriptor"));
        }
        self.registry.lock().insert(fd, handler);
        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, events, fd as u64) {
            self.registry.lock().remove(&fd);
            return Err(e);
        }
        ktrace!("/epoll: add fd {} events {:#x}", fd, events);
        Ok(())
    }

    /// Change the event mask of a registered descriptor.
    pub fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, fd as u64)
    }

    /// Deregister `fd`. No event fetched after this call reaches the old
    /// handler.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.registry.lock().remove(&fd);
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        ktrace!("/epoll: remove fd {}", fd);
        Ok(())
    }

    /// Deliver `events` to `handler` on the reactor thread.
    pub fn kick(&self, handler: Weak<dyn FdHandler>, fd: RawFd, events: u32) {
        self.kicks.lock().push(Kick { handler, fd, events });
        self.wakeup();
    }

    /// Run `f` on the reactor thread after every event and kick already
    /// fetched or queued has been dispatched.
    pub fn barrier(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        {
            let mut q = self.barriers.lock();
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Stopped);
            }
            q.push(Box::new(f));
        }
        self.wakeup();
        Ok(())
    }

    /// Whether the caller is this reactor's thread.
    pub fn is_reactor_thread(&self) -> bool {
        self.reactor.get() == Some(&std::thread::current().id())
    }

    /// Registered descriptor count (excluding the wakeup fd).
    pub fn registered(&self) -> usize {
        self.registry.lock().len()
    }

    fn wakeup(&self) {
        if let Err(e) = self.wake.notify() {
            kerror!("/epoll: wakeup failed: {}", e);
        }
    }

    fn dispatch(&self, fd: RawFd, events: u32) {
        let handler = self.registry.lock().get(&fd).and_then(Weak::upgrade);
        match handler {
            Some(h) => h.on_event(fd, events),
            None => ktrace!("/epoll: stale event fd {} events {:#x}", fd, events),
        }
    }

    fn run_kicks_and_barriers(&self) {
        let kicks = std::mem::take(&mut *self.kicks.lock());
        for k in kicks {
            if let Some(h) = k.handler.upgrade() {
                h.on_event(k.fd, k.events);
            }
        }

        let barriers = std::mem::take(&mut *self.barriers.lock());
        for b in barriers {
            b();
        }
    }

    fn reactor_loop(&self) {
        let _ = self.reactor.set(std::thread::current().id());
        let max = self.config.max_events;
        let timeout = self.config.timeout.as_millis() as libc::c_int;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max];
        kinfo!("/epoll: reactor started max_events:{} timeout:{}ms", max, timeout);

        loop {
            let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), max as libc::c_int, timeout) };
            if n < 0 {
                match Error::last_os() {
                    Error::Os(e) if e == libc::EINTR => continue,
                    err => {
                        kerror!("/epoll: epoll_wait failed: {}", err);
                        break;
                    }
                }
            }

            for ev in &events[..n as usize] {
                let (token, mask) = (ev.u64, ev.events);
                if token == WAKE_TOKEN {
                    self.wake.drain();
                    continue;
                }
                self.dispatch(token as RawFd, mask);
            }

            self.run_kicks_and_barriers();

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }

        // Barriers queued before shutdown still run; later ones are refused
        self.run_kicks_and_barriers();
        kdebug!("/epoll: reactor exit");
    }
}

impl Drop for EpollShared {
    fn drop(&mut self) {
        sys::close(self.epfd);
    }
}

/// Owner of the reactor thread. Components hold `Arc<EpollShared>`.
pub struct Epoll {
    shared: Arc<EpollShared>,
    thread: Option<Thread>,
}

impl Epoll {
    /// Create the epoll instance and start the reactor thread.
    pub fn start(config: EpollConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(EpollShared::new(config)?);
        let shared_clone = Arc::clone(&shared);
        let thread = Thread::spawn("bb-epoll", ThreadRole::Reactor, move || {
            shared_clone.reactor_loop();
        })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> Arc<EpollShared> {
        Arc::clone(&self.shared)
    }

    /// Stop the reactor thread. Components must have been stopped first.
    pub fn shutdown(&mut self) {
        {
            let _q = self.shared.barriers.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.wakeup();
        if let Some(t) = self.thread.take() {
            t.join();
        }
        let leaked = self.shared.registered();
        if leaked > 0 {
            kerror!("/epoll: shutdown with {} descriptors still registered", leaked);
        }
    }
}

impl std::ops::Deref for Epoll {
    type Target = EpollShared;

    fn deref(&self) -> &EpollShared {
        &self.shared
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        tx: SpinLock<mpsc::Sender<(RawFd, u32)>>,
        hits: AtomicU32,
    }

    impl FdHandler for Recorder {
        fn on_event(&self, fd: RawFd, events: u32) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.lock().send((fd, events));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<(RawFd, u32)>) {
        let (tx, rx) = mpsc::channel();
        let r = Arc::new(Recorder {
            tx: SpinLock::new(tx),
            hits: AtomicU32::new(0),
        });
        (r, rx)
    }

    #[test]
    fn test_readiness_dispatch() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        let efd = EventFd::create().unwrap();
        let (rec, rx) = recorder();
        let weak: Weak<dyn FdHandler> = Arc::downgrade(&rec) as Weak<dyn FdHandler>;

        epoll.add(efd.fd(), EV_IN | EV_ET, weak).unwrap();
        efd.notify().unwrap();

        let (fd, ev) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fd, efd.fd());
        assert!(ev & EV_IN != 0);

        epoll.remove(efd.fd()).unwrap();
        assert_eq!(epoll.registered(), 0);
    }

    #[test]
    fn test_kick_then_barrier_order() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        let (rec, rx) = recorder();
        let weak: Weak<dyn FdHandler> = Arc::downgrade(&rec) as Weak<dyn FdHandler>;

        let (btx, brx) = mpsc::channel();
        let rec2 = Arc::clone(&rec);
        epoll.kick(weak, 42, EV_OUT);
        let shared = epoll.shared();
        epoll
            .barrier(move || {
                btx.send((rec2.hits.load(Ordering::SeqCst), shared.is_reactor_thread()))
                    .unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (42, EV_OUT));
        let (hits, on_reactor) = brx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hits, 1);
        assert!(on_reactor);
        assert!(!epoll.is_reactor_thread());
    }

    #[test]
    fn test_dead_handler_is_skipped() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        let (rec, _rx) = recorder();
        let weak: Weak<dyn FdHandler> = Arc::downgrade(&rec) as Weak<dyn FdHandler>;
        drop(rec);

        epoll.kick(weak, 7, EV_IN);
        let (tx, rx) = mpsc::channel();
        epoll.barrier(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_barrier_refused_after_shutdown() {
        let mut epoll = Epoll::start(EpollConfig::new()).unwrap();
        let shared = epoll.shared();
        epoll.shutdown();
        assert_eq!(shared.barrier(|| {}), Err(Error::Stopped));
    }
}
