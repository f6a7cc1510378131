//! # TcpServer
//!
//! Asynchronous listener. `accept` binds, listens and registers the
//! listening socket; every readable edge drains the whole backlog and
//! invokes the accept handler once per connection with a fresh channel.
//!
//! ```text
//!   accept ─► bind/listen ─► epoll.add ─► kernel
//!   kernel ─► on_event ─► accept4 until EAGAIN ─► handler(Ok(channel)) × n
//!   stop ─► epoll.remove ─► barrier ─► close ─► handler(Err(Aborted)) ─► stop handler
//! ```

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bblocks_core::constants::INVALID_FD;
use bblocks_core::{
    kdebug, kerror, kinfo, kwarn, AsyncProcessor, Error, Lifecycle, Pending, Result, SpinLock,
    StopHandler,
};

use crate::address::SocketAddress;
use crate::channel::TcpChannel;
use crate::epoll::{EpollShared, FdHandler, EV_ET, EV_IN};
use crate::sys;
use crate::transport::{AcceptHandler, Acceptor};

const MAX_BACKLOG: usize = 1024;

struct ServerState {
    lifecycle: Lifecycle,
    fd: RawFd,
    handler: Option<AcceptHandler>,
    stop: Option<Pending<()>>,
}

pub struct TcpServer {
    fqn: String,
    epoll: Arc<EpollShared>,
    this: Weak<TcpServer>,
    state: SpinLock<ServerState>,
    accepted: AtomicU64,
}

impl TcpServer {
    pub fn new(epoll: Arc<EpollShared>) -> Arc<TcpServer> {
        Arc::new_cyclic(|this: &Weak<TcpServer>| TcpServer {
            fqn: format!("/tcpserver/{:p}", this.as_ptr()),
            epoll,
            this: this.clone(),
            state: SpinLock::new(ServerState {
                lifecycle: Lifecycle::Running,
                fd: INVALID_FD,
                handler: None,
                stop: None,
            }),
            accepted: AtomicU64::new(0),
        })
    }

    /// Bound address once listening.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let fd = self.state.lock().fd;
        if fd < 0 {
            return Err(Error::InvalidArgument("not listening"));
        }
        sys::local_addr(fd)
    }

    /// Connections surfaced so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn listen_socket(addr: &SocketAddrV4) -> Result<RawFd> {
        let fd = sys::tcp_socket()?;
        let setup = sys::setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .and_then(|_| sys::bind(fd, addr))
            .and_then(|_| sys::listen(fd, MAX_BACKLOG));
        match setup {
            Ok(()) => Ok(fd),
            Err(e) => {
                sys::close(fd);
                Err(e)
            }
        }
    }

    /// Drain the backlog. Reactor thread only.
    fn accept_all(&self, lfd: RawFd) {
        let handler = {
            let st = self.state.lock();
            if !st.lifecycle.is_running() {
                return;
            }
            match &st.handler {
                Some(h) => Arc::clone(h),
                None => return,
            }
        };

        loop {
            match sys::accept(lfd) {
                Ok(Some(cfd)) => {
                    let fqn = format!("{}/ch/{}", self.fqn, cfd);
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    handler(TcpChannel::open(fqn, cfd, Arc::clone(&self.epoll)));
                }
                Ok(None) => break,
                Err(e) => {
                    // e.g. EMFILE: report and wait for the next edge
                    kerror!("{}: accept failed: {}", self.fqn, e);
                    handler(Err(e));
                    break;
                }
            }
        }
    }

    fn barrier_done(&self) {
        let (fd, handler, stop) = {
            let mut st = self.state.lock();
            st.lifecycle.finish_stop();
            let fd = std::mem::replace(&mut st.fd, INVALID_FD);
            (fd, st.handler.take(), st.stop.take())
        };
        sys::close(fd);
        if let Some(h) = handler {
            h(Err(Error::Aborted));
        }
        kdebug!("{}: stopped after {} connections", self.fqn, self.accepted());
        if let Some(s) = stop {
            s.complete(());
        }
    }
}

impl FdHandler for TcpServer {
    fn on_event(&self, fd: RawFd, _events: u32) {
        self.accept_all(fd);
    }
}

impl Acceptor for TcpServer {
    fn accept(&self, addr: &SocketAddress, handler: AcceptHandler) -> Result<()> {
        {
            let st = self.state.lock();
            st.lifecycle.check_running()?;
            if st.handler.is_some() {
                return Err(Error::Busy);
            }
        }

        let fd = Self::listen_socket(&addr.local())?;
        {
            let mut st = self.state.lock();
            if let Err(e) = st.lifecycle.check_running() {
                drop(st);
                sys::close(fd);
                return Err(e);
            }
            if st.handler.is_some() {
                drop(st);
                sys::close(fd);
                return Err(Error::Busy);
            }
            st.fd = fd;
            st.handler = Some(handler);
        }

        let weak: Weak<dyn FdHandler> = self.this.clone() as Weak<dyn FdHandler>;
        if let Err(e) = self.epoll.add(fd, EV_IN | EV_ET, weak) {
            let mut st = self.state.lock();
            st.fd = INVALID_FD;
            st.handler = None;
            drop(st);
            sys::close(fd);
            return Err(e);
        }
        // connections queued before registration produce no edge
        self.epoll.kick(self.this.clone() as Weak<dyn FdHandler>, fd, EV_IN);

        kinfo!("{}: listening on {}", self.fqn, sys::local_addr(fd).unwrap_or(addr.local()));
        Ok(())
    }
}

impl AsyncProcessor for TcpServer {
    fn fqn(&self) -> String {
        self.fqn.clone()
    }

    fn stop(&self, done: StopHandler) -> Result<()> {
        let this = self.this.upgrade().ok_or(Error::Stopped)?;
        let fd = {
            let mut st = self.state.lock();
            st.lifecycle.begin_stop()?;
            st.stop = Some(done.accept());
            st.fd
        };
        if fd >= 0 {
            if let Err(e) = self.epoll.remove(fd) {
                kwarn!("{}: deregister failed: {}", self.fqn, e);
            }
        }
        let barrier_this = Arc::clone(&this);
        if self.epoll.barrier(move || barrier_this.barrier_done()).is_err() {
            this.barrier_done();
        }
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.lifecycle == Lifecycle::Stopped {
            return;
        }
        kwarn!("{}: dropped without stop", self.fqn);
        if st.fd >= 0 {
            let _ = self.epoll.remove(st.fd);
            sys::close(st.fd);
        }
        if let Some(h) = st.handler.take() {
            h(Err(Error::Aborted));
        }
    }
}
