//! # TcpConnector
//!
//! Asynchronous outbound connects. Each request gets its own non-blocking
//! socket, registered for writability; the writable edge resolves the
//! connect and `SO_ERROR` decides between a channel and an error.
//!
//! ```text
//!   connect ─► socket/connect(EINPROGRESS) ─► epoll.add ─► pending[fd] ─► kick
//!   kernel ─► on_event ─► pending.remove(fd) ─► SO_ERROR ─► handler
//!   stop ─► epoll.remove(each) ─► barrier ─► close ─► handler(Aborted) each ─► stop handler
//! ```

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use bblocks_core::{
    invariant, kdebug, ktrace, kwarn, AsyncProcessor, Completion, Error, Lifecycle, Pending,
    Result, SpinLock, StopHandler,
};

use crate::address::SocketAddress;
use crate::channel::TcpChannel;
use crate::epoll::{EpollShared, FdHandler, EV_ERR, EV_ET, EV_HUP, EV_OUT};
use crate::sys;
use crate::transport::Connector;

type ConnectPending = Pending<Result<Arc<TcpChannel>>>;

struct ConnectorState {
    lifecycle: Lifecycle,
    pending: HashMap<RawFd, ConnectPending>,
    stop: Option<Pending<()>>,
}

pub struct TcpConnector {
    fqn: String,
    epoll: Arc<EpollShared>,
    this: Weak<TcpConnector>,
    state: SpinLock<ConnectorState>,
}

impl TcpConnector {
    pub fn new(epoll: Arc<EpollShared>) -> Arc<TcpConnector> {
        Self::with_name(epoll, "/tcp/connector")
    }

    pub fn with_name(epoll: Arc<EpollShared>, fqn: &str) -> Arc<TcpConnector> {
        Arc::new_cyclic(|this| TcpConnector {
            fqn: fqn.to_string(),
            epoll,
            this: this.clone(),
            state: SpinLock::new(ConnectorState {
                lifecycle: Lifecycle::Running,
                pending: HashMap::new(),
                stop: None,
            }),
        })
    }

    /// Outstanding connect attempts.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn open_socket(addr: &SocketAddress) -> Result<RawFd> {
        let fd = sys::tcp_socket()?;
        let started = if addr.has_local_binding() {
            sys::setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
                .and_then(|_| sys::bind(fd, &addr.local()))
                .and_then(|_| sys::connect(fd, &addr.remote()))
        } else {
            sys::connect(fd, &addr.remote())
        };
        match started {
            // immediate completion still resolves through the writable edge
            Ok(_) => Ok(fd),
            Err(e) => {
                sys::close(fd);
                Err(e)
            }
        }
    }

    /// Outcome of a connect whose socket reported writable.
    fn resolve(fd: RawFd) -> Option<Result<()>> {
        match sys::socket_error(fd) {
            Ok(0) => {}
            Ok(err) => return Some(Err(Error::Os(err))),
            Err(e) => return Some(Err(e)),
        }
        // A stray edge can arrive before the handshake finishes
        match sys::peer_addr(fd) {
            Ok(_) => Some(Ok(())),
            Err(Error::Os(e)) if e == libc::ENOTCONN => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Reactor thread only.
    fn connect_done(&self, fd: RawFd) {
        {
            // the descriptor is ours only while an attempt holds it
            let st = self.state.lock();
            if !st.lifecycle.is_running() || !st.pending.contains_key(&fd) {
                return;
            }
        }
        let outcome = match Self::resolve(fd) {
            Some(r) => r,
            None => {
                ktrace!("{}: fd {} still connecting", self.fqn, fd);
                return;
            }
        };

        let h = {
            let mut st = self.state.lock();
            if !st.lifecycle.is_running() {
                // stop owns the remaining attempts
                return;
            }
            match st.pending.remove(&fd) {
                Some(h) => h,
                None => return,
            }
        };

        if let Err(e) = self.epoll.remove(fd) {
            kwarn!("{}: deregister fd {} failed: {}", self.fqn, fd, e);
        }
        let res = match outcome {
            Ok(()) => TcpChannel::open(format!("{}/ch/{}", self.fqn, fd), fd, Arc::clone(&self.epoll)),
            Err(e) => {
                sys::close(fd);
                Err(e)
            }
        };
        kdebug!("{}: connect fd {} -> {}", self.fqn, fd, if res.is_ok() { "ok" } else { "failed" });
        h.complete(res);
    }

    fn barrier_done(&self) {
        let (pending, stop) = {
            let mut st = self.state.lock();
            st.lifecycle.finish_stop();
            (std::mem::take(&mut st.pending), st.stop.take())
        };
        for (fd, h) in pending {
            sys::close(fd);
            h.complete(Err(Error::Aborted));
        }
        kdebug!("{}: stopped", self.fqn);
        if let Some(s) = stop {
            s.complete(());
        }
    }
}

impl FdHandler for TcpConnector {
    fn on_event(&self, fd: RawFd, events: u32) {
        if events & (EV_OUT | EV_ERR | EV_HUP) != 0 {
            self.connect_done(fd);
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, addr: &SocketAddress, done: Completion<Result<Arc<TcpChannel>>>) -> Result<()> {
        self.state.lock().lifecycle.check_running()?;

        let fd = Self::open_socket(addr)?;
        let weak: Weak<dyn FdHandler> = self.this.clone() as Weak<dyn FdHandler>;
        if let Err(e) = self.epoll.add(fd, EV_OUT | EV_ET, weak.clone()) {
            sys::close(fd);
            return Err(e);
        }
        {
            let mut st = self.state.lock();
            if let Err(e) = st.lifecycle.check_running() {
                drop(st);
                let _ = self.epoll.remove(fd);
                sys::close(fd);
                return Err(e);
            }
            st.pending.insert(fd, done.accept());
        }
        // an edge that raced the insert found nothing to resolve
        self.epoll.kick(weak, fd, EV_OUT);
        Ok(())
    }
}

impl AsyncProcessor for TcpConnector {
    fn fqn(&self) -> String {
        self.fqn.clone()
    }

    fn stop(&self, done: StopHandler) -> Result<()> {
        let this = self.this.upgrade().ok_or(Error::Stopped)?;
        let fds: Vec<RawFd> = {
            let mut st = self.state.lock();
            st.lifecycle.begin_stop()?;
            st.stop = Some(done.accept());
            st.pending.keys().copied().collect()
        };
        for fd in fds {
            if let Err(e) = self.epoll.remove(fd) {
                kwarn!("{}: deregister fd {} failed: {}", self.fqn, fd, e);
            }
        }
        let barrier_this = Arc::clone(&this);
        if self.epoll.barrier(move || barrier_this.barrier_done()).is_err() {
            this.barrier_done();
        }
        Ok(())
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        invariant!(
            st.pending.is_empty(),
            "{}: dropped with {} connects pending",
            self.fqn,
            st.pending.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpollConfig;
    use crate::epoll::Epoll;
    use crate::transport::UnicastChannel;
    use bblocks_core::IoBuffer;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::time::Duration;

    const T: Duration = Duration::from_secs(5);

    fn stop<P: AsyncProcessor + ?Sized>(p: &P) {
        let (done, rx) = Completion::<()>::channel();
        p.stop(done).unwrap();
        rx.recv_timeout(T).unwrap();
    }

    fn v4(l: &TcpListener) -> SocketAddrV4 {
        match l.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_connect_and_exchange() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = TcpConnector::new(epoll.shared());

        let (done, rx) = Completion::channel();
        connector.connect(&SocketAddress::new(v4(&listener)), done).unwrap();
        let ch = rx.recv_timeout(T).unwrap().unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        assert_eq!(connector.pending(), 0);

        let (wd, wrx) = Completion::channel();
        ch.write(IoBuffer::from_slice(b"ping"), wd).unwrap();
        assert_eq!(wrx.recv_timeout(T).unwrap(), Ok(4));
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        peer.write_all(b"pong").unwrap();
        let buf = IoBuffer::alloc(4);
        let (rd, rrx) = Completion::channel();
        ch.read(buf.clone(), rd).unwrap();
        assert_eq!(rrx.recv_timeout(T).unwrap(), Ok(4));
        assert_eq!(buf.to_vec(), b"pong");

        stop(&*ch);
        stop(&*connector);
    }

    #[test]
    fn test_connect_refused_reports_error() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        // grab a free port, then close it
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            v4(&l).port()
        };
        let connector = TcpConnector::new(epoll.shared());
        let addr = SocketAddress::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let (done, rx) = Completion::channel();
        match connector.connect(&addr, done) {
            Ok(()) => {
                let res = rx.recv_timeout(T).unwrap();
                assert_eq!(res.err(), Some(Error::Os(libc::ECONNREFUSED)));
            }
            // loopback may refuse synchronously
            Err(e) => assert_eq!(e, Error::Os(libc::ECONNREFUSED)),
        }
        assert_eq!(connector.pending(), 0);
        stop(&*connector);
    }

    #[test]
    fn test_connect_after_reactor_shutdown_fails_fast() {
        let mut epoll = Epoll::start(EpollConfig::new()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = TcpConnector::new(epoll.shared());
        epoll.shutdown();

        let (done, rx) = Completion::channel();
        let res = connector.connect(&SocketAddress::new(v4(&listener)), done);
        assert_eq!(res.err(), Some(Error::Stopped));
        // rejected, so the handler was dropped unrun
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(connector.pending(), 0);
        assert_eq!(epoll.shared().registered(), 0);
    }

    #[test]
    fn test_stop_aborts_outstanding_connects() {
        let epoll = Epoll::start(EpollConfig::new()).unwrap();
        let connector = TcpConnector::new(epoll.shared());
        // TEST-NET-1 is unroutable, the handshake never finishes
        let addr = SocketAddress::new(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9));

        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (done, rx) = Completion::channel();
            if connector.connect(&addr, done).is_ok() {
                rxs.push(rx);
            }
        }

        stop(&*connector);
        for rx in rxs {
            // exactly one terminal result per accepted connect
            let first = rx.recv_timeout(T).unwrap();
            assert!(first.is_err());
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
        }
        assert_eq!(connector.pending(), 0);

        let (done, _rx) = Completion::channel();
        assert_eq!(connector.connect(&addr, done).err(), Some(Error::Stopped));
    }
}
