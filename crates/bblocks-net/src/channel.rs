//! # TcpChannel
//!
//! One established connection: at most one outstanding read (or peek) and
//! a FIFO of writes.
//!
//! ```text
//!   read/peek/write ──enqueue──► state ──kick──► reactor
//!   reactor: on_event ─► recv/send ─► complete (outside the lock)
//!   stop ─► Stopping, epoll.remove ─► barrier ─► close fd,
//!           fail read then writes with Aborted ─► stop handler
//! ```
//!
//! Only the reactor thread removes operations from the state, so a request
//! being serviced is never visible as "absent" to a concurrent `read`.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bblocks_core::{
    kdebug, ktrace, kwarn, AsyncProcessor, Error, IoBuffer, Lifecycle, Pending, Result, SpinLock,
    StopHandler,
};

use crate::epoll::{EpollShared, FdHandler, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_OUT, EV_RDHUP};
use crate::sys;
use crate::transport::{IoCompletion, UnicastChannel};

struct ReadCtx {
    buf: IoBuffer,
    /// bytes already placed in `buf`
    done: usize,
    peek: bool,
    h: Pending<Result<usize>>,
}

struct WriteCtx {
    buf: IoBuffer,
    written: usize,
    h: Pending<Result<usize>>,
}

struct ChannelState {
    lifecycle: Lifecycle,
    read: Option<ReadCtx>,
    writes: VecDeque<WriteCtx>,
    stop: Option<Pending<()>>,
}

/// Per-channel transfer counters
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
}

pub struct TcpChannel {
    fqn: String,
    fd: RawFd,
    epoll: Arc<EpollShared>,
    this: Weak<TcpChannel>,
    state: SpinLock<ChannelState>,
    stats: ChannelStats,
}

impl TcpChannel {
    /// Wrap a connected socket and register it with the reactor. Takes
    /// ownership of `fd`; it is closed when the channel stops.
    pub fn from_fd(fd: RawFd, epoll: Arc<EpollShared>) -> Result<Arc<TcpChannel>> {
        Self::open(format!("/tcp/channel/{}", fd), fd, epoll)
    }

    pub(crate) fn open(fqn: String, fd: RawFd, epoll: Arc<EpollShared>) -> Result<Arc<TcpChannel>> {
        if fd < 0 {
            return Err(Error::InvalidArgument("negative descriptor"));
        }
        if let Err(e) = sys::set_nonblocking(fd) {
            sys::close(fd);
            return Err(e);
        }

        let ch = Arc::new_cyclic(|this| TcpChannel {
            fqn,
            fd,
            epoll,
            this: this.clone(),
            state: SpinLock::new(ChannelState {
                lifecycle: Lifecycle::Running,
                read: None,
                writes: VecDeque::new(),
                stop: None,
            }),
            stats: ChannelStats::default(),
        });

        let weak: Weak<dyn FdHandler> = Arc::downgrade(&ch) as Weak<dyn FdHandler>;
        if let Err(e) = ch.epoll.add(fd, EV_IN | EV_OUT | EV_RDHUP | EV_ET, weak) {
            // not registered: stop cannot run, tear down here
            ch.state.lock().lifecycle = Lifecycle::Stopped;
            sys::close(fd);
            return Err(e);
        }
        kdebug!("{}: open", ch.fqn);
        Ok(ch)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        sys::local_addr(self.fd)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        sys::peer_addr(self.fd)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().lifecycle.is_running()
    }

    fn post_read(&self, buf: IoBuffer, done: IoCompletion, peek: bool) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty read buffer"));
        }
        {
            let mut st = self.state.lock();
            st.lifecycle.check_running()?;
            if st.read.is_some() {
                return Err(Error::Busy);
            }
            st.read = Some(ReadCtx {
                buf,
                done: 0,
                peek,
                h: done.accept(),
            });
        }
        self.kick(EV_IN);
        Ok(())
    }

    fn kick(&self, events: u32) {
        let weak: Weak<dyn FdHandler> = self.this.clone() as Weak<dyn FdHandler>;
        self.epoll.kick(weak, self.fd, events);
    }

    /// Pull from the socket into the pending read. Reactor thread only.
    fn read_from_socket(&self) {
        let (buf, start, peek) = {
            let st = self.state.lock();
            if !st.lifecycle.is_running() {
                return;
            }
            match &st.read {
                Some(ctx) => (ctx.buf.clone(), ctx.done, ctx.peek),
                None => return,
            }
        };

        let want = buf.size();
        let flags = if peek { libc::MSG_PEEK } else { 0 };
        let mut got = start;
        let mut outcome = None;
        while outcome.is_none() {
            if got == want {
                outcome = Some(Ok(got));
                break;
            }
            // Safety: got < want <= capacity
            let ptr = unsafe { buf.as_mut_ptr().add(got) };
            match sys::recv(self.fd, ptr, want - got, flags) {
                // orderly close: deliver what we have
                Ok(0) => outcome = Some(Ok(got)),
                Ok(n) => {
                    got += n;
                    if peek {
                        outcome = Some(Ok(got));
                    }
                }
                Err(e) if e.is_would_block() => break,
                Err(e) => outcome = Some(Err(e)),
            }
        }
        if !peek {
            self.stats.bytes_read.fetch_add((got - start) as u64, Ordering::Relaxed);
        }

        let finished = {
            let mut st = self.state.lock();
            match outcome {
                Some(res) => st.read.take().map(|ctx| (ctx.h, res)),
                None => {
                    if let Some(ctx) = st.read.as_mut() {
                        ctx.done = got;
                    }
                    None
                }
            }
        };
        if let Some((h, res)) = finished {
            ktrace!("{}: read done {:?}", self.fqn, res);
            self.stats.reads.fetch_add(1, Ordering::Relaxed);
            h.complete(res);
        }
    }

    /// Flush queued writes from the head. Reactor thread only.
    fn write_to_socket(&self) {
        loop {
            let (buf, start) = {
                let st = self.state.lock();
                if !st.lifecycle.is_running() {
                    return;
                }
                match st.writes.front() {
                    Some(ctx) => (ctx.buf.clone(), ctx.written),
                    None => return,
                }
            };

            let want = buf.size();
            let mut off = start;
            let mut outcome = None;
            while off < want {
                // Safety: off < want <= capacity
                let ptr = unsafe { buf.as_ptr().add(off) };
                match sys::send(self.fd, ptr, want - off) {
                    Ok(n) => off += n,
                    Err(e) if e.is_would_block() => break,
                    Err(e) => {
                        outcome = Some(Err(e));
                        break;
                    }
                }
            }
            if off == want && outcome.is_none() {
                outcome = Some(Ok(want));
            }
            self.stats.bytes_written.fetch_add((off - start) as u64, Ordering::Relaxed);

            let finished = {
                let mut st = self.state.lock();
                match outcome {
                    Some(res) => st.writes.pop_front().map(|ctx| (ctx.h, res)),
                    None => {
                        if let Some(ctx) = st.writes.front_mut() {
                            ctx.written = off;
                        }
                        None
                    }
                }
            };
            match finished {
                Some((h, res)) => {
                    self.stats.writes.fetch_add(1, Ordering::Relaxed);
                    h.complete(res);
                }
                // socket buffer full, wait for the next EPOLLOUT edge
                None => return,
            }
        }
    }

    /// Runs on the reactor thread after deregistration.
    fn barrier_done(&self) {
        let (read, writes, stop) = {
            let mut st = self.state.lock();
            st.lifecycle.finish_stop();
            (st.read.take(), std::mem::take(&mut st.writes), st.stop.take())
        };
        sys::close(self.fd);

        if let Some(ctx) = read {
            ctx.h.complete(Err(Error::Aborted));
        }
        for ctx in writes {
            ctx.h.complete(Err(Error::Aborted));
        }
        kdebug!("{}: stopped", self.fqn);
        if let Some(h) = stop {
            h.complete(());
        }
    }
}

impl FdHandler for TcpChannel {
    fn on_event(&self, _fd: RawFd, events: u32) {
        if events & (EV_IN | EV_RDHUP | EV_HUP | EV_ERR) != 0 {
            self.read_from_socket();
        }
        if events & (EV_OUT | EV_HUP | EV_ERR) != 0 {
            self.write_to_socket();
        }
    }
}

impl UnicastChannel for TcpChannel {
    fn read(&self, buf: IoBuffer, done: IoCompletion) -> Result<()> {
        self.post_read(buf, done, false)
    }

    fn peek(&self, buf: IoBuffer, done: IoCompletion) -> Result<()> {
        self.post_read(buf, done, true)
    }

    fn write(&self, buf: IoBuffer, done: IoCompletion) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty write buffer"));
        }
        {
            let mut st = self.state.lock();
            st.lifecycle.check_running()?;
            st.writes.push_back(WriteCtx {
                buf,
                written: 0,
                h: done.accept(),
            });
        }
        self.kick(EV_OUT);
        Ok(())
    }
}

impl AsyncProcessor for TcpChannel {
    fn fqn(&self) -> String {
        self.fqn.clone()
    }

    fn stop(&self, done: StopHandler) -> Result<()> {
        let this = self.this.upgrade().ok_or(Error::Stopped)?;
        {
            let mut st = self.state.lock();
            st.lifecycle.begin_stop()?;
            st.stop = Some(done.accept());
        }
        if let Err(e) = self.epoll.remove(self.fd) {
            kwarn!("{}: deregister failed: {}", self.fqn, e);
        }
        let barrier_this = Arc::clone(&this);
        if self.epoll.barrier(move || barrier_this.barrier_done()).is_err() {
            // reactor already gone, nothing else can touch the fd
            this.barrier_done();
        }
        Ok(())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.lifecycle == Lifecycle::Stopped {
            return;
        }
        kwarn!("{}: dropped without stop", self.fqn);
        st.lifecycle = Lifecycle::Stopped;
        let read = st.read.take();
        let writes = std::mem::take(&mut st.writes);
        let _ = self.epoll.remove(self.fd);
        sys::close(self.fd);
        if let Some(ctx) = read {
            ctx.h.complete(Err(Error::Aborted));
        }
        for ctx in writes {
            ctx.h.complete(Err(Error::Aborted));
        }
    }
}
