//! bblocks Echo Server
//!
//! TCP echo server built on `TcpServer` and `TcpChannel`. Each connection
//! runs a peek -> read -> write chain entirely from completion handlers
//! on the reactor thread; no thread ever blocks on a socket.
//!
//! Usage:
//!     cargo build --release -p bb-echo
//!     ./target/release/bb-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, Instant};

use bblocks::{
    kdebug, kwarn, AcceptHandler, Acceptor, AsyncProcessor, Completion, Error, IoBuffer, Result,
    Runtime, RuntimeConfig, SocketAddress, SocketOptions, SpinLock, TcpChannel, TcpServer,
    UnicastChannel,
};

const BUF_SIZE: usize = 4096;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn print(&self, live: usize, elapsed: Duration) {
        eprintln!(
            "[{:.1}s] conns={} accepts={} closes={} bytes={} err={}",
            elapsed.as_secs_f64(),
            live,
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

/// One echoing connection.
struct Echo {
    ch: Arc<TcpChannel>,
    buf: IoBuffer,
    stats: Arc<Stats>,
}

impl Echo {
    fn start(ch: Arc<TcpChannel>, stats: Arc<Stats>) {
        if !SocketOptions::set_tcp_nodelay(ch.fd(), true) {
            kwarn!("fd {}: TCP_NODELAY not set", ch.fd());
        }
        let echo = Arc::new(Echo {
            ch,
            buf: IoBuffer::alloc(BUF_SIZE),
            stats,
        });
        echo.peek();
    }

    /// Wait for data without consuming it.
    fn peek(self: Arc<Self>) {
        self.buf.set_size(BUF_SIZE);
        let this = Arc::clone(&self);
        let started = self.ch.peek(
            self.buf.clone(),
            Completion::new(move |res: Result<usize>| match res {
                Ok(0) => this.close(),
                Ok(n) => this.read(n),
                Err(e) => this.fail(e),
            }),
        );
        if let Err(e) = started {
            self.fail(e);
        }
    }

    /// Consume the `n` bytes already known to be there.
    fn read(self: Arc<Self>, n: usize) {
        self.buf.set_size(n);
        let this = Arc::clone(&self);
        let started = self.ch.read(
            self.buf.clone(),
            Completion::new(move |res: Result<usize>| match res {
                Ok(0) => this.close(),
                Ok(_) => this.write(),
                Err(e) => this.fail(e),
            }),
        );
        if let Err(e) = started {
            self.fail(e);
        }
    }

    fn write(self: Arc<Self>) {
        let this = Arc::clone(&self);
        let started = self.ch.write(
            self.buf.clone(),
            Completion::new(move |res: Result<usize>| match res {
                Ok(n) => {
                    this.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
                    this.peek();
                }
                Err(e) => this.fail(e),
            }),
        );
        if let Err(e) = started {
            self.fail(e);
        }
    }

    fn fail(self: Arc<Self>, e: Error) {
        if e != Error::Aborted && e != Error::Stopped {
            kdebug!("{}: {}", self.ch.fqn(), e);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.close();
    }

    fn close(self: Arc<Self>) {
        if self.ch.stop(Completion::noop()).is_ok() {
            self.stats.closes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn stop_and_wait<P: AsyncProcessor + ?Sized>(p: &P) {
    let (done, rx) = Completion::<()>::channel();
    if p.stop(done).is_ok() && rx.recv_timeout(Duration::from_secs(5)).is_err() {
        kwarn!("{}: stop timed out", p.fqn());
    }
}

fn main() {
    bblocks::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let mut rt = match Runtime::start(RuntimeConfig::from_env().without_aio()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bb-echo: runtime start failed: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats::default());
    let conns: Arc<SpinLock<Vec<Weak<TcpChannel>>>> = Arc::new(SpinLock::new(Vec::new()));

    let server = TcpServer::new(rt.epoll());
    let on_accept: AcceptHandler = {
        let stats = Arc::clone(&stats);
        let conns = Arc::clone(&conns);
        Arc::new(move |res: Result<Arc<TcpChannel>>| match res {
            Ok(ch) => {
                stats.accepts.fetch_add(1, Ordering::Relaxed);
                conns.lock().push(Arc::downgrade(&ch));
                Echo::start(ch, Arc::clone(&stats));
            }
            Err(Error::Aborted) => kdebug!("bb-echo: listener stopped"),
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                kwarn!("bb-echo: accept failed: {}", e);
            }
        })
    };

    let addr = SocketAddress::server(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    if let Err(e) = server.accept(&addr, on_accept) {
        eprintln!("bb-echo: listen on port {} failed: {}", port, e);
        std::process::exit(1);
    }
    eprintln!("bb-echo: listening on port {}", port);

    let start = Instant::now();
    let mut last = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        rt.scheduler().wait_timeout(Duration::from_millis(200));
        if last.elapsed() >= Duration::from_secs(5) {
            let live = {
                let mut c = conns.lock();
                c.retain(|w| w.upgrade().map_or(false, |ch| ch.is_running()));
                c.len()
            };
            stats.print(live, start.elapsed());
            last = Instant::now();
        }
    }

    eprintln!("bb-echo: shutting down");
    stop_and_wait(&*server);
    let open: Vec<Arc<TcpChannel>> = conns.lock().drain(..).filter_map(|w| w.upgrade()).collect();
    let (tx, rx) = mpsc::channel();
    let mut waiting = 0;
    for ch in &open {
        let tx = tx.clone();
        if ch.stop(Completion::new(move |()| {
            let _ = tx.send(());
        }))
        .is_ok()
        {
            waiting += 1;
        }
    }
    for _ in 0..waiting {
        if rx.recv_timeout(Duration::from_secs(5)).is_err() {
            break;
        }
    }
    stats.print(0, start.elapsed());
    drop(open);
    rt.shutdown();
}
