//! # bblocks - asynchronous building blocks
//!
//! Completion-based I/O for storage and networking services. Every
//! component accepts a request plus a handler, returns immediately, and
//! invokes the handler exactly once later from one of its own threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bblocks::{Acceptor, AcceptHandler, Runtime, RuntimeConfig, SocketAddress, TcpServer};
//! use std::sync::Arc;
//!
//! fn main() -> bblocks::Result<()> {
//!     let mut rt = Runtime::start(RuntimeConfig::from_env())?;
//!
//!     let server = TcpServer::new(rt.epoll());
//!     let on_accept: AcceptHandler = Arc::new(|ch| {
//!         // read/write on the channel
//!     });
//!     server.accept(&SocketAddress::server("0.0.0.0:7000".parse().unwrap()), on_accept)?;
//!
//!     rt.scheduler().wait();
//!     rt.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        read/write/accept/connect + Completion handlers      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                      │                      │
//!          ▼                      ▼                      ▼
//!   ┌─────────────┐       ┌───────────────┐      ┌─────────────┐
//!   │ TcpChannel  │       │ SpinningDevice│      │  Scheduler  │
//!   │ TcpServer   │       │               │      │  (workers)  │
//!   │ TcpConnector│       └───────────────┘      └─────────────┘
//!   └─────────────┘               │
//!          │                      ▼
//!          ▼              ┌───────────────┐
//!   ┌─────────────┐       │LinuxAioProc.  │
//!   │ Epoll       │       │ N io_uring    │
//!   │ reactor     │       │ pollers       │
//!   └─────────────┘       └───────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

// Core types
pub use bblocks_core::{
    AsyncProcessor, Completion, Error, Handle, IoBuffer, Lifecycle, OpBarrier, Pending, Result,
    SpinLock, StopHandler, WeakHandle,
};
pub use bblocks_core::constants::{INVALID_FD, SECTOR_SIZE};
pub use bblocks_core::{is_aligned, roundup, Adler32};

// Logging
pub use bblocks_core::{invariant, kdebug, kerror, kinfo, kprintln, ktrace, kwarn};
pub use bblocks_core::kprint::{init as init_logging, set_log_level, LogLevel};

// Env utilities
pub use bblocks_core::{env_get, env_get_bool, env_get_str};

// Threads and scheduling
pub use bblocks_runtime::{
    ConfigError, EventFd, Scheduler, SchedulerConfig, Thread, ThreadCtx, ThreadRole, Waker,
};
pub use bblocks_runtime::thread::{current as current_thread, current_worker};

// Sockets
pub use bblocks_net::{
    AcceptHandler, Acceptor, Connector, Epoll, EpollConfig, EpollShared, Packet, RpcData,
    RpcPacket, SocketAddress, SocketOptions, TcpChannel, TcpConnector, TcpServer, UnicastChannel,
};

// Block devices
pub use bblocks_aio::{
    AioConfig, AioProcessor, BlockDevice, DeviceStats, LinuxAioProcessor, SpinningDevice,
};

/// Handler for a transfer of bytes, shared by sockets and devices.
pub type IoCompletion = Completion<Result<usize>>;

/// Configuration for the bundled runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub epoll: EpollConfig,
    /// `None` skips the AIO processor
    pub aio: Option<AioConfig>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            scheduler: SchedulerConfig::from_env(),
            epoll: EpollConfig::from_env(),
            aio: Some(AioConfig::from_env()),
        }
    }

    pub fn new() -> Self {
        Self {
            scheduler: SchedulerConfig::new(),
            epoll: EpollConfig::new(),
            aio: Some(AioConfig::new()),
        }
    }

    pub fn without_aio(mut self) -> Self {
        self.aio = None;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// How long `shutdown` waits for the AIO processor to drain.
const AIO_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduler, epoll reactor and AIO processor started together.
///
/// Transports built on top must be stopped before `shutdown`.
pub struct Runtime {
    scheduler: Scheduler,
    epoll: Epoll,
    aio: Option<Arc<LinuxAioProcessor>>,
    running: bool,
}

impl Runtime {
    pub fn start(config: RuntimeConfig) -> Result<Self> {
        bblocks_core::kprint::init();

        let scheduler = Scheduler::new(config.scheduler)?;
        scheduler.start()?;
        let epoll = Epoll::start(config.epoll)?;
        let aio = match config.aio {
            Some(c) => Some(LinuxAioProcessor::start(c)?),
            None => None,
        };
        kinfo!(
            "/runtime: {} workers, aio {}",
            scheduler.num_workers(),
            if aio.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            scheduler,
            epoll,
            aio,
            running: true,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn epoll(&self) -> Arc<EpollShared> {
        self.epoll.shared()
    }

    pub fn aio(&self) -> Option<Arc<dyn AioProcessor>> {
        self.aio.as_ref().map(|a| Arc::clone(a) as Arc<dyn AioProcessor>)
    }

    /// Stop the AIO processor, the reactor and the workers, in that order.
    ///
    /// Must not be called from a runtime thread.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Some(aio) = self.aio.take() {
            let (done, rx) = Completion::<()>::channel();
            match aio.stop(done) {
                Ok(()) => {
                    if rx.recv_timeout(AIO_STOP_TIMEOUT).is_err() {
                        kerror!("/runtime: aio did not drain");
                    }
                }
                Err(e) => kdebug!("/runtime: aio already stopping: {}", e),
            }
        }
        self.epoll.shutdown();
        self.scheduler.shutdown();
        kinfo!("/runtime: shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runtime_without_aio() {
        let mut rt = Runtime::start(RuntimeConfig::new().without_aio()).unwrap();
        assert!(rt.aio().is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let waker = rt.scheduler().waker();
        let h = Arc::clone(&hits);
        rt.scheduler()
            .schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
                waker.wakeup();
            })
            .unwrap();
        rt.scheduler().wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        rt.shutdown();
        assert_eq!(rt.scheduler().schedule_fn(|| {}), Err(Error::Stopped));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut rt = Runtime::start(RuntimeConfig::new().without_aio()).unwrap();
        rt.shutdown();
        rt.shutdown();
    }
}
