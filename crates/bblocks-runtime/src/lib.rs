//! # bblocks-runtime
//!
//! Threads and callback dispatch for bblocks.
//!
//! ## Modules
//!
//! - `config` - Configuration with env overrides
//! - `eventfd` - Coalescing eventfd wakeup
//! - `thread` - OS thread wrapper with a thread-local execution context
//! - `parking` - Per-worker sleep/wake (futex on Linux, condvar elsewhere)
//! - `scheduler` - Fixed thread pool running scheduled callbacks
//!
//! Reactor and poller threads in `bblocks-net` and `bblocks-aio` are
//! spawned through `thread::Thread` so every runtime thread carries a
//! context.

pub mod config;
pub mod eventfd;
pub mod thread;
pub mod parking;
pub mod scheduler;

pub use config::{ConfigError, SchedulerConfig};
pub use eventfd::EventFd;
pub use thread::{Thread, ThreadCtx, ThreadRole};
pub use scheduler::{Scheduler, Waker};
