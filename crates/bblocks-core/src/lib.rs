//! # bblocks-core
//!
//! Core types shared by every bblocks component.
//!
//! This crate is platform-agnostic apart from errno capture. The socket
//! transport lives in `bblocks-net`, the block-device transport in
//! `bblocks-aio`, and threads/scheduling in `bblocks-runtime`.
//!
//! ## Modules
//!
//! - `buffer` - Reference-counted, fixed-size I/O buffer
//! - `handle` - Liveness handles with weak back-references
//! - `completion` - Completion handlers and the async-processor contract
//! - `lifecycle` - Running/Stopping/Stopped state machine
//! - `error` - Error types
//! - `spinlock` - Short-hold spinlock used for pending-op bookkeeping
//! - `kprint` - Kernel-style debug printing macros and `invariant!`
//! - `env` - Environment variable utilities
//! - `util` - Checksums and small numeric helpers

pub mod buffer;
pub mod handle;
pub mod completion;
pub mod lifecycle;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;
pub mod util;

// Re-exports for convenience
pub use buffer::IoBuffer;
pub use handle::{Handle, WeakHandle};
pub use completion::{AsyncProcessor, Completion, Pending, StopHandler};
pub use lifecycle::{Lifecycle, OpBarrier};
pub use error::{Error, Result};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_str};
pub use util::{is_aligned, roundup, Adler32};

/// Constants shared across transports
pub mod constants {
    /// Sector size used by block devices and buffer alignment.
    pub const SECTOR_SIZE: usize = 512;

    /// Sentinel for "no descriptor".
    pub const INVALID_FD: i32 = -1;
}
