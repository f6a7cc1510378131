//! # bblocks-aio
//!
//! Block-device transport: kernel-queued AIO over io_uring and a
//! sector-addressed device on top of it.
//!
//! ```text
//!   SpinningDevice ──(align, range, stats)──► LinuxAioProcessor
//!                                                 │ round-robin
//!                                    ┌────────────┼────────────┐
//!                                 poller 0     poller 1  ...  poller N-1
//!                                 (ring 0)     (ring 1)       (ring N-1)
//! ```
//!
//! ## Modules
//!
//! - `config` - `AioConfig` with env overrides
//! - `processor` - `AioProcessor` trait and the io_uring implementation
//! - `device` - `BlockDevice` trait and `SpinningDevice`

pub mod config;
pub mod processor;
pub mod device;

#[cfg(test)]
mod testutil;

pub use config::AioConfig;
pub use processor::{AioProcessor, IoCompletion, LinuxAioProcessor};
pub use device::{BlockDevice, DeviceStats, SpinningDevice};
