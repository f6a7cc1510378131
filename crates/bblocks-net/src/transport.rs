//! Transport traits
//!
//! Each kind of socket component implements `AsyncProcessor` plus one of
//! these. Handlers follow the completion contract: a request that returns
//! `Err` never invokes its handler, one that returns `Ok` invokes it
//! exactly once.

use std::sync::Arc;

use bblocks_core::{AsyncProcessor, Completion, IoBuffer, Result};

use crate::address::SocketAddress;
use crate::channel::TcpChannel;

/// Handler for a read, peek or write: bytes transferred or an error.
pub type IoCompletion = Completion<Result<usize>>;

/// Multi-shot accept handler: once per accepted connection, then once
/// with `Err(Aborted)` when the listener stops.
pub type AcceptHandler = Arc<dyn Fn(Result<Arc<TcpChannel>>) + Send + Sync + 'static>;

/// One established, ordered byte stream.
pub trait UnicastChannel: AsyncProcessor {
    /// Fill `buf` up to its size. Completes early with the bytes read so
    /// far if the peer closes; `Ok(0)` means orderly close with no data.
    /// Only one read or peek may be outstanding.
    fn read(&self, buf: IoBuffer, done: IoCompletion) -> Result<()>;

    /// Copy available bytes into `buf` without consuming them.
    fn peek(&self, buf: IoBuffer, done: IoCompletion) -> Result<()>;

    /// Queue `buf` for sending. Writes complete in submission order, each
    /// only once fully flushed.
    fn write(&self, buf: IoBuffer, done: IoCompletion) -> Result<()>;
}

/// Listener producing channels.
pub trait Acceptor: AsyncProcessor {
    fn accept(&self, addr: &SocketAddress, handler: AcceptHandler) -> Result<()>;
}

/// Outbound connection factory.
pub trait Connector: AsyncProcessor {
    fn connect(&self, addr: &SocketAddress, done: Completion<Result<Arc<TcpChannel>>>) -> Result<()>;
}
