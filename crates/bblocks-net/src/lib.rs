//! # bblocks-net
//!
//! Socket transport over an edge-triggered epoll reactor.
//!
//! ```text
//!   caller ──read/write/accept/connect──► component ──kick──► reactor
//!                                                              │
//!   handler ◄────────── Pending::complete ◄── on_event ◄───────┘
//! ```
//!
//! All socket I/O runs on the reactor thread. Components only enqueue
//! requests under their lock and kick the reactor, so a handler may issue
//! the next request on the same component without deadlocking.
//!
//! ## Modules
//!
//! - `config` - Reactor configuration with env overrides
//! - `epoll` - Reactor thread, registrations, kicks and barriers
//! - `sys` - Thin libc socket helpers
//! - `address` - `SocketAddress` (local + remote IPv4 pair) and resolution
//! - `options` - TCP socket options
//! - `transport` - Per-kind transport traits
//! - `channel` - `TcpChannel`: one established connection
//! - `server` - `TcpServer`: listener
//! - `connector` - `TcpConnector`: outbound connects
//! - `rpc` - Wire framing for fixed-layout records

pub mod config;
pub mod epoll;
pub mod sys;
pub mod address;
pub mod options;
pub mod transport;
pub mod channel;
pub mod server;
pub mod connector;
pub mod rpc;

pub use config::EpollConfig;
pub use epoll::{Epoll, EpollShared, FdHandler};
pub use address::SocketAddress;
pub use options::SocketOptions;
pub use transport::{Acceptor, AcceptHandler, Connector, UnicastChannel};
pub use channel::TcpChannel;
pub use server::TcpServer;
pub use connector::TcpConnector;
pub use rpc::{Packet, RpcData, RpcPacket};
