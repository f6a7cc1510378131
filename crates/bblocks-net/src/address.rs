//! Socket addresses
//!
//! A `SocketAddress` is a (local binding, remote) pair of IPv4 endpoints.
//! Listeners use only the local half; connectors bind the local half when
//! it is not the wildcard and connect to the remote half.
//!
//! Resolution failures in `resolve`/`parse` are invariant violations; use
//! the `try_` variants to validate user input first.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use bblocks_core::{invariant, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddress {
    local: SocketAddrV4,
    remote: SocketAddrV4,
}

const ANY: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

impl SocketAddress {
    /// Connection to `remote` from any local address.
    pub fn new(remote: SocketAddrV4) -> Self {
        Self { local: ANY, remote }
    }

    /// Connection to `remote` bound locally to `local`.
    pub fn with_local(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }

    /// Listening address.
    pub fn server(local: SocketAddrV4) -> Self {
        Self { local, remote: ANY }
    }

    /// Listening address from a host name and port.
    pub fn server_addr(host: &str, port: u16) -> Self {
        Self::server(Self::resolve(host, port))
    }

    /// Connection from two `host:port` strings.
    pub fn connection(laddr: &str, raddr: &str) -> Self {
        Self::with_local(Self::parse(laddr), Self::parse(raddr))
    }

    #[inline]
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    #[inline]
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    /// Whether the local half asks for a specific binding.
    pub fn has_local_binding(&self) -> bool {
        self.local != ANY
    }

    /// First IPv4 address of `host`.
    pub fn try_resolve(host: &str, port: u16) -> Result<SocketAddrV4> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidArgument("host does not resolve"))?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Ok(v4);
            }
        }
        Err(Error::InvalidArgument("host has no IPv4 address"))
    }

    pub fn resolve(host: &str, port: u16) -> SocketAddrV4 {
        match Self::try_resolve(host, port) {
            Ok(a) => a,
            Err(e) => {
                invariant!(false, "cannot resolve {}:{}: {}", host, port, e);
                unreachable!()
            }
        }
    }

    /// Parse `host:port`.
    pub fn try_parse(s: &str) -> Result<SocketAddrV4> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(Error::InvalidArgument("expected host:port"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument("bad port"))?;
        Self::try_resolve(host, port)
    }

    pub fn parse(s: &str) -> SocketAddrV4 {
        match Self::try_parse(s) {
            Ok(a) => a,
            Err(e) => {
                invariant!(false, "cannot parse address {:?}: {}", s, e);
                unreachable!()
            }
        }
    }
}

impl From<SocketAddrV4> for SocketAddress {
    fn from(remote: SocketAddrV4) -> Self {
        Self::new(remote)
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}
