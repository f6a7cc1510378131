//! TCP socket options
//!
//! Setters report kernel failure as `false`, getters as `-1`.

use std::os::unix::io::RawFd;

use crate::sys::{getsockopt_int, setsockopt_int};

pub struct SocketOptions;

impl SocketOptions {
    pub fn set_tcp_nodelay(fd: RawFd, enable: bool) -> bool {
        setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int).is_ok()
    }

    /// `1` if Nagle is disabled, `0` if enabled, `-1` on failure.
    pub fn get_tcp_nodelay(fd: RawFd) -> i32 {
        match getsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY) {
            Ok(v) => (v != 0) as i32,
            Err(_) => -1,
        }
    }

    /// Set both send and receive buffer sizes.
    pub fn set_tcp_window(fd: RawFd, size: i32) -> bool {
        Self::set_send_buffer(fd, size) && Self::set_recv_buffer(fd, size)
    }

    pub fn set_send_buffer(fd: RawFd, size: i32) -> bool {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size).is_ok()
    }

    pub fn set_recv_buffer(fd: RawFd, size: i32) -> bool {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size).is_ok()
    }

    pub fn get_recv_buffer(fd: RawFd) -> i32 {
        getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF).unwrap_or(-1)
    }

    pub fn get_send_buffer(fd: RawFd) -> i32 {
        getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF).unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    #[test]
    fn test_nodelay_roundtrip() {
        let fd = sys::tcp_socket().unwrap();
        assert!(SocketOptions::set_tcp_nodelay(fd, true));
        assert_eq!(SocketOptions::get_tcp_nodelay(fd), 1);
        assert!(SocketOptions::set_tcp_nodelay(fd, false));
        assert_eq!(SocketOptions::get_tcp_nodelay(fd), 0);
        sys::close(fd);
    }

    #[test]
    fn test_window() {
        let fd = sys::tcp_socket().unwrap();
        assert!(SocketOptions::set_tcp_window(fd, 64 * 1024));
        // the kernel doubles the requested value for bookkeeping
        assert!(SocketOptions::get_recv_buffer(fd) >= 64 * 1024);
        assert!(SocketOptions::get_send_buffer(fd) >= 64 * 1024);
        sys::close(fd);
    }

    #[test]
    fn test_bad_descriptor_sentinels() {
        assert!(!SocketOptions::set_tcp_nodelay(-1, true));
        assert_eq!(SocketOptions::get_tcp_nodelay(-1), -1);
        assert_eq!(SocketOptions::get_recv_buffer(-1), -1);
        assert!(!SocketOptions::set_tcp_window(-1, 4096));
    }
}
