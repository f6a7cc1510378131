//! Thin libc socket helpers
//!
//! Every call returns `bblocks_core::Result`; errno is captured right after
//! the failing syscall. Sockets are always created non-blocking and
//! close-on-exec.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use bblocks_core::{Error, Result};

#[inline]
pub(crate) fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret)
    }
}

#[inline]
fn cvt_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

pub(crate) fn tcp_socket() -> Result<RawFd> {
    cvt(unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })
}

pub(crate) fn to_sockaddr(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

pub(crate) fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(sa.sin_port),
    )
}

const SOCKADDR_IN_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

pub(crate) fn bind(fd: RawFd, addr: &SocketAddrV4) -> Result<()> {
    let sa = to_sockaddr(addr);
    cvt(unsafe { libc::bind(fd, &sa as *const _ as *const libc::sockaddr, SOCKADDR_IN_LEN) })?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: usize) -> Result<()> {
    cvt(unsafe { libc::listen(fd, backlog as libc::c_int) })?;
    Ok(())
}

/// Start a non-blocking connect. `Ok(true)` if it completed immediately.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddrV4) -> Result<bool> {
    let sa = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &sa as *const _ as *const libc::sockaddr, SOCKADDR_IN_LEN) };
    if ret == 0 {
        return Ok(true);
    }
    match Error::last_os() {
        Error::Os(e) if e == libc::EINPROGRESS => Ok(false),
        err => Err(err),
    }
}

/// Accept one queued connection. `Ok(None)` once the backlog is empty.
pub(crate) fn accept(fd: RawFd) -> Result<Option<RawFd>> {
    loop {
        let ret = unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if ret >= 0 {
            return Ok(Some(ret));
        }
        match Error::last_os() {
            Error::Os(e) if e == libc::EINTR => continue,
            // the peer gave up before we got to it
            Error::Os(e) if e == libc::ECONNABORTED => continue,
            err if err.is_would_block() => return Ok(None),
            err => return Err(err),
        }
    }
}

pub(crate) fn recv(fd: RawFd, buf: *mut u8, len: usize, flags: libc::c_int) -> Result<usize> {
    loop {
        let ret = unsafe { libc::recv(fd, buf as *mut libc::c_void, len, flags) };
        match cvt_size(ret) {
            Err(Error::Os(e)) if e == libc::EINTR => continue,
            other => return other,
        }
    }
}

pub(crate) fn send(fd: RawFd, buf: *const u8, len: usize) -> Result<usize> {
    loop {
        let ret = unsafe { libc::send(fd, buf as *const libc::c_void, len, libc::MSG_NOSIGNAL) };
        match cvt_size(ret) {
            Err(Error::Os(e)) if e == libc::EINTR => continue,
            other => return other,
        }
    }
}

pub(crate) fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub(crate) fn getsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> Result<libc::c_int> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe { libc::getsockopt(fd, level, name, &mut val as *mut _ as *mut libc::c_void, &mut len) })?;
    Ok(val)
}

/// Pending error of a socket (`SO_ERROR`), 0 if none.
pub(crate) fn socket_error(fd: RawFd) -> Result<libc::c_int> {
    getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)
}

pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    cvt(unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(from_sockaddr(&sa))
}

pub(crate) fn peer_addr(fd: RawFd) -> Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    cvt(unsafe { libc::getpeername(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(from_sockaddr(&sa))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8080);
        let sa = to_sockaddr(&addr);
        assert_eq!(sa.sin_port, 8080u16.to_be());
        assert_eq!(from_sockaddr(&sa), addr);
    }

    #[test]
    fn test_bind_listen_local_addr() {
        let fd = tcp_socket().unwrap();
        bind(fd, &SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listen(fd, 16).unwrap();
        let addr = local_addr(fd).unwrap();
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
        assert_eq!(accept(fd).unwrap(), None);
        close(fd);
    }
}
