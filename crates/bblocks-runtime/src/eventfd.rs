//! Coalescing eventfd wakeup
//!
//! Multiple `notify` calls before a `drain` collapse into one readable
//! event (eventfd counter semantics). The epoll reactor polls a
//! non-blocking one; AIO pollers keep a read of a blocking one armed in
//! their ring.

use std::mem;
use std::os::unix::io::RawFd;

use bblocks_core::{Error, Result};

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Non-blocking eventfd, for readiness polling.
    pub fn create() -> Result<Self> {
        Self::with_flags(libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
    }

    /// Blocking eventfd, for reads queued to the kernel.
    pub fn blocking() -> Result<Self> {
        Self::with_flags(libc::EFD_CLOEXEC)
    }

    fn with_flags(flags: libc::c_int) -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = Error::last_os();
            // counter saturated: a wakeup is already pending
            if err.is_would_block() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter. Returns the number of coalesced notifications.
    ///
    /// Only meaningful on a non-blocking eventfd.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_coalesces() {
        let efd = EventFd::create().unwrap();
        assert_eq!(efd.drain(), 0);
        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }

    #[test]
    fn test_blocking_eventfd_readable_after_notify() {
        let efd = EventFd::blocking().unwrap();
        efd.notify().unwrap();
        // counter is nonzero so the read does not block
        assert_eq!(efd.drain(), 1);
    }
}
