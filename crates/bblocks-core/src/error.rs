//! Error types for bblocks operations
//!
//! Two kinds of failure share this enum. Immediate rejections are returned
//! synchronously from `start`-style calls and are never followed by a
//! handler invocation. Asynchronous failures are delivered only through
//! the handler of an accepted operation.

use core::fmt;

/// Result type for bblocks operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur in bblocks operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Component has been stopped (or is stopping)
    Stopped,

    /// An operation of this kind is already outstanding
    Busy,

    /// Submission queue is full
    QueueFull,

    /// Malformed request
    InvalidArgument(&'static str),

    /// Offset or size is not a multiple of the sector size
    Misaligned,

    /// Offset plus size exceeds the device capacity
    OutOfRange,

    /// Operation was failed by `stop` before it could complete
    Aborted,

    /// Checksum mismatch on decode
    Corrupt,

    /// Kernel transferred fewer bytes than requested
    ShortTransfer { expected: usize, actual: usize },

    /// OS error with errno
    Os(i32),
}

impl Error {
    /// Capture the calling thread's current errno.
    #[inline]
    pub fn last_os() -> Self {
        Error::Os(nix::errno::Errno::last() as i32)
    }

    /// Build from a negative kernel result (`-errno`).
    #[inline]
    pub fn from_neg(res: i32) -> Self {
        if res == -ecanceled() {
            Error::Aborted
        } else {
            Error::Os(-res)
        }
    }

    /// Negative integer code for consumers that want the errno convention.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Stopped => -(nix::errno::Errno::ESHUTDOWN as i32),
            Error::Busy => -(nix::errno::Errno::EBUSY as i32),
            Error::QueueFull => -(nix::errno::Errno::EAGAIN as i32),
            Error::InvalidArgument(_) => -(nix::errno::Errno::EINVAL as i32),
            Error::Misaligned => -(nix::errno::Errno::EINVAL as i32),
            Error::OutOfRange => -(nix::errno::Errno::ERANGE as i32),
            Error::Aborted => -ecanceled(),
            Error::Corrupt => -(nix::errno::Errno::EBADMSG as i32),
            Error::ShortTransfer { .. } => -(nix::errno::Errno::EIO as i32),
            Error::Os(e) => -e,
        }
    }

    /// Whether this error means "the peer or device would block, try later".
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Os(e) if *e == nix::errno::Errno::EAGAIN as i32)
    }
}

#[inline]
fn ecanceled() -> i32 {
    nix::errno::Errno::ECANCELED as i32
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Stopped => write!(f, "component stopped"),
            Error::Busy => write!(f, "operation already pending"),
            Error::QueueFull => write!(f, "submission queue full"),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::Misaligned => write!(f, "request not sector aligned"),
            Error::OutOfRange => write!(f, "request exceeds device capacity"),
            Error::Aborted => write!(f, "operation aborted"),
            Error::Corrupt => write!(f, "checksum mismatch"),
            Error::ShortTransfer { expected, actual } => {
                write!(f, "short transfer: {} of {} bytes", actual, expected)
            }
            Error::Os(e) => write!(f, "OS error: {}", nix::errno::Errno::from_raw(*e).desc()),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Os(e as i32)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Os(e.raw_os_error().unwrap_or(nix::errno::Errno::EIO as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::Aborted), "operation aborted");
        assert_eq!(
            format!("{}", Error::ShortTransfer { expected: 512, actual: 100 }),
            "short transfer: 100 of 512 bytes"
        );
    }

    #[test]
    fn test_from_neg() {
        assert_eq!(Error::from_neg(-(nix::errno::Errno::EIO as i32)), Error::Os(5));
        assert_eq!(Error::from_neg(-ecanceled()), Error::Aborted);
    }

    #[test]
    fn test_errno_is_negative() {
        for e in [
            Error::Stopped,
            Error::Busy,
            Error::QueueFull,
            Error::Misaligned,
            Error::Aborted,
            Error::Os(104),
        ] {
            assert!(e.errno() < 0, "{:?}", e);
        }
        assert_eq!(Error::Os(104).errno(), -104);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(32);
        assert_eq!(Error::from(io), Error::Os(32));
    }
}
