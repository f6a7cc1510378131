//! Reference-counted I/O buffer
//!
//! An `IoBuffer` is a fixed-capacity byte region shared between the caller
//! that issues an operation and the reactor or poller thread (or the
//! kernel) that performs the transfer. Clones share the same storage.
//!
//! Storage is sector aligned so the same buffer can be handed to a block
//! device opened with `O_DIRECT`.
//!
//! **Contract:** once a buffer has been handed to a read or write, the
//! caller must neither read nor modify its bytes until the matching
//! completion fires. The buffer is never resized implicitly; `set_size`
//! only moves the logical length inside the fixed capacity.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::SECTOR_SIZE;

struct Region {
    ptr: NonNull<u8>,
    cap: usize,
    len: AtomicUsize,
    cursor: AtomicUsize,
}

// Safety: the region is a plain heap allocation; concurrent access to the
// bytes is governed by the ownership contract above.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn layout(cap: usize) -> Layout {
        // cap is non-zero and SECTOR_SIZE is a power of two
        match Layout::from_size_align(cap, SECTOR_SIZE) {
            Ok(layout) => layout,
            Err(_) => crate::deadend!(),
        }
    }

    fn zeroed(cap: usize) -> Self {
        let ptr = if cap == 0 {
            NonNull::dangling()
        } else {
            let layout = Self::layout(cap);
            // Safety: layout has non-zero size
            let raw = unsafe { alloc::alloc_zeroed(layout) };
            match NonNull::new(raw) {
                Some(p) => p,
                None => alloc::handle_alloc_error(layout),
            }
        };
        Region {
            ptr,
            cap,
            len: AtomicUsize::new(cap),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.cap != 0 {
            // Safety: allocated in `zeroed` with the same layout
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.cap)) };
        }
    }
}

/// Reference-counted, fixed-size byte region with length and cursor
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<Region>,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of `size` bytes. Length starts at `size`.
    pub fn alloc(size: usize) -> Self {
        Self {
            inner: Arc::new(Region::zeroed(size)),
        }
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let buf = Self::alloc(data.len());
        buf.write_at(0, data);
        buf
    }

    /// Fixed capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.cap
    }

    /// Logical length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Move the logical length. Never reallocates.
    pub fn set_size(&self, len: usize) {
        crate::invariant!(len <= self.inner.cap, "len {} cap {}", len, self.inner.cap);
        self.inner.len.store(len, Ordering::Release);
        if self.cursor() > len {
            self.inner.cursor.store(len, Ordering::Release);
        }
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.inner.cursor.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, pos: usize) {
        crate::invariant!(pos <= self.size(), "cursor {} len {}", pos, self.size());
        self.inner.cursor.store(pos, Ordering::Release);
    }

    /// Advance the cursor by `n` bytes and return the new position.
    pub fn advance(&self, n: usize) -> usize {
        let pos = self.cursor() + n;
        self.set_cursor(pos);
        pos
    }

    /// Bytes between the cursor and the logical length.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.size() - self.cursor()
    }

    /// Raw pointer to the first byte, for handing to the kernel.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.ptr.as_ptr()
    }

    /// Raw mutable pointer to the first byte, for handing to the kernel.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.ptr.as_ptr()
    }

    /// Whether two handles share the same storage.
    #[inline]
    pub fn ptr_eq(&self, other: &IoBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` over the bytes `[0, size)`.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        // Safety: ptr is valid for cap >= size bytes
        let slice = unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size()) };
        f(slice)
    }

    /// Run `f` over the mutable bytes `[0, size)`.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // Safety: ptr is valid for cap >= size bytes; exclusivity per contract
        let slice = unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) };
        f(slice)
    }

    /// Copy `data` into the buffer at `off`.
    pub fn write_at(&self, off: usize, data: &[u8]) {
        crate::invariant!(off + data.len() <= self.size());
        self.with_mut(|b| b[off..off + data.len()].copy_from_slice(data));
    }

    /// Copy bytes at `off` into `out`.
    pub fn read_at(&self, off: usize, out: &mut [u8]) {
        crate::invariant!(off + out.len() <= self.size());
        self.with(|b| out.copy_from_slice(&b[off..off + out.len()]));
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|b| b.to_vec())
    }

    /// Zero the whole capacity and reset length and cursor.
    pub fn reset(&self) {
        // Safety: ptr valid for cap bytes
        unsafe { std::ptr::write_bytes(self.as_mut_ptr(), 0, self.inner.cap) };
        self.inner.len.store(self.inner.cap, Ordering::Release);
        self.inner.cursor.store(0, Ordering::Release);
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("cap", &self.capacity())
            .field("len", &self.size())
            .field("cursor", &self.cursor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let buf = IoBuffer::alloc(4096);
        assert_eq!(buf.size(), 4096);
        assert_eq!(buf.as_ptr() as usize % SECTOR_SIZE, 0);
        assert!(buf.with(|b| b.iter().all(|&x| x == 0)));
    }

    #[test]
    fn test_clones_share_storage() {
        let a = IoBuffer::alloc(16);
        let b = a.clone();
        a.write_at(4, b"abcd");
        assert_eq!(&b.to_vec()[4..8], b"abcd");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&IoBuffer::alloc(16)));
    }

    #[test]
    fn test_size_and_cursor() {
        let buf = IoBuffer::from_slice(b"hello world");
        assert_eq!(buf.remaining(), 11);
        buf.advance(6);
        assert_eq!(buf.remaining(), 5);

        buf.set_size(5);
        assert_eq!(buf.cursor(), 5);
        assert_eq!(buf.to_vec(), b"hello");
        assert_eq!(buf.capacity(), 11);

        buf.reset();
        assert_eq!(buf.size(), 11);
        assert_eq!(buf.cursor(), 0);
    }

    #[test]
    fn test_zero_capacity() {
        let buf = IoBuffer::alloc(0);
        assert!(buf.is_empty());
        assert_eq!(buf.to_vec(), Vec::<u8>::new());
    }
}
