//! Liveness handles
//!
//! `Handle<T>` is the owning reference to a component (channel, server,
//! device). Pending operations and multiplexer registrations hold a
//! `WeakHandle<T>` so they never extend the owner's lifetime but can still
//! tell when it has been destroyed.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Strong, atomically reference-counted liveness token.
pub struct Handle<T: ?Sized> {
    inner: Arc<T>,
}

/// Weak back-reference to a `Handle`.
pub struct WeakHandle<T: ?Sized> {
    inner: Weak<T>,
}

impl<T> Handle<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(value) }
    }

    /// Build a value that keeps a weak reference to itself.
    pub fn new_cyclic(f: impl FnOnce(&WeakHandle<T>) -> T) -> Self {
        let inner = Arc::new_cyclic(|weak| {
            let weak = WeakHandle { inner: weak.clone() };
            f(&weak)
        });
        Self { inner }
    }
}

impl<T: ?Sized> Handle<T> {
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle { inner: Arc::downgrade(&self.inner) }
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }

    pub fn into_arc(self) -> Arc<T> {
        self.inner
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address-derived identity, stable for the lifetime of the value.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: ?Sized> WeakHandle<T> {
    pub fn from_weak(inner: Weak<T>) -> Self {
        Self { inner }
    }

    /// Recover a strong handle if the owner is still alive.
    pub fn upgrade(&self) -> Option<Handle<T>> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }

    /// Whether the owner has been destroyed.
    pub fn is_dead(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl<T> WeakHandle<T> {
    /// A handle that never upgrades.
    pub fn dangling() -> Self {
        Self { inner: Weak::new() }
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self { inner: Weak::clone(&self.inner) }
    }
}

impl<T: ?Sized> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> From<Arc<T>> for Handle<T> {
    fn from(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl<T: ?Sized> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakHandle(alive={})", !self.is_dead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_does_not_extend_lifetime() {
        let h = Handle::new(42u32);
        let w = h.downgrade();
        assert_eq!(*w.upgrade().unwrap(), 42);

        drop(h);
        assert!(w.is_dead());
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn test_identity() {
        let a = Handle::new(1u8);
        let b = a.clone();
        let c = Handle::new(1u8);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), b.id());
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.strong_count(), 2);
    }

    #[test]
    fn test_new_cyclic() {
        struct Node {
            this: WeakHandle<Node>,
        }
        let n = Handle::new_cyclic(|w| Node { this: w.clone() });
        assert!(n.this.upgrade().unwrap().ptr_eq(&n));
        assert!(WeakHandle::<Node>::dangling().upgrade().is_none());
    }
}
