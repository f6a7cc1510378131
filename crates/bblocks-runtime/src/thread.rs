//! Runtime threads and their execution context
//!
//! Every thread started by bblocks (scheduler workers, the epoll reactor,
//! AIO pollers) goes through [`Thread::spawn`]. The thread-local
//! [`ThreadCtx`] is installed before the thread's main function runs and
//! removed after it returns or unwinds, so code asking "which runtime
//! thread am I on" never sees a half-built or torn-down context.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use bblocks_core::{kdebug, kwarn, Error, Result};

/// What a runtime thread is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Scheduler worker with its pool index
    Worker(usize),
    /// Socket readiness reactor
    Reactor,
    /// Block-device completion poller with its ring index
    AioPoller(usize),
    /// Anything else started through `Thread::spawn`
    Other,
}

/// Per-thread execution context.
#[derive(Debug, Clone)]
pub struct ThreadCtx {
    id: usize,
    name: String,
    role: ThreadRole,
}

impl ThreadCtx {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> ThreadRole {
        self.role
    }
}

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT: RefCell<Option<ThreadCtx>> = const { RefCell::new(None) };
}

/// Removes the context on thread exit, including unwinding.
struct CtxGuard;

impl CtxGuard {
    fn init(ctx: ThreadCtx) -> Self {
        kdebug!("thread {} ({}) init", ctx.name, ctx.id);
        CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
        CtxGuard
    }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        let ctx = CURRENT.with(|c| c.borrow_mut().take());
        if let Some(ctx) = ctx {
            kdebug!("thread {} ({}) cleanup", ctx.name, ctx.id);
        }
    }
}

/// Context of the calling thread, `None` outside runtime threads.
pub fn current() -> Option<ThreadCtx> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Role of the calling thread.
pub fn current_role() -> Option<ThreadRole> {
    CURRENT.with(|c| c.borrow().as_ref().map(|ctx| ctx.role))
}

/// Pool index if the calling thread is a scheduler worker.
pub fn current_worker() -> Option<usize> {
    match current_role() {
        Some(ThreadRole::Worker(i)) => Some(i),
        _ => None,
    }
}

/// A named OS thread carrying a [`ThreadCtx`].
pub struct Thread {
    id: usize,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Start `main` on a new OS thread.
    pub fn spawn<F>(name: impl Into<String>, role: ThreadRole, main: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let ctx = ThreadCtx {
            id,
            name: name.clone(),
            role,
        };

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = CtxGuard::init(ctx);
                main();
            })
            .map_err(Error::from)?;

        Ok(Thread {
            id,
            name,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread's main function to return.
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                kwarn!("{}: join from own thread skipped", self.name);
                return;
            }
            if handle.join().is_err() {
                kwarn!("{}: thread panicked", self.name);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_context_visible_inside_thread() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn("bb-test-ctx", ThreadRole::Worker(3), move || {
            let ctx = current().unwrap();
            tx.send((ctx.name().to_string(), ctx.role(), current_worker())).unwrap();
        })
        .unwrap();
        t.join();

        let (name, role, worker) = rx.recv().unwrap();
        assert_eq!(name, "bb-test-ctx");
        assert_eq!(role, ThreadRole::Worker(3));
        assert_eq!(worker, Some(3));
    }

    #[test]
    fn test_no_context_outside_runtime_threads() {
        assert!(current().is_none());
        assert_eq!(current_worker(), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Thread::spawn("bb-a", ThreadRole::Other, || {}).unwrap();
        let b = Thread::spawn("bb-b", ThreadRole::Other, || {}).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
