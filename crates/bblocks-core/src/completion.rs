//! Completion handlers and the async-processor contract
//!
//! Every asynchronous producer in bblocks follows the same protocol:
//!
//! ```text
//!   start(request, Completion<T>) -> Result<()>
//!       Err(e)  -> completion dropped, never invoked
//!       Ok(())  -> completion accepted into a Pending<T>,
//!                  invoked exactly once later, possibly on another thread
//!
//!   stop(StopHandler) -> Result<()>
//!       no new starts accepted; every Pending resolved (Aborted if not
//!       done); stop handler fires after the last of them
//! ```
//!
//! A `Completion` is inert until accepted. Dropping it is how a component
//! rejects a request. A `Pending` is the accepted form and must be
//! completed exactly once; dropping one uncompleted halts the process.

use std::fmt;
use std::sync::mpsc;

use crate::error::Result;

type HandlerFn<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A handler offered to a `start`-style call.
#[must_use = "a completion does nothing unless handed to an operation"]
pub struct Completion<T> {
    f: HandlerFn<T>,
}

/// Handler fired when a component's stop barrier completes.
pub type StopHandler = Completion<()>;

impl<T: 'static> Completion<T> {
    pub fn new(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// Handler that ignores its result.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Accept the request. From here on the handler must fire exactly once.
    pub fn accept(self) -> Pending<T> {
        Pending { f: Some(self.f) }
    }

    /// Wrap this handler so it receives `U`, translated by `map`.
    ///
    /// If the returned completion is rejected, this one is rejected with it.
    pub fn map<U: 'static>(self, map: impl FnOnce(U) -> T + Send + 'static) -> Completion<U> {
        let f = self.f;
        Completion::new(move |u| f(map(u)))
    }
}

impl<T: Send + 'static> Completion<T> {
    /// A completion that forwards its result into a channel.
    pub fn channel() -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel();
        let c = Self::new(move |v| {
            let _ = tx.send(v);
        });
        (c, rx)
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// An accepted operation's handler.
pub struct Pending<T> {
    f: Option<HandlerFn<T>>,
}

impl<T> Pending<T> {
    /// Fire the handler. Consumes the pending operation.
    pub fn complete(mut self, value: T) {
        match self.f.take() {
            Some(f) => f(value),
            None => crate::deadend!(),
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        if self.f.is_some() && !std::thread::panicking() {
            crate::kprint::_invariant_failed(
                "pending operation dropped without completion",
                file!(),
                line!(),
                None,
            );
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pending")
    }
}

/// Contract shared by every I/O-producing component.
///
/// A caller must call `stop` and wait for its handler before releasing the
/// component. Once the handler has fired no handler previously accepted by
/// the component will run again.
pub trait AsyncProcessor: Send + Sync {
    /// Fully-qualified name used in log lines.
    fn fqn(&self) -> String;

    /// Begin teardown. Fails with `Error::Stopped` if already stopping.
    fn stop(&self, done: StopHandler) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_accept_and_complete() {
        let (c, rx) = Completion::<u32>::channel();
        let p = c.accept();
        p.complete(7);
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_rejected_completion_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let c = Completion::<()>::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(c);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_map_translates_result() {
        let (c, rx) = Completion::<String>::channel();
        let mapped = c.map(|n: usize| format!("{} bytes", n));
        mapped.accept().complete(512);
        assert_eq!(rx.recv().unwrap(), "512 bytes");
    }

    #[test]
    fn test_completion_crosses_threads() {
        let (c, rx) = Completion::<u64>::channel();
        let p = c.accept();
        std::thread::spawn(move || p.complete(0xfeaf)).join().unwrap();
        assert_eq!(rx.recv().unwrap(), 0xfeaf);
    }
}
