//! Component lifecycle
//!
//! ```text
//!   Running ──stop()──► Stopping ──barrier──► Stopped
//! ```
//!
//! Transitions only move forward. Components keep a `Lifecycle` inside the
//! same `SpinLock` that guards their pending operations so that "accepting"
//! and "queued" are always decided together.

use crate::completion::{Pending, StopHandler};
use crate::error::{Error, Result};
use crate::spinlock::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Running,
    Stopping,
    Stopped,
}

impl Lifecycle {
    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self, Lifecycle::Running)
    }

    /// Fail with `Stopped` unless new operations may be accepted.
    #[inline]
    pub fn check_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Stopped)
        }
    }

    /// Running -> Stopping. A second stop is rejected.
    pub fn begin_stop(&mut self) -> Result<()> {
        self.check_running()?;
        *self = Lifecycle::Stopping;
        Ok(())
    }

    /// Stopping -> Stopped.
    pub fn finish_stop(&mut self) {
        crate::invariant!(*self == Lifecycle::Stopping, "finish_stop from {:?}", self);
        *self = Lifecycle::Stopped;
    }
}

struct BarrierState {
    lifecycle: Lifecycle,
    inflight: usize,
    stop: Option<Pending<()>>,
}

/// Counts in-flight operations and fires a stop handler once the count
/// drains after `stop`.
///
/// Used by layers that forward to another processor and so have no queue
/// of their own to walk on stop.
pub struct OpBarrier {
    state: SpinLock<BarrierState>,
}

impl OpBarrier {
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(BarrierState {
                lifecycle: Lifecycle::Running,
                inflight: 0,
                stop: None,
            }),
        }
    }

    /// Register one operation. Fails once stop has begun.
    pub fn enter(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.lifecycle.check_running()?;
        st.inflight += 1;
        Ok(())
    }

    /// Resolve one operation previously registered with `enter`.
    pub fn exit(&self) {
        let fire = {
            let mut st = self.state.lock();
            crate::invariant!(st.inflight > 0);
            st.inflight -= 1;
            Self::take_if_drained(&mut st)
        };
        if let Some(p) = fire {
            p.complete(());
        }
    }

    /// Stop accepting. `done` fires once every registered op has exited.
    pub fn stop(&self, done: StopHandler) -> Result<()> {
        let fire = {
            let mut st = self.state.lock();
            st.lifecycle.begin_stop()?;
            st.stop = Some(done.accept());
            Self::take_if_drained(&mut st)
        };
        if let Some(p) = fire {
            p.complete(());
        }
        Ok(())
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    fn take_if_drained(st: &mut BarrierState) -> Option<Pending<()>> {
        if st.inflight == 0 && st.lifecycle == Lifecycle::Stopping {
            st.lifecycle.finish_stop();
            st.stop.take()
        } else {
            None
        }
    }
}

impl Default for OpBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;

    #[test]
    fn test_transitions() {
        let mut lc = Lifecycle::default();
        assert!(lc.is_running());
        assert!(lc.begin_stop().is_ok());
        assert_eq!(lc.begin_stop(), Err(Error::Stopped));
        assert_eq!(lc.check_running(), Err(Error::Stopped));
        lc.finish_stop();
        assert_eq!(lc, Lifecycle::Stopped);
    }

    #[test]
    fn test_barrier_fires_after_drain() {
        let b = OpBarrier::new();
        b.enter().unwrap();
        b.enter().unwrap();

        let (done, rx) = Completion::<()>::channel();
        b.stop(done).unwrap();
        assert_eq!(b.enter(), Err(Error::Stopped));
        assert!(rx.try_recv().is_err());

        b.exit();
        assert!(rx.try_recv().is_err());
        b.exit();
        assert!(rx.try_recv().is_ok());
        assert_eq!(b.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn test_barrier_idle_stop_fires_immediately() {
        let b = OpBarrier::new();
        let (done, rx) = Completion::<()>::channel();
        b.stop(done).unwrap();
        assert!(rx.try_recv().is_ok());

        let (again, rx2) = Completion::<()>::channel();
        assert_eq!(b.stop(again), Err(Error::Stopped));
        assert!(rx2.try_recv().is_err());
    }
}
