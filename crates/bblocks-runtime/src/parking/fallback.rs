//! Condvar-based parking for platforms without futex

use super::WorkerParking;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct FallbackParking {
    /// wake token
    token: Mutex<bool>,
    condvar: Condvar,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut guard = match self.token.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*guard {
            guard = match timeout {
                Some(t) => match self.condvar.wait_timeout(guard, t) {
                    Ok((g, _)) => g,
                    Err(poisoned) => poisoned.into_inner().0,
                },
                None => match self.condvar.wait(guard) {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
        std::mem::replace(&mut *guard, false)
    }

    fn unpark(&self) {
        {
            let mut guard = match self.token.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = true;
        }
        self.condvar.notify_one();
    }
}
