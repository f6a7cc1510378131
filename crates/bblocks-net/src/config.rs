//! Reactor configuration

use std::time::Duration;

use bblocks_core::env::env_get;
use bblocks_runtime::ConfigError;

pub mod defaults {
    /// Events fetched per `epoll_wait`
    pub const MAX_EVENTS: usize = 256;
    /// Upper bound on a single `epoll_wait` sleep
    pub const TIMEOUT_MS: u64 = 100;
}

#[derive(Debug, Clone)]
pub struct EpollConfig {
    pub max_events: usize,
    /// Bounds how long shutdown waits for the reactor to notice
    pub timeout: Duration,
}

impl Default for EpollConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EpollConfig {
    /// - `BB_EPOLL_MAX_EVENTS` - Events per wait
    /// - `BB_EPOLL_TIMEOUT_MS` - Wait timeout in milliseconds
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("BB_EPOLL_MAX_EVENTS", defaults::MAX_EVENTS),
            timeout: Duration::from_millis(env_get("BB_EPOLL_TIMEOUT_MS", defaults::TIMEOUT_MS)),
        }
    }

    pub fn new() -> Self {
        Self {
            max_events: defaults::MAX_EVENTS,
            timeout: Duration::from_millis(defaults::TIMEOUT_MS),
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_events > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_events must fit in i32"));
        }
        if self.timeout.as_millis() > i32::MAX as u128 {
            return Err(ConfigError::InvalidValue("timeout too large"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(EpollConfig::new().validate().is_ok());
        assert!(EpollConfig::new().max_events(0).validate().is_err());
        let c = EpollConfig::new().max_events(8).timeout(Duration::from_millis(5));
        assert_eq!(c.max_events, 8);
        assert_eq!(c.timeout, Duration::from_millis(5));
    }
}
