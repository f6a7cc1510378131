//! AIO processor configuration

use bblocks_core::env::env_get;
use bblocks_runtime::ConfigError;

pub mod defaults {
    /// Poller threads, one ring each. Two keep a single spindle busy.
    pub const THREADS: usize = 2;
    /// Upper bound on poller threads
    pub const MAX_THREADS: usize = 64;
    /// Requests queued per ring ahead of the poller
    pub const MAX_EVENTS: usize = 1024;
    /// Submission queue entries per ring (power of two)
    pub const RING_ENTRIES: u32 = 256;
}

#[derive(Debug, Clone)]
pub struct AioConfig {
    pub threads: usize,
    pub max_events: usize,
    pub ring_entries: u32,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AioConfig {
    /// - `BB_AIO_THREADS` - Poller threads
    /// - `BB_AIO_MAX_EVENTS` - Queue depth per poller
    /// - `BB_AIO_RING_ENTRIES` - io_uring submission entries per poller
    pub fn from_env() -> Self {
        Self {
            threads: env_get("BB_AIO_THREADS", defaults::THREADS),
            max_events: env_get("BB_AIO_MAX_EVENTS", defaults::MAX_EVENTS),
            ring_entries: env_get("BB_AIO_RING_ENTRIES", defaults::RING_ENTRIES),
        }
    }

    pub fn new() -> Self {
        Self {
            threads: defaults::THREADS,
            max_events: defaults::MAX_EVENTS,
            ring_entries: defaults::RING_ENTRIES,
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.threads > defaults::MAX_THREADS {
            return Err(ConfigError::InvalidValue("threads must be <= 64"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if !self.ring_entries.is_power_of_two() || self.ring_entries < 8 {
            return Err(ConfigError::InvalidValue("ring_entries must be a power of two >= 8"));
        }
        if self.ring_entries > 32768 {
            return Err(ConfigError::InvalidValue("ring_entries must be <= 32768"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = AioConfig::new();
        assert_eq!(c.threads, 2);
        assert_eq!(c.max_events, 1024);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(AioConfig::new().threads(0).validate().is_err());
        assert!(AioConfig::new().threads(65).validate().is_err());
        assert!(AioConfig::new().max_events(0).validate().is_err());
        assert!(AioConfig::new().ring_entries(100).validate().is_err());
        assert!(AioConfig::new().ring_entries(4).validate().is_err());
        assert!(AioConfig::new().ring_entries(64).validate().is_ok());
    }
}
