//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use bblocks_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env().num_workers(4);
//! config.validate()?;
//! ```

use std::time::Duration;

use bblocks_core::env::env_get;

/// Library defaults
pub mod defaults {
    /// Worker threads in the scheduler pool
    pub const NUM_WORKERS: usize = 4;
    /// Upper bound on pool size
    pub const MAX_WORKERS: usize = 256;
    /// Idle worker re-check interval
    pub const PARK_TIMEOUT_MS: u64 = 100;
}

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Maximum time an idle worker sleeps before re-checking its queue
    pub park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Defaults with environment overrides.
    ///
    /// - `BB_NUM_WORKERS` - Number of worker threads
    /// - `BB_PARK_TIMEOUT_MS` - Idle park timeout in milliseconds
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("BB_NUM_WORKERS", defaults::NUM_WORKERS),
            park_timeout: Duration::from_millis(env_get(
                "BB_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
        }
    }

    /// Explicit defaults, no env override.
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
        }
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for bblocks_core::Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue(msg) => bblocks_core::Error::InvalidArgument(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SchedulerConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .num_workers(8)
            .park_timeout(Duration::from_millis(5));
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.park_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_validation() {
        assert!(SchedulerConfig::new().num_workers(0).validate().is_err());
        assert!(SchedulerConfig::new().num_workers(1000).validate().is_err());
        assert_eq!(
            SchedulerConfig::new().park_timeout(Duration::ZERO).validate(),
            Err(ConfigError::InvalidValue("park_timeout must be > 0"))
        );
    }
}
