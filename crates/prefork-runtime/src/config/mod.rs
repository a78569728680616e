//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use prefork_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .aio_threads(4)
//!     .wait_signal(false);
//! ```

pub mod defaults;

use prefork_core::env::{env_get, env_get_bool};
use prefork_core::error::{Error, Result};
use std::time::Duration;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Async pool thread count
    pub aio_threads: usize,
    /// Async events in flight before `dispatch()` refuses
    pub aio_max_pending: usize,
    /// Default read size for worker pipes
    pub read_buffer_size: usize,
    /// Keep the reactor running while signal handlers are armed
    pub wait_signal: bool,
    /// Longest single poll(2) wait
    pub poll_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PREFORK_AIO_THREADS` - Async pool thread count
    /// - `PREFORK_AIO_MAX_PENDING` - Async events in flight
    /// - `PREFORK_READ_BUFFER` - Default worker read size
    /// - `PREFORK_WAIT_SIGNAL` - Keep the loop alive for armed signals (0/1)
    /// - `PREFORK_POLL_TIMEOUT_MS` - poll(2) timeout in milliseconds
    pub fn from_env() -> Self {
        Self {
            aio_threads: env_get("PREFORK_AIO_THREADS", defaults::aio_threads()),
            aio_max_pending: env_get("PREFORK_AIO_MAX_PENDING", defaults::AIO_MAX_PENDING),
            read_buffer_size: env_get("PREFORK_READ_BUFFER", defaults::READ_BUFFER_SIZE),
            wait_signal: env_get_bool("PREFORK_WAIT_SIGNAL", defaults::WAIT_SIGNAL),
            poll_timeout: Duration::from_millis(env_get(
                "PREFORK_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
        }
    }

    /// Defaults only, no environment lookups
    pub fn new() -> Self {
        Self {
            aio_threads: defaults::aio_threads(),
            aio_max_pending: defaults::AIO_MAX_PENDING,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            wait_signal: defaults::WAIT_SIGNAL,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn aio_threads(mut self, n: usize) -> Self {
        self.aio_threads = n;
        self
    }

    pub fn aio_max_pending(mut self, n: usize) -> Self {
        self.aio_max_pending = n;
        self
    }

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    pub fn wait_signal(mut self, enable: bool) -> Self {
        self.wait_signal = enable;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.aio_threads == 0 {
            return Err(Error::InvalidParams("aio_threads must be > 0"));
        }
        if self.aio_max_pending == 0 {
            return Err(Error::InvalidParams("aio_max_pending must be > 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::InvalidParams("read_buffer_size must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        prefork_core::kprintln!("prefork runtime configuration:");
        prefork_core::kprintln!("  aio_threads:       {}", self.aio_threads);
        prefork_core::kprintln!("  aio_max_pending:   {}", self.aio_max_pending);
        prefork_core::kprintln!("  read_buffer_size:  {}", self.read_buffer_size);
        prefork_core::kprintln!("  wait_signal:       {}", self.wait_signal);
        prefork_core::kprintln!("  poll_timeout:      {:?}", self.poll_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.aio_threads >= defaults::AIO_THREADS_MIN);
        assert!(config.aio_threads <= defaults::AIO_THREADS_MAX);
        assert_eq!(config.read_buffer_size, 8192);
        assert!(config.wait_signal);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .aio_threads(3)
            .aio_max_pending(16)
            .wait_signal(false)
            .poll_timeout(Duration::from_millis(5));
        assert_eq!(config.aio_threads, 3);
        assert_eq!(config.aio_max_pending, 16);
        assert!(!config.wait_signal);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("PREFORK_AIO_MAX_PENDING", "7");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("PREFORK_AIO_MAX_PENDING");
        assert_eq!(config.aio_max_pending, 7);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(RuntimeConfig::new().aio_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().aio_max_pending(0).validate().is_err());
    }
}
