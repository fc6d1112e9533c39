//! Thread library configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the config passed to [`lib_init`](crate::lib_init)
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use iochan_thread::config::ThreadLibConfig;
//!
//! let config = ThreadLibConfig::from_env()
//!     .msg_batch_size(16)
//!     .exit_timeout(Duration::from_secs(1));
//! iochan_thread::lib_init(config)?;
//! ```

pub mod defaults;

use std::time::Duration;

use iochan_core::env::{env_get, env_get_millis};

/// Thread library configuration with builder pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLibConfig {
    /// Messages drained per `Thread::poll`
    pub msg_batch_size: usize,
    /// How long an exiting thread may take to drain before it is forced to exited
    pub exit_timeout: Duration,
    /// Maximum number of allocated threads
    pub max_threads: usize,
    /// Maximum number of pollers per thread
    pub max_pollers: usize,
}

impl Default for ThreadLibConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadLibConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `IOCHAN_MSG_BATCH` - Messages drained per poll
    /// - `IOCHAN_EXIT_TIMEOUT_MS` - Exit grace period in milliseconds
    /// - `IOCHAN_MAX_THREADS` - Maximum allocated threads
    /// - `IOCHAN_POLLER_BUDGET` - Maximum pollers per thread
    pub fn from_env() -> Self {
        Self {
            msg_batch_size: env_get("IOCHAN_MSG_BATCH", defaults::MSG_BATCH_SIZE),
            exit_timeout: env_get_millis("IOCHAN_EXIT_TIMEOUT_MS", defaults::EXIT_TIMEOUT_MS),
            max_threads: env_get("IOCHAN_MAX_THREADS", defaults::MAX_THREADS),
            max_pollers: env_get("IOCHAN_POLLER_BUDGET", defaults::MAX_POLLERS),
        }
    }

    /// Create config with library defaults (no env override).
    pub const fn new() -> Self {
        Self {
            msg_batch_size: defaults::MSG_BATCH_SIZE,
            exit_timeout: Duration::from_millis(defaults::EXIT_TIMEOUT_MS),
            max_threads: defaults::MAX_THREADS,
            max_pollers: defaults::MAX_POLLERS,
        }
    }

    // Builder methods

    pub fn msg_batch_size(mut self, n: usize) -> Self {
        self.msg_batch_size = n;
        self
    }

    pub fn exit_timeout(mut self, d: Duration) -> Self {
        self.exit_timeout = d;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn max_pollers(mut self, n: usize) -> Self {
        self.max_pollers = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.msg_batch_size == 0 {
            return Err("msg_batch_size must be > 0");
        }
        if self.max_threads == 0 {
            return Err("max_threads must be > 0");
        }
        if self.max_pollers == 0 {
            return Err("max_pollers must be > 0");
        }
        Ok(())
    }
}
