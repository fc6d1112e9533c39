//! Environment variable utilities
//!
//! Every tunable of the substrate has a compile-time default that can be
//! overridden at runtime with an `IOCHAN_*` variable.
//!
//! # Usage
//!
//! ```ignore
//! use iochan_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let batch: usize = env_get("IOCHAN_MSG_BATCH", 8);
//! let timeout = env_get_millis("IOCHAN_EXIT_TIMEOUT_MS", 5000);
//! let pin: bool = env_get_bool("IOCHAN_REACTOR_PIN", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and values that fail to parse both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; an unset variable returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Get a microsecond count as a `Duration`
#[inline]
pub fn env_get_micros(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}
