//! Reactor parking
//!
//! A reactor sleeps in `park()` when its logical thread is idle. Every
//! `send_msg` to that thread calls `unpark()` through the thread's delivery
//! hook. Platform-specific implementations use the cheapest primitive
//! available.

use std::time::Duration;

/// Sleep/wake for the single OS thread hosting a reactor
///
/// An `unpark()` that happens before `park()` is not lost: the next
/// `park()` returns immediately and consumes it.
pub trait Parker: Send + Sync {
    /// Sleep until unparked or until `timeout` elapses
    ///
    /// Returns `true` if a wake was consumed. The caller re-checks for work
    /// either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake the parked thread, or make its next `park()` return at once
    fn unpark(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParker as PlatformParker;
    } else {
        mod fallback;
        pub use fallback::CondvarParker as PlatformParker;
    }
}
