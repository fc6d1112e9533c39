//! OS-thread host for a logical thread
//!
//! A [`Reactor`] allocates a logical thread whose delivery hook unparks a
//! dedicated OS thread, then polls the logical thread on that OS thread
//! until it exits:
//!
//! ```text
//!   send_msg(t, f) ──► msg queue ──► deliver ──► parker.unpark()
//!                                                     │
//!   reactor OS thread:  loop { poll() while busy; park(timeout) } ◄┘
//! ```
//!
//! Idle reactors sleep for at most `park_timeout` so timed pollers keep
//! running without any message traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use iochan_core::env::{env_get_micros, env_get_opt};
use iochan_core::{Error, PollStatus, Result};
use iochan_thread::{allocate_thread, free_thread, Thread};

use crate::parking::{Parker, PlatformParker};

/// Default idle sleep between polls, in microseconds
pub const DEFAULT_PARK_US: u64 = 1000;

/// Reactor configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Name of both the logical thread and the OS thread
    pub name: String,
    /// Longest sleep while idle
    pub park_timeout: Duration,
    /// CPU to pin the OS thread to
    pub cpu: Option<usize>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::new("reactor")
    }
}

impl ReactorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            park_timeout: Duration::from_micros(DEFAULT_PARK_US),
            cpu: None,
        }
    }

    /// Defaults with environment overrides:
    /// - `IOCHAN_REACTOR_PARK_US` - Longest idle sleep in microseconds
    /// - `IOCHAN_REACTOR_CPU` - CPU to pin to
    pub fn from_env(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            park_timeout: env_get_micros("IOCHAN_REACTOR_PARK_US", DEFAULT_PARK_US),
            cpu: env_get_opt("IOCHAN_REACTOR_CPU"),
        }
    }

    pub fn park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }

    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }
}

/// A logical thread running on its own OS thread
pub struct Reactor {
    thread: Thread,
    parker: Arc<PlatformParker>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Allocate the logical thread and start polling it
    pub fn spawn(config: ReactorConfig) -> Result<Reactor> {
        let parker = Arc::new(PlatformParker::new());
        let waker = Arc::clone(&parker);
        let thread = allocate_thread(move |_: &Thread| waker.unpark(), Some(&config.name))?;
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let thread = thread.clone();
            let parker = Arc::clone(&parker);
            let stop = Arc::clone(&stop);
            let config = config.clone();
            std::thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || run(thread, parker, stop, config))
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                free_thread(&thread);
                return Err(Error::Module(format!("reactor '{}' spawn failed: {}", config.name, err)));
            }
        };

        info!(reactor = %config.name, cpu = ?config.cpu, "reactor started");
        Ok(Reactor {
            thread,
            parker,
            stop,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Queue `f` on the reactor's thread
    pub fn send_msg<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.thread.send_msg(f)
    }

    /// Run `f` on the reactor's thread and wait for its result.
    ///
    /// Must not be called from the reactor's own thread.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.thread.is_current() {
            return Err(Error::ThreadBusy(self.thread.name().to_string()));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.thread.send_msg(move || {
            let _ = tx.send(f());
        })?;
        rx.recv()
            .map_err(|_| Error::ThreadExited(self.thread.name().to_string()))
    }

    /// Ask the thread to exit; it keeps polling until drained
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            debug!(reactor = %self.thread.name(), "reactor stop requested");
            self.thread.exit();
            self.parker.unpark();
        }
    }

    /// Stop, wait for the OS thread, and free the logical thread
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop();
        if handle.join().is_err() {
            error!(reactor = %self.thread.name(), "reactor thread panicked");
        }
        free_thread(&self.thread);
        info!(reactor = %self.thread.name(), "reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(thread: Thread, parker: Arc<PlatformParker>, stop: Arc<AtomicBool>, config: ReactorConfig) {
    if let Some(cpu) = config.cpu {
        if let Err(err) = pin_to_cpu(cpu) {
            warn!(reactor = %config.name, cpu, error = %err, "cpu pinning failed");
        }
    }

    loop {
        match thread.poll() {
            Ok(PollStatus::Busy) => continue,
            Ok(PollStatus::Idle) => {}
            Err(err) => {
                error!(reactor = %config.name, error = %err, "reactor poll failed");
                break;
            }
        }
        if thread.is_exited() {
            break;
        }
        if stop.load(Ordering::Acquire) {
            // keep draining while exiting, without sleeping the full timeout
            parker.park(Some(config.park_timeout.min(Duration::from_millis(1))));
        } else {
            parker.park(Some(config.park_timeout));
        }
    }
    debug!(reactor = %config.name, stats = ?thread.stats(), "reactor loop done");
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
            if cpu >= libc::CPU_SETSIZE as usize {
                return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
            }
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET(cpu, &mut set);
                if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        }
    } else {
        fn pin_to_cpu(_cpu: usize) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "cpu pinning is only supported on linux",
            ))
        }
    }
}
