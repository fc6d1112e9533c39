//! Linux futex-based reactor parking
//!
//! Futex word semantics:
//! - 0 = no wake pending
//! - 1 = wake pending
//!
//! `unpark` swaps the word to 1 and issues FUTEX_WAKE only on the 0 -> 1
//! edge. `park` consumes a pending wake without sleeping, otherwise
//! FUTEX_WAITs on 0, so a wake racing with the wait makes the kernel
//! return EAGAIN instead of sleeping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::Parker;

pub struct FutexParker {
    futex: AtomicU32,
}

impl FutexParker {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
        }
    }
}

impl Default for FutexParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for FutexParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        if self.futex.swap(0, Ordering::Acquire) == 1 {
            return true;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // Relative timeout; returns on wake, timeout, EAGAIN or EINTR.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }

        self.futex.swap(0, Ordering::Acquire) == 1
    }

    fn unpark(&self) {
        if self.futex.swap(1, Ordering::Release) == 1 {
            return;
        }
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}
