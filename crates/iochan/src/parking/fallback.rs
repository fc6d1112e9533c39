//! Condvar-based reactor parking for platforms without futex

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::Parker;

pub struct CondvarParker {
    /// wake pending
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl CondvarParker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Default for CondvarParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker for CondvarParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            match timeout {
                Some(t) => {
                    self.condvar.wait_for(&mut pending, t);
                }
                None => self.condvar.wait(&mut pending),
            }
        }
        std::mem::replace(&mut *pending, false)
    }

    fn unpark(&self) {
        let mut pending = self.pending.lock();
        if !*pending {
            *pending = true;
            self.condvar.notify_one();
        }
    }
}
