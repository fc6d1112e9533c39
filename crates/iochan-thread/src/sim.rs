//! Deterministic single-OS-thread driver
//!
//! `SimHarness` allocates logical threads that are only ever polled from
//! the calling OS thread, which makes cross-thread protocols reproducible
//! in tests and tools. Harnesses are serialised process-wide since they
//! share the thread and device registry.

use parking_lot::{Mutex, MutexGuard};

use crate::thread::{allocate_thread, free_thread, PollDriven, Thread, ThreadGuard};

static SERIAL: Mutex<()> = Mutex::new(());

/// Upper bound on polls of one thread per `poll_thread` call
const MAX_POLLS: usize = 100_000;

pub struct SimHarness {
    threads: Vec<Thread>,
    current: Option<ThreadGuard>,
    _serial: MutexGuard<'static, ()>,
}

impl SimHarness {
    /// Allocate `count` threads named `sim0`, `sim1`, …
    pub fn new(count: usize) -> Self {
        let serial = SERIAL.lock();
        let threads = (0..count)
            .filter_map(|i| allocate_thread(PollDriven, Some(&format!("sim{}", i))).ok())
            .collect();
        Self {
            threads,
            current: None,
            _serial: serial,
        }
    }

    /// Take over a thread allocated elsewhere; it is freed with the harness
    pub fn adopt(&mut self, thread: Thread) -> usize {
        self.threads.push(thread);
        self.threads.len() - 1
    }

    pub fn thread(&self, index: usize) -> &Thread {
        &self.threads[index]
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Make thread `index` current for direct calls
    pub fn set_thread(&mut self, index: usize) {
        self.current = None;
        self.current = self.threads[index].enter().ok();
    }

    pub fn clear_thread(&mut self) {
        self.current = None;
    }

    /// Poll thread `index` until it reports idle; returns the busy polls
    pub fn poll_thread(&mut self, index: usize) -> usize {
        let thread = &self.threads[index];
        let mut busy = 0;
        while busy < MAX_POLLS {
            match thread.poll() {
                Ok(status) if status.is_busy() => busy += 1,
                _ => break,
            }
        }
        busy
    }

    /// Poll every thread until all of them are idle
    pub fn poll_threads(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut busy = 0;
            for index in 0..self.threads.len() {
                busy += self.poll_thread(index);
            }
            if busy == 0 {
                return total;
            }
            total += busy;
        }
    }
}

impl Drop for SimHarness {
    fn drop(&mut self) {
        self.current = None;
        for thread in self.threads.drain(..) {
            free_thread(&thread);
        }
    }
}
