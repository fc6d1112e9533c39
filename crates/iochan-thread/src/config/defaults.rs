//! Library defaults for [`ThreadLibConfig`](super::ThreadLibConfig)

/// Messages drained from a thread's queue per poll
pub const MSG_BATCH_SIZE: usize = 8;

/// Grace period for an exiting thread before it is forced to exited
pub const EXIT_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on concurrently allocated threads
pub const MAX_THREADS: usize = 1024;

/// Upper bound on pollers registered on one thread
pub const MAX_POLLERS: usize = 256;
