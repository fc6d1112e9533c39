//! Thread and poller state types

use core::fmt;

/// Lifecycle state of a logical thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Accepting messages and running pollers
    Running = 0,

    /// `exit()` was requested; still draining messages, pollers and channels
    Exiting = 1,

    /// Nothing left to run; may be freed
    Exited = 2,
}

impl ThreadState {
    /// Whether new messages may be queued to a thread in this state
    #[inline]
    pub const fn accepts_messages(&self) -> bool {
        !matches!(self, ThreadState::Exited)
    }

    #[inline]
    pub const fn is_running(&self) -> bool {
        matches!(self, ThreadState::Running)
    }
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Running,
            1 => ThreadState::Exiting,
            _ => ThreadState::Exited,
        }
    }
}

impl From<ThreadState> for u8 {
    fn from(state: ThreadState) -> u8 {
        state as u8
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadState::Running => "running",
            ThreadState::Exiting => "exiting",
            ThreadState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// State of a registered poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    /// Waiting for its next run
    Waiting = 0,

    /// Skipped by the thread until resumed
    Paused = 1,

    /// Removed from the thread at the next poll
    Unregistered = 2,
}

impl From<u8> for PollerState {
    fn from(v: u8) -> Self {
        match v {
            0 => PollerState::Waiting,
            1 => PollerState::Paused,
            _ => PollerState::Unregistered,
        }
    }
}

impl From<PollerState> for u8 {
    fn from(state: PollerState) -> u8 {
        state as u8
    }
}

/// Outcome of one poll of a thread or poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollStatus {
    /// Nothing was done
    #[default]
    Idle,

    /// Some work was done
    Busy,
}

impl PollStatus {
    #[inline]
    pub const fn is_busy(&self) -> bool {
        matches!(self, PollStatus::Busy)
    }

    /// Busy if either side was busy
    #[inline]
    pub const fn merge(self, other: PollStatus) -> PollStatus {
        match (self, other) {
            (PollStatus::Idle, PollStatus::Idle) => PollStatus::Idle,
            _ => PollStatus::Busy,
        }
    }
}

impl From<bool> for PollStatus {
    #[inline]
    fn from(busy: bool) -> Self {
        if busy {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }
}
