//! Error types for the thread and channel substrate

use crate::id::{DeviceId, ThreadId};

/// Result type for substrate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by thread, device and channel operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device with this identity is already registered
    #[error("device {0} is already registered")]
    AlreadyRegistered(DeviceId),

    /// No device with this identity is registered
    #[error("device {0} is not registered")]
    DeviceNotFound(DeviceId),

    /// The device is being unregistered and accepts no new users
    #[error("device '{0}' is being unregistered")]
    DeviceUnregistering(String),

    /// The operation must run on a logical thread
    #[error("not called from a logical thread")]
    NotOnThread,

    /// The target thread has exited
    #[error("thread '{0}' has exited")]
    ThreadExited(String),

    /// The thread is already being run by another OS thread
    #[error("thread '{0}' is active on another OS thread")]
    ThreadBusy(String),

    /// The thread limit configured at init was reached
    #[error("thread limit of {0} reached")]
    TooManyThreads(usize),

    /// The operation must run on the channel's owning thread
    #[error("called on thread {actual}, owner is thread {expected}")]
    WrongThread { expected: ThreadId, actual: ThreadId },

    /// A device's create-channel callback failed
    #[error("failed to create channel for device '{device}'")]
    ChannelCreate {
        device: String,
        #[source]
        source: Box<Error>,
    },

    /// Channel context is of a different type than requested
    #[error("channel context is not a {expected}")]
    ContextType { expected: &'static str },

    /// Channel context is already borrowed or was torn down
    #[error("channel context of device '{0}' is unavailable")]
    ContextBusy(String),

    /// The per-thread poller limit was reached
    #[error("poller limit of {0} reached")]
    TooManyPollers(usize),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A module-defined failure
    #[error("{0}")]
    Module(String),
}

impl Error {
    /// Wrap a create-channel failure of `device`
    pub fn channel_create(device: impl Into<String>, source: Error) -> Self {
        Error::ChannelCreate {
            device: device.into(),
            source: Box::new(source),
        }
    }

    /// Innermost cause of a nested channel-creation failure
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ChannelCreate { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
