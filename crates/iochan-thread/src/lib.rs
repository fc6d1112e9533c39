//! # iochan-thread
//!
//! The thread and channel substrate.
//!
//! This crate provides:
//! - Logical threads with message queues and pollers (`thread`, `poller`)
//! - The process-wide device registry (`device`)
//! - Per-thread, reference-counted I/O channels (`channel`)
//! - Serialized for-each-channel / for-each-thread walks (`iter`)
//! - A deterministic driver for tests and tools (`sim`)
//!
//! The crate never spawns OS threads. The embedder allocates logical threads
//! and decides where and when each one is polled.

pub mod channel;
pub mod config;
pub mod device;
pub mod iter;
mod local;
pub mod poller;
mod registry;
pub mod sim;
pub mod thread;
pub mod tls;

// Re-exports
pub use channel::{
    get_io_channel, io_channel_get_device, io_channel_get_thread, io_channel_ref_count,
    put_io_channel, IoChannel,
};
pub use config::ThreadLibConfig;
pub use device::{
    device_channel_type, device_name, device_ref_count, io_device_count, io_device_exists,
    register_device, unregister_device, IoDevice,
};
pub use iter::{for_each_channel, for_each_thread, ChannelIter};
pub use poller::{register_poller, Poller};
pub use registry::{config, lib_fini, lib_init, UnregisterFn};
pub use thread::{
    allocate_thread, app_thread, free_thread, get_thread, get_thread_by_id, send_msg,
    thread_count, Deliver, Msg, PollDriven, Thread, ThreadGuard, ThreadStats,
};

pub use iochan_core::{DeviceId, Error, PollStatus, PollerState, Result, ThreadId, ThreadState};
