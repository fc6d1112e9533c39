//! # iochan - per-thread I/O channels and stackable block devices
//!
//! A message-passing substrate in the style of storage-stack SDKs:
//! cooperative logical threads exchange closures, devices hand out one
//! reference-counted channel per thread, and block devices stack on top of
//! each other with ordered teardown when a base goes away.
//!
//! ## Quick Start
//!
//! ```ignore
//! use iochan::{Reactor, ReactorConfig};
//! use iochan::bdev::{bdev_open, bdev_get_io_channel, create_malloc_disk};
//!
//! iochan::init_logging();
//! let reactor = Reactor::spawn(ReactorConfig::from_env("app"))?;
//! reactor.call(|| {
//!     create_malloc_disk("Malloc0", 1024, 512)?;
//!     let desc = bdev_open("Malloc0", true, None)?;
//!     let ch = bdev_get_io_channel(&desc)?;
//!     // submit I/O on `ch` from this thread ...
//!     Ok::<_, iochan::bdev::BdevError>(())
//! })??;
//! reactor.join();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 iochan-bdev (block layer)                   │
//! │     bdevs, descriptors, claims, malloc, vbdev, passthru     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 iochan-thread (substrate)                   │
//! │  threads + messages, devices, channels, for-each walks      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Reactor (this crate)                        │
//! │      one OS thread per logical thread, futex parking        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod logging;
pub mod parking;
pub mod reactor;

pub use logging::init_logging;
pub use reactor::{Reactor, ReactorConfig};

pub use iochan_bdev as bdev;
pub use iochan_thread as thread;

pub use iochan_core::env;
pub use iochan_core::{DeviceId, Error, PollStatus, Result, ThreadId, ThreadState};
pub use iochan_thread::{
    allocate_thread, for_each_channel, for_each_thread, free_thread, get_io_channel,
    get_thread, put_io_channel, register_device, register_poller, send_msg,
    unregister_device, ChannelIter, IoChannel, IoDevice, Thread, ThreadLibConfig,
};
