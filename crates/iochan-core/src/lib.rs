//! # iochan-core
//!
//! Core types shared by the iochan crates.
//!
//! This crate has no runtime state. The thread substrate, device registry
//! and channel machinery live in `iochan-thread`; the block layer and
//! stackable modules live in `iochan-bdev`.
//!
//! ## Modules
//!
//! - `id` - Thread and device identifiers
//! - `state` - Thread, poller and poll-result states
//! - `error` - Error type shared by the substrate
//! - `env` - Environment variable utilities

pub mod env;
pub mod error;
pub mod id;
pub mod state;

pub use env::{env_get, env_get_bool, env_get_micros, env_get_millis, env_get_opt};
pub use error::{Error, Result};
pub use id::{DeviceId, ThreadId};
pub use state::{PollStatus, PollerState, ThreadState};
