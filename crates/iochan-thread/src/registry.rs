//! Process-wide thread and device registry
//!
//! One mutex protects the set of threads, the device table and the
//! library configuration. It is held only for short insert/lookup/remove
//! sections and never across a callback, a message delivery or a drop of
//! user state.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use iochan_core::{DeviceId, Result, ThreadId};

use crate::config::ThreadLibConfig;
use crate::device::ErasedDevice;
use crate::thread::Thread;

/// Unregister completion callback
pub type UnregisterFn = Box<dyn FnOnce() + Send + 'static>;

/// Who asked for a device to be unregistered, and what to call when done
pub(crate) struct UnregisterRequest {
    pub(crate) cb: Option<UnregisterFn>,
    pub(crate) thread: Option<Thread>,
}

pub(crate) struct DeviceRecord {
    pub(crate) name: Arc<str>,
    pub(crate) device: Arc<dyn ErasedDevice>,
    /// Channels open on this device plus creations in flight
    pub(crate) refcnt: u32,
    /// Threads holding a fully created channel, in thread-id order
    pub(crate) holders: BTreeMap<ThreadId, Thread>,
    /// Outstanding for-each-channel walks
    pub(crate) for_each_count: u32,
    /// Unregister requested while walks were outstanding
    pub(crate) pending_unregister: bool,
    pub(crate) unregistered: bool,
    pub(crate) unregister: Option<UnregisterRequest>,
}

pub(crate) struct Registry {
    pub(crate) config: ThreadLibConfig,
    pub(crate) next_thread_id: ThreadId,
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) app_thread: Option<Thread>,
    pub(crate) devices: BTreeMap<DeviceId, DeviceRecord>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            config: ThreadLibConfig::new(),
            next_thread_id: ThreadId::FIRST,
            threads: BTreeMap::new(),
            app_thread: None,
            devices: BTreeMap::new(),
        }
    }

    /// Remove a device whose last reference is gone
    ///
    /// The caller must drop the returned record after releasing the lock.
    pub(crate) fn take_if_released(&mut self, id: DeviceId) -> Option<DeviceRecord> {
        let release = self
            .devices
            .get(&id)
            .is_some_and(|rec| rec.unregistered && rec.refcnt == 0);
        if release {
            self.devices.remove(&id)
        } else {
            None
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

#[inline]
pub(crate) fn lock() -> MutexGuard<'static, Registry> {
    REGISTRY.lock()
}

/// Configuration currently installed
pub fn config() -> ThreadLibConfig {
    lock().config
}

/// Install the library configuration.
///
/// Threads allocated afterwards pick up the new settings; existing threads
/// keep the ones they were created with.
pub fn lib_init(config: ThreadLibConfig) -> Result<()> {
    config
        .validate()
        .map_err(iochan_core::Error::InvalidConfig)?;

    let mut reg = lock();
    if !reg.threads.is_empty() {
        warn!(threads = reg.threads.len(), "thread library initialised with live threads");
    }
    reg.config = config;
    debug!(?config, "thread library initialised");
    Ok(())
}

/// Tear down the thread library.
///
/// Reports devices that were never unregistered and threads that were never
/// freed, then restores the default configuration. Returns the number of
/// leaked devices.
pub fn lib_fini() -> usize {
    let mut reg = lock();
    for (id, rec) in &reg.devices {
        error!(
            device = %rec.name,
            addr = %id,
            channels = rec.refcnt,
            "io_device still registered at thread library teardown"
        );
    }
    if !reg.threads.is_empty() {
        warn!(threads = reg.threads.len(), "threads still allocated at thread library teardown");
    }
    reg.config = ThreadLibConfig::new();
    reg.devices.len()
}

/// Fire the unregister completion of a freed device
///
/// Runs inline when the current thread is the one that asked for the
/// unregister, otherwise as a message to it.
pub(crate) fn finish_free(record: Option<DeviceRecord>) {
    let Some(record) = record else {
        return;
    };
    debug!(device = %record.name, "io_device freed");

    let DeviceRecord {
        device, unregister, ..
    } = record;
    drop(device);

    let Some(UnregisterRequest {
        cb: Some(cb),
        thread,
    }) = unregister
    else {
        return;
    };

    match thread {
        Some(thread) if !thread.is_current() => {
            if let Err(err) = thread.send_msg(cb) {
                error!(thread = %thread.name(), error = %err, "unregister completion lost");
            }
        }
        _ => cb(),
    }
}
