//! I/O device registry
//!
//! A module exposes a resource as an [`IoDevice`]: something every thread can
//! get a private channel to. The registry keys devices by the address of the
//! registered object and stores them type-erased, so it never depends on a
//! concrete module type.
//!
//! # Lifecycle
//!
//! ```text
//!  register_device ──► registered ──unregister_device──► unregistered
//!                          │                                  │
//!                 (walks outstanding)                last channel released
//!                          ▼                                  ▼
//!                  pending unregister ──last walk──►        freed ──► unregister cb
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use iochan_core::{DeviceId, Error, Result};

use crate::registry::{self, DeviceRecord, UnregisterFn, UnregisterRequest};
use crate::tls;

/// A resource threads can open channels to.
///
/// `Channel` is the per-thread state the device keeps for each thread that
/// uses it (a base-device sub-channel, a poller handle, a queue pair).
///
/// **Contract:** both callbacks run on the thread the channel belongs to and
/// are never invoked with the registry lock held, so they may themselves get
/// or put channels of other devices.
pub trait IoDevice: Send + Sync + 'static {
    type Channel: Send + 'static;

    /// Build the channel state for the calling thread.
    ///
    /// An error aborts the channel creation and is returned to the caller of
    /// `get_io_channel`.
    fn create_channel(&self) -> Result<Self::Channel>;

    /// Tear down the channel state once its last reference is released.
    fn destroy_channel(&self, channel: Self::Channel) {
        drop(channel);
    }
}

/// Type-erased view of an [`IoDevice`] held by the registry and by channels
pub(crate) trait ErasedDevice: Send + Sync {
    fn create(&self) -> Result<Box<dyn Any + Send>>;
    fn destroy(&self, ctx: Box<dyn Any + Send>);
    fn channel_type(&self) -> &'static str;
}

impl<D: IoDevice> ErasedDevice for D {
    fn create(&self) -> Result<Box<dyn Any + Send>> {
        let ctx = self.create_channel()?;
        Ok(Box::new(ctx))
    }

    fn destroy(&self, ctx: Box<dyn Any + Send>) {
        match ctx.downcast::<D::Channel>() {
            Ok(ctx) => self.destroy_channel(*ctx),
            Err(_) => error!(
                expected = std::any::type_name::<D::Channel>(),
                "channel context of unexpected type"
            ),
        }
    }

    fn channel_type(&self) -> &'static str {
        std::any::type_name::<D::Channel>()
    }
}

/// Register `device` so threads can get channels to it.
///
/// The device is keyed by its address; registering the same object twice
/// fails with `AlreadyRegistered`. The name defaults to the hex address.
pub fn register_device<D: IoDevice>(device: &Arc<D>, name: Option<&str>) -> Result<DeviceId> {
    let id = DeviceId::of(device);
    let name: Arc<str> = match name {
        Some(n) => Arc::from(n),
        None => Arc::from(id.to_string()),
    };

    let mut reg = registry::lock();
    if let Some(existing) = reg.devices.get(&id) {
        error!(device = %existing.name, addr = %id, "io_device already registered");
        return Err(Error::AlreadyRegistered(id));
    }
    let erased: Arc<dyn ErasedDevice> = device.clone();
    reg.devices.insert(
        id,
        DeviceRecord {
            name: name.clone(),
            device: erased,
            refcnt: 0,
            holders: BTreeMap::new(),
            for_each_count: 0,
            pending_unregister: false,
            unregistered: false,
            unregister: None,
        },
    );
    drop(reg);

    debug!(device = %name, addr = %id, ctx = std::any::type_name::<D::Channel>(), "io_device registered");
    Ok(id)
}

/// Unregister a device.
///
/// New channels to the device are refused from now on. With no channels
/// open, `cb` runs before this returns. Otherwise it runs once the last
/// channel is released, on the thread that called this function. While a
/// for-each-channel walk over the device is outstanding the unregister is
/// held back until the walk completes.
pub fn unregister_device(id: DeviceId, cb: Option<UnregisterFn>) -> Result<()> {
    let thread = tls::current_thread();
    if cb.is_some() && thread.is_none() {
        return Err(Error::NotOnThread);
    }

    let mut reg = registry::lock();
    let Some(rec) = reg.devices.get_mut(&id) else {
        error!(addr = %id, "unregister of unknown io_device");
        return Err(Error::DeviceNotFound(id));
    };
    if rec.unregistered || rec.pending_unregister {
        return Err(Error::DeviceUnregistering(rec.name.to_string()));
    }

    rec.unregister = Some(UnregisterRequest { cb, thread });
    if rec.for_each_count > 0 {
        rec.pending_unregister = true;
        debug!(device = %rec.name, walks = rec.for_each_count, "io_device unregister pending");
        return Ok(());
    }

    rec.unregistered = true;
    debug!(device = %rec.name, channels = rec.refcnt, "io_device unregistered");
    let freed = reg.take_if_released(id);
    drop(reg);

    registry::finish_free(freed);
    Ok(())
}

/// Resume an unregister held back by a for-each walk
pub(crate) fn resume_pending_unregister(id: DeviceId) {
    let mut reg = registry::lock();
    let Some(rec) = reg.devices.get_mut(&id) else {
        return;
    };
    rec.pending_unregister = false;
    rec.unregistered = true;
    debug!(device = %rec.name, channels = rec.refcnt, "io_device unregistered after walk");
    let freed = reg.take_if_released(id);
    drop(reg);

    registry::finish_free(freed);
}

/// Whether a device is registered (including one still draining channels)
pub fn io_device_exists(id: DeviceId) -> bool {
    registry::lock().devices.contains_key(&id)
}

/// Registered devices, including ones still draining channels
pub fn io_device_count() -> usize {
    registry::lock().devices.len()
}

pub fn device_name(id: DeviceId) -> Option<String> {
    registry::lock().devices.get(&id).map(|rec| rec.name.to_string())
}

/// Channels open on the device across all threads
pub fn device_ref_count(id: DeviceId) -> Option<u32> {
    registry::lock().devices.get(&id).map(|rec| rec.refcnt)
}

/// Type name of the device's channel state
pub fn device_channel_type(id: DeviceId) -> Option<&'static str> {
    registry::lock()
        .devices
        .get(&id)
        .map(|rec| rec.device.channel_type())
}
