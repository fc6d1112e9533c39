//! Stackable virtual bdevs
//!
//! A [`VbdevNode`] sits on top of one base bdev. It claims the base, exposes
//! a bdev of its own and forwards every request it receives to the base,
//! letting an [`IoTransform`] look at the request on the way down and on
//! the way back up.
//!
//! Each node is also an I/O device: getting a channel to the node gets a
//! channel to the base from inside the node's `create_channel`, so a stack
//! of N nodes hands out N nested channels on the same thread.
//!
//! When the base goes away the node fences every one of its channels with
//! a for-each-channel walk, releasing their base channels, and only then
//! unregisters its own bdev. Consumers stacked on top see that as their
//! own base being removed, so the removal cascades up the stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use iochan_core::{DeviceId, Error as CoreError};
use iochan_thread::{
    for_each_channel, get_io_channel, put_io_channel, register_device, unregister_device,
    ChannelIter, IoChannel, IoDevice, Thread,
};

use crate::bdev::{
    bdev_claim, bdev_close, bdev_get_io_channel, bdev_open, bdev_register, bdev_unregister,
    dispatch, get_bdev_by_name, validate_io, Bdev, BdevDesc, BdevInfo, BdevOps, HotRemoveFn,
};
use crate::error::{BdevError, Result};
use crate::io::{BdevIo, IoStatus, IoType};

/// What a stacked module does to the requests it forwards
pub trait IoTransform: Send + Sync + 'static {
    /// Module name used to claim the base bdev
    fn module_name(&self) -> &'static str;

    fn product_name(&self) -> &'static str;

    fn io_type_supported(&self, _io_type: IoType, base_supported: bool) -> bool {
        base_supported
    }

    /// Inspect or rewrite the request sent to the base; an error status
    /// fails the original request instead
    fn submit(&self, _io: &mut BdevIo) -> std::result::Result<(), IoStatus> {
        Ok(())
    }

    /// Inspect the original request before it completes with `status`
    fn complete(&self, _io: &mut BdevIo, status: IoStatus) -> IoStatus {
        status
    }

    /// A channel on `thread` was fenced after the base went away
    fn fenced(&self, _thread: &Thread) {}

    /// The node's bdev was destructed
    fn destruct(&self) {}

    fn dump_info_json(&self, _name: &str, _base: &str) -> Option<Value> {
        None
    }

    fn write_config_json(&self, _name: &str, _base: &str) -> Option<Value> {
        None
    }
}

/// Per-thread state of a node: the thread's channel to the base
pub struct VbdevChannel {
    base: Option<IoChannel>,
    fenced: bool,
}

impl VbdevChannel {
    #[inline]
    pub fn base(&self) -> Option<&IoChannel> {
        self.base.as_ref()
    }

    #[inline]
    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    fn fence(&mut self) -> Option<IoChannel> {
        self.fenced = true;
        self.base.take()
    }
}

/// Undo a node's `register_device` after a failed create
fn release_io_device(id: DeviceId, name: &str) {
    if let Err(err) = unregister_device(id, None) {
        error!(vbdev = %name, error = %err, "vbdev io_device unregister failed");
    }
}

pub struct VbdevNode<T: IoTransform> {
    name: String,
    base_name: String,
    transform: T,
    base: Arc<Bdev>,
    base_desc: Mutex<Option<BdevDesc>>,
    base_valid: AtomicBool,
    bdev: OnceLock<Weak<Bdev>>,
    me: Weak<VbdevNode<T>>,
}

impl<T: IoTransform> VbdevNode<T> {
    /// Build a node named `name` on top of the bdev `base_name`.
    ///
    /// Opens and claims the base, registers the node's I/O device and
    /// registers its bdev; a failure at any step undoes the earlier ones.
    pub fn create(transform: T, base_name: &str, name: &str) -> Result<Arc<Bdev>> {
        let base = get_bdev_by_name(base_name).ok_or_else(|| BdevError::NotFound(base_name.to_string()))?;
        if get_bdev_by_name(name).is_some() {
            return Err(BdevError::AlreadyExists(name.to_string()));
        }

        let node = Arc::new_cyclic(|me| VbdevNode {
            name: name.to_string(),
            base_name: base_name.to_string(),
            transform,
            base: base.clone(),
            base_desc: Mutex::new(None),
            base_valid: AtomicBool::new(true),
            bdev: OnceLock::new(),
            me: me.clone(),
        });
        let id = register_device(&node, Some(name))?;

        let weak = Arc::downgrade(&node);
        let hot_remove: HotRemoveFn = Box::new(move || {
            if let Some(node) = weak.upgrade() {
                node.base_removed();
            }
        });
        let desc = match bdev_open(base_name, true, Some(hot_remove)) {
            Ok(desc) => desc,
            Err(err) => {
                error!(vbdev = %name, base = %base_name, error = %err, "could not open base bdev");
                release_io_device(id, name);
                return Err(err);
            }
        };
        if let Err(err) = bdev_claim(&desc, node.transform.module_name()) {
            error!(vbdev = %name, base = %base_name, error = %err, "could not claim base bdev");
            bdev_close(desc);
            release_io_device(id, name);
            return Err(err);
        }
        *node.base_desc.lock() = Some(desc);

        let info = BdevInfo {
            name: name.to_string(),
            product_name: node.transform.product_name().to_string(),
            block_size: base.block_size(),
            block_count: base.block_count(),
            module: node.transform.module_name().to_string(),
        };
        match bdev_register(info, node.clone()) {
            Ok(bdev) => {
                let _ = node.bdev.set(Arc::downgrade(&bdev));
                info!(vbdev = %name, base = %base_name, "vbdev created");
                Ok(bdev)
            }
            Err(err) => {
                error!(vbdev = %name, error = %err, "could not register vbdev");
                let desc = node.base_desc.lock().take();
                if let Some(desc) = desc {
                    bdev_close(desc);
                }
                release_io_device(id, name);
                Err(err)
            }
        }
    }

    #[inline]
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_ref(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    #[inline]
    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Whether the base bdev is still usable
    pub fn base_valid(&self) -> bool {
        self.base_valid.load(Ordering::Acquire)
    }

    fn base_desc(&self) -> Option<BdevDesc> {
        if !self.base_valid() {
            return None;
        }
        self.base_desc.lock().clone()
    }

    /// Hot-remove of the base, on the thread that opened it
    fn base_removed(self: Arc<Self>) {
        if !self.base_valid.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(vbdev = %self.name, base = %self.base_name, "base bdev removed, fencing channels");

        let node = self.clone();
        let fence = move |iter: ChannelIter<()>| {
            let base = iter.channel().with_ctx(VbdevChannel::fence);
            match base {
                Ok(Some(base)) => put_io_channel(base),
                Ok(None) => {}
                Err(err) => warn!(vbdev = %node.name, error = %err, "fence could not reach channel"),
            }
            node.transform.fenced(iter.channel().thread());
            iter.continue_iter(Ok(()));
        };

        let node = self.clone();
        let fenced = move |(), status: iochan_core::Result<()>| {
            if let Err(err) = status {
                warn!(vbdev = %node.name, error = %err, "fence walk ended early");
            }
            node.unregister_self();
        };

        if let Err(err) = for_each_channel(self.device_id(), (), fence, fenced) {
            error!(vbdev = %self.name, error = %err, "could not start fence walk");
            self.unregister_self();
        }
    }

    fn unregister_self(&self) {
        let Some(bdev) = self.bdev.get().and_then(Weak::upgrade) else {
            return;
        };
        debug!(vbdev = %self.name, "channels fenced, unregistering vbdev");
        if let Err(err) = bdev_unregister(&bdev, None) {
            debug!(vbdev = %self.name, error = %err, "vbdev already unregistering");
        }
    }
}

impl<T: IoTransform> IoDevice for VbdevNode<T> {
    type Channel = VbdevChannel;

    fn create_channel(&self) -> iochan_core::Result<VbdevChannel> {
        let desc = self
            .base_desc()
            .ok_or_else(|| CoreError::DeviceUnregistering(self.name.clone()))?;
        let base = bdev_get_io_channel(&desc).map_err(|err| match err {
            BdevError::Core(err) => err,
            other => CoreError::Module(other.to_string()),
        })?;
        Ok(VbdevChannel {
            base: Some(base),
            fenced: false,
        })
    }

    fn destroy_channel(&self, ch: VbdevChannel) {
        if let Some(base) = ch.base {
            put_io_channel(base);
        }
    }
}

impl<T: IoTransform> BdevOps for VbdevNode<T> {
    fn submit_request(&self, ch: &IoChannel, mut io: BdevIo) {
        let Some(desc) = self.base_desc() else {
            io.complete(IoStatus::Failed);
            return;
        };

        let mut child = BdevIo::new(io.io_type(), io.offset_blocks(), io.num_blocks()).with_buf(io.take_buf());
        if let Err(status) = self.transform.submit(&mut child) {
            io.set_buf(child.take_buf());
            io.complete(status);
            return;
        }

        let ctx = match ch.ctx::<VbdevChannel>() {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(vbdev = %self.name, error = %err, "vbdev channel unavailable");
                io.set_buf(child.take_buf());
                io.complete(IoStatus::Failed);
                return;
            }
        };

        let node = self.me.clone();
        let rejected = match ctx.base.as_ref() {
            Some(base) if !ctx.fenced => match validate_io(&desc, base, &child) {
                Ok(()) => {
                    let child = child.on_complete(move |mut child| {
                        io.set_buf(child.take_buf());
                        let status = match node.upgrade() {
                            Some(node) => node.transform.complete(&mut io, child.status()),
                            None => child.status(),
                        };
                        io.complete(status);
                    });
                    dispatch(&desc, base, child);
                    None
                }
                Err(err) => Some((err, io, child)),
            },
            _ => Some((BdevError::Removing(self.base_name.clone()), io, child)),
        };
        drop(ctx);

        if let Some((err, mut io, mut child)) = rejected {
            debug!(vbdev = %self.name, error = %err, "forward to base rejected");
            io.set_buf(child.take_buf());
            io.complete(IoStatus::Failed);
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        self.transform
            .io_type_supported(io_type, self.base.io_type_supported(io_type))
    }

    fn get_io_channel(&self) -> iochan_core::Result<IoChannel> {
        get_io_channel(self.device_id())
    }

    /// Unregister the node's I/O device; the base descriptor is closed once
    /// the last channel, and with it the last base channel, is gone
    fn destruct(&self) {
        self.transform.destruct();
        let desc = self.base_desc.lock().take();
        let name = self.name.clone();
        let close_base = move || {
            if let Some(desc) = desc {
                bdev_close(desc);
            }
            debug!(vbdev = %name, "vbdev released base bdev");
        };
        if let Err(err) = unregister_device(self.device_id(), Some(Box::new(close_base))) {
            error!(vbdev = %self.name, error = %err, "vbdev io_device unregister failed");
        }
    }

    fn dump_info_json(&self) -> Option<Value> {
        self.transform.dump_info_json(&self.name, &self.base_name)
    }

    fn write_config_json(&self) -> Option<Value> {
        self.transform.write_config_json(&self.name, &self.base_name)
    }
}
