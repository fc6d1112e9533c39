//! I/O channels and the per-thread channel cache
//!
//! A channel is one thread's right to use one device. Each thread keeps its
//! channels in a table keyed by device; a second `get_io_channel` on the
//! same thread bumps the reference count of the cached channel instead of
//! creating another one. A channel is torn down on its owning thread when
//! its last reference is put, wherever that put happened.

use std::any::Any;
use std::cell::RefMut;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace};

use iochan_core::{DeviceId, Error, Result};

use crate::device::ErasedDevice;
use crate::local::OwnerCell;
use crate::registry;
use crate::thread::Thread;
use crate::tls;

type ChannelCtx = Option<Box<dyn Any + Send>>;

struct ChannelInner {
    device_id: DeviceId,
    device_name: Arc<str>,
    device: Arc<dyn ErasedDevice>,
    thread: Thread,
    refs: AtomicU32,
    destroying: AtomicBool,
    ctx: OwnerCell<ChannelCtx>,
}

/// Handle to a channel.
///
/// Holding a handle is not holding a reference: references are taken with
/// [`get_io_channel`] and given back with [`put_io_channel`], which consumes
/// the handle.
pub struct IoChannel {
    inner: Arc<ChannelInner>,
}

impl IoChannel {
    /// Another handle to the same channel, for the core's own bookkeeping
    pub(crate) fn handle(&self) -> IoChannel {
        IoChannel {
            inner: self.inner.clone(),
        }
    }

    #[inline]
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    #[inline]
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Thread that owns the channel
    #[inline]
    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same channel
    #[inline]
    pub fn ptr_eq(&self, other: &IoChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the channel state as `C`.
    ///
    /// Owning thread only. Fails with `WrongThread` elsewhere, `ContextBusy`
    /// while another borrow is alive or after teardown, and `ContextType`
    /// if the device's channel state is not a `C`.
    pub fn ctx<C: Any>(&self) -> Result<RefMut<'_, C>> {
        let guard = self.inner.ctx.borrow_mut()?;
        if guard.is_none() {
            return Err(Error::ContextBusy(self.inner.device_name.to_string()));
        }
        RefMut::filter_map(guard, |slot| slot.as_mut().and_then(|b| b.downcast_mut::<C>()))
            .map_err(|_| Error::ContextType {
                expected: std::any::type_name::<C>(),
            })
    }

    /// Run `f` with the channel state borrowed as `C`
    pub fn with_ctx<C: Any, R>(&self, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        let mut ctx = self.ctx::<C>()?;
        Ok(f(&mut ctx))
    }
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannel")
            .field("device", &self.inner.device_name)
            .field("thread", &self.inner.thread.name())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Get the calling thread's channel to `id`, creating it on first use.
///
/// Creation runs the device's `create_channel` on this thread without any
/// lock held; its failure is returned as `ChannelCreate`.
pub fn get_io_channel(id: DeviceId) -> Result<IoChannel> {
    let thread = tls::current_thread().ok_or(Error::NotOnThread)?;
    if thread.is_exited() {
        return Err(Error::ThreadExited(thread.name().to_string()));
    }

    let (device, name) = {
        let mut reg = registry::lock();
        let rec = reg.devices.get_mut(&id).ok_or(Error::DeviceNotFound(id))?;
        if rec.unregistered {
            return Err(Error::DeviceUnregistering(rec.name.to_string()));
        }

        let cached = thread
            .inner
            .local
            .with(|local| local.channels.get(&id).map(IoChannel::handle))?;
        if let Some(ch) = cached {
            if !ch.inner.destroying.load(Ordering::Acquire) {
                let refs = ch.inner.refs.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(device = %ch.inner.device_name, thread = %thread.name(), refs, "io_channel reused");
                return Ok(ch);
            }
        }

        rec.refcnt += 1;
        (rec.device.clone(), rec.name.clone())
    };

    let ctx = match device.create() {
        Ok(ctx) => ctx,
        Err(err) => {
            let freed = {
                let mut reg = registry::lock();
                if let Some(rec) = reg.devices.get_mut(&id) {
                    rec.refcnt -= 1;
                }
                reg.take_if_released(id)
            };
            registry::finish_free(freed);
            debug!(device = %name, thread = %thread.name(), error = %err, "io_channel create failed");
            return Err(Error::channel_create(name.to_string(), err));
        }
    };

    let ch = IoChannel {
        inner: Arc::new(ChannelInner {
            device_id: id,
            device_name: name,
            device,
            thread: thread.clone(),
            refs: AtomicU32::new(1),
            destroying: AtomicBool::new(false),
            ctx: OwnerCell::new(thread.id(), "channel context", Some(ctx)),
        }),
    };

    thread
        .inner
        .local
        .with(|local| local.channels.insert(id, ch.handle()))?;
    thread.inner.open_channels.fetch_add(1, Ordering::AcqRel);
    if let Some(rec) = registry::lock().devices.get_mut(&id) {
        rec.holders.insert(thread.id(), thread.clone());
    }

    debug!(device = %ch.inner.device_name, thread = %thread.name(), "io_channel created");
    Ok(ch)
}

/// Give back one reference to a channel.
///
/// Releasing the last reference tears the channel down on its owning thread:
/// inline when called there, otherwise through a message to it.
pub fn put_io_channel(ch: IoChannel) {
    if ch.inner.thread.is_current() {
        put_local(ch);
        return;
    }

    let owner = ch.inner.thread.clone();
    trace!(device = %ch.inner.device_name, owner = %owner.name(), "io_channel put forwarded to owner");
    if let Err(err) = owner.send_msg(move || put_local(ch)) {
        error!(owner = %owner.name(), error = %err, "io_channel put lost");
    }
}

/// Thread that owns `ch`
pub fn io_channel_get_thread(ch: &IoChannel) -> Thread {
    ch.inner.thread.clone()
}

#[inline]
pub fn io_channel_get_device(ch: &IoChannel) -> DeviceId {
    ch.inner.device_id
}

#[inline]
pub fn io_channel_ref_count(ch: &IoChannel) -> u32 {
    ch.ref_count()
}

fn put_local(ch: IoChannel) {
    if ch.inner.destroying.load(Ordering::Acquire) {
        error!(device = %ch.inner.device_name, "put of a released io_channel");
        return;
    }

    let prev = ch.inner.refs.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        ch.inner.refs.store(0, Ordering::Release);
        error!(device = %ch.inner.device_name, "io_channel reference underflow");
        return;
    }
    trace!(device = %ch.inner.device_name, refs = prev - 1, "io_channel put");
    if prev == 1 {
        release(ch);
    }
}

/// Tear down a channel whose last reference is gone; owning thread only
fn release(ch: IoChannel) {
    let inner = ch.inner.clone();
    let ctx = match inner.ctx.with(Option::take) {
        Ok(ctx) => ctx,
        Err(Error::ContextBusy(_)) => {
            // Put from inside a borrow of its own context; retry once the
            // borrow is gone.
            let owner = inner.thread.clone();
            inner.refs.fetch_add(1, Ordering::AcqRel);
            if let Err(err) = owner.send_msg(move || put_local(ch)) {
                error!(owner = %owner.name(), error = %err, "io_channel release lost");
            }
            return;
        }
        Err(err) => {
            error!(device = %inner.device_name, error = %err, "io_channel release off owner thread");
            return;
        }
    };
    inner.destroying.store(true, Ordering::Release);

    let thread = &inner.thread;
    let removed = thread.inner.local.with(|local| {
        let cached = local
            .channels
            .get(&inner.device_id)
            .is_some_and(|c| c.ptr_eq(&ch));
        if cached {
            local.channels.remove(&inner.device_id)
        } else {
            None
        }
    });
    if !matches!(removed, Ok(Some(_))) {
        error!(device = %inner.device_name, "released io_channel missing from thread table");
    }

    if let Some(ctx) = ctx {
        inner.device.destroy(ctx);
    }
    thread.inner.open_channels.fetch_sub(1, Ordering::AcqRel);
    debug!(device = %inner.device_name, thread = %thread.name(), "io_channel destroyed");

    let freed = {
        let mut reg = registry::lock();
        if let Some(rec) = reg.devices.get_mut(&inner.device_id) {
            rec.refcnt -= 1;
            rec.holders.remove(&thread.id());
        }
        reg.take_if_released(inner.device_id)
    };
    registry::finish_free(freed);
}

/// The calling thread's cached channel to `id`, without taking a reference
pub(crate) fn lookup_local(thread: &Thread, id: DeviceId) -> Option<IoChannel> {
    thread
        .inner
        .local
        .with(|local| local.channels.get(&id).map(IoChannel::handle))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_ref_count, io_device_exists, register_device, unregister_device, IoDevice};
    use crate::sim::SimHarness;
    use iochan_core::ThreadId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Records which thread ran each callback
    #[derive(Default)]
    struct Probe {
        created: Mutex<Vec<ThreadId>>,
        destroyed: Mutex<Vec<ThreadId>>,
        fail: AtomicBool,
    }

    struct ProbeCtx {
        owner: ThreadId,
        scratch: [u8; 64],
    }

    impl IoDevice for Probe {
        type Channel = ProbeCtx;

        fn create_channel(&self) -> Result<ProbeCtx> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Module("create refused".into()));
            }
            let owner = tls::current_thread_id();
            self.created.lock().unwrap().push(owner);
            Ok(ProbeCtx {
                owner,
                scratch: [0; 64],
            })
        }

        fn destroy_channel(&self, ctx: ProbeCtx) {
            let current = tls::current_thread_id();
            assert_eq!(current, ctx.owner);
            self.destroyed.lock().unwrap().push(current);
        }
    }

    #[test]
    fn test_same_thread_shares_channel() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("Malloc0")).unwrap();

        let ch1 = get_io_channel(id).unwrap();
        let ch2 = get_io_channel(id).unwrap();
        assert!(ch1.ptr_eq(&ch2));
        assert_eq!(io_channel_ref_count(&ch1), 2);
        assert_eq!(io_channel_get_device(&ch2), id);
        assert_eq!(device_ref_count(id), Some(1));

        let p1 = {
            let ctx = ch1.ctx::<ProbeCtx>().unwrap();
            &*ctx as *const ProbeCtx
        };
        let p2 = {
            let ctx = ch2.ctx::<ProbeCtx>().unwrap();
            &*ctx as *const ProbeCtx
        };
        assert_eq!(p1, p2);
        assert_eq!(dev.created.lock().unwrap().len(), 1);

        put_io_channel(ch1);
        assert!(dev.destroyed.lock().unwrap().is_empty());
        put_io_channel(ch2);
        assert_eq!(dev.destroyed.lock().unwrap().len(), 1);
        assert_eq!(device_ref_count(id), Some(0));

        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_ctx_access() {
        let mut sim = SimHarness::new(2);
        sim.set_thread(0);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("ctx")).unwrap();
        let ch = get_io_channel(id).unwrap();

        ch.with_ctx(|c: &mut ProbeCtx| c.scratch[0] = 7).unwrap();
        assert_eq!(ch.ctx::<ProbeCtx>().unwrap().scratch[0], 7);
        assert!(matches!(ch.ctx::<u32>(), Err(Error::ContextType { .. })));

        {
            let _held = ch.ctx::<ProbeCtx>().unwrap();
            assert!(matches!(ch.ctx::<ProbeCtx>(), Err(Error::ContextBusy(_))));
        }

        sim.set_thread(1);
        assert!(matches!(ch.ctx::<ProbeCtx>(), Err(Error::WrongThread { .. })));

        sim.set_thread(0);
        put_io_channel(ch);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_put_from_other_thread() {
        let mut sim = SimHarness::new(2);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("remote")).unwrap();

        sim.set_thread(0);
        let ch = get_io_channel(id).unwrap();
        assert_eq!(io_channel_get_thread(&ch), *sim.thread(0));

        sim.set_thread(1);
        put_io_channel(ch);
        assert!(dev.destroyed.lock().unwrap().is_empty());
        sim.poll_thread(1);
        assert!(dev.destroyed.lock().unwrap().is_empty());

        sim.poll_thread(0);
        assert_eq!(*dev.destroyed.lock().unwrap(), vec![sim.thread(0).id()]);
        assert_eq!(sim.thread(0).open_channels(), 0);

        sim.set_thread(0);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_regained_before_remote_put_lands() {
        let mut sim = SimHarness::new(2);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("race")).unwrap();

        sim.set_thread(0);
        let ch = get_io_channel(id).unwrap();
        sim.set_thread(1);
        put_io_channel(ch);

        // thread 0 takes a new reference before the forwarded put runs
        sim.set_thread(0);
        let again = get_io_channel(id).unwrap();
        sim.poll_threads();
        assert!(dev.destroyed.lock().unwrap().is_empty());
        assert_eq!(again.ref_count(), 1);

        put_io_channel(again);
        assert_eq!(dev.destroyed.lock().unwrap().len(), 1);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_create_failure_propagates() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let dev = Arc::new(Probe::default());
        dev.fail.store(true, Ordering::SeqCst);
        let id = register_device(&dev, Some("broken")).unwrap();

        let err = get_io_channel(id).unwrap_err();
        assert!(matches!(&err, Error::ChannelCreate { device, .. } if device == "broken"));
        assert!(matches!(err.root_cause(), Error::Module(_)));
        assert_eq!(device_ref_count(id), Some(0));
        assert_eq!(sim.thread(0).open_channels(), 0);

        dev.fail.store(false, Ordering::SeqCst);
        let ch = get_io_channel(id).unwrap();
        put_io_channel(ch);
        unregister_device(id, None).unwrap();
    }

    #[test]
    fn test_get_requires_thread_and_device() {
        let mut sim = SimHarness::new(1);
        let dev = Arc::new(Probe::default());
        let id = DeviceId::of(&dev);
        assert!(matches!(get_io_channel(id), Err(Error::NotOnThread)));
        sim.set_thread(0);
        assert!(matches!(get_io_channel(id), Err(Error::DeviceNotFound(_))));
    }

    #[test]
    fn test_deferred_unregister() {
        let mut sim = SimHarness::new(3);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("D")).unwrap();

        let mut channels = Vec::new();
        for i in 0..3 {
            sim.set_thread(i);
            channels.push(get_io_channel(id).unwrap());
        }

        let fired_on = Arc::new(Mutex::new(Vec::new()));
        let f = fired_on.clone();
        sim.set_thread(0);
        unregister_device(id, Some(Box::new(move || {
            f.lock().unwrap().push(tls::current_thread_id());
        })))
        .unwrap();
        assert!(fired_on.lock().unwrap().is_empty());

        for (i, ch) in channels.into_iter().enumerate() {
            sim.set_thread(i);
            put_io_channel(ch);
            sim.poll_threads();
            if i < 2 {
                assert!(fired_on.lock().unwrap().is_empty());
            }
        }
        // released on thread 2, delivered to the unregistering thread 0
        assert_eq!(*fired_on.lock().unwrap(), vec![sim.thread(0).id()]);
        assert!(!io_device_exists(id));
    }

    #[test]
    fn test_cached_channel_not_reused_after_unregister() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("gone")).unwrap();

        let ch = get_io_channel(id).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        unregister_device(id, Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let err = get_io_channel(id).unwrap_err();
        assert!(matches!(err, Error::DeviceUnregistering(name) if name == "gone"));
        assert_eq!(ch.ref_count(), 1);
        assert_eq!(device_ref_count(id), Some(1));

        put_io_channel(ch);
        sim.clear_thread();
        sim.poll_threads();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!io_device_exists(id));
        assert_eq!(dev.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_double_put_reported() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let dev = Arc::new(Probe::default());
        let id = register_device(&dev, Some("double")).unwrap();
        let ch = get_io_channel(id).unwrap();
        let stale = ch.handle();
        put_io_channel(ch);
        put_io_channel(stale);
        assert_eq!(dev.destroyed.lock().unwrap().len(), 1);
        unregister_device(id, None).unwrap();
    }

    struct Layer {
        below: DeviceId,
        depth: Arc<AtomicUsize>,
    }

    struct LayerCtx {
        below: Option<IoChannel>,
    }

    impl IoDevice for Layer {
        type Channel = LayerCtx;

        fn create_channel(&self) -> Result<LayerCtx> {
            self.depth.fetch_add(1, Ordering::SeqCst);
            Ok(LayerCtx {
                below: Some(get_io_channel(self.below)?),
            })
        }

        fn destroy_channel(&self, mut ctx: LayerCtx) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            if let Some(ch) = ctx.below.take() {
                put_io_channel(ch);
            }
        }
    }

    #[test]
    fn test_nested_channels() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let base = Arc::new(Probe::default());
        let base_id = register_device(&base, Some("base")).unwrap();
        let depth = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(Layer {
            below: base_id,
            depth: depth.clone(),
        });
        let inner_id = register_device(&inner, Some("inner")).unwrap();
        let outer = Arc::new(Layer {
            below: inner_id,
            depth: depth.clone(),
        });
        let outer_id = register_device(&outer, Some("outer")).unwrap();

        let ch = get_io_channel(outer_id).unwrap();
        assert_eq!(sim.thread(0).open_channels(), 3);
        assert_eq!(depth.load(Ordering::SeqCst), 2);
        for id in [base_id, inner_id, outer_id] {
            assert_eq!(device_ref_count(id), Some(1));
        }

        put_io_channel(ch);
        assert_eq!(sim.thread(0).open_channels(), 0);
        assert_eq!(base.destroyed.lock().unwrap().len(), 1);

        for id in [outer_id, inner_id, base_id] {
            unregister_device(id, None).unwrap();
        }
    }

    #[test]
    fn test_nested_create_failure_unwinds() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let base = Arc::new(Probe::default());
        base.fail.store(true, Ordering::SeqCst);
        let base_id = register_device(&base, Some("base")).unwrap();
        let layer = Arc::new(Layer {
            below: base_id,
            depth: Arc::new(AtomicUsize::new(0)),
        });
        let layer_id = register_device(&layer, Some("layer")).unwrap();

        let err = get_io_channel(layer_id).unwrap_err();
        assert!(matches!(&err, Error::ChannelCreate { device, .. } if device == "layer"));
        assert!(matches!(err.root_cause(), Error::Module(_)));
        assert_eq!(sim.thread(0).open_channels(), 0);

        unregister_device(layer_id, None).unwrap();
        unregister_device(base_id, None).unwrap();
    }
}
