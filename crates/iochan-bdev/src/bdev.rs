//! Block devices, descriptors and modules
//!
//! A [`Bdev`] is a named block device whose behavior is provided by a
//! module through [`BdevOps`]. Consumers open a [`BdevDesc`] on it, get an
//! I/O channel through the descriptor and submit requests on that channel.
//!
//! # Removal
//!
//! ```text
//!  bdev_unregister ──► removing ──hot_remove(desc) on each desc thread──►
//!       consumers close their descs ──last close──► destruct ──► cb
//! ```
//!
//! Every open descriptor is an observer on the bdev: unregistering notifies
//! each one on the thread that opened it, and the bdev is destructed once
//! the last descriptor is closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use iochan_core::Error as CoreError;
use iochan_thread::{tls, IoChannel, Thread};

use crate::error::{BdevError, Result};
use crate::io::{in_submit, BdevIo, IoType};

/// Hot-remove notification of one descriptor
pub type HotRemoveFn = Box<dyn FnOnce() + Send + 'static>;

/// Completion of [`bdev_unregister`]
pub type BdevUnregisterFn = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Function table a module provides for each bdev it exposes
pub trait BdevOps: Send + Sync + 'static {
    /// Execute `io` on `ch`, a channel obtained from
    /// [`get_io_channel`](Self::get_io_channel) on the calling thread.
    ///
    /// Must not block; the request is finished with [`BdevIo::complete`],
    /// inline or later.
    fn submit_request(&self, ch: &IoChannel, io: BdevIo);

    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// The calling thread's channel to the module's I/O device
    fn get_io_channel(&self) -> iochan_core::Result<IoChannel>;

    /// Release module resources once the bdev is unregistered and every
    /// descriptor on it is closed
    fn destruct(&self);

    /// Module-specific section of [`Bdev::dump_info_json`]
    fn dump_info_json(&self) -> Option<Value> {
        None
    }

    /// RPC call that recreates the bdev, if the module supports it
    fn write_config_json(&self) -> Option<Value> {
        None
    }
}

/// Bdev modules hook into bdev registration.
///
/// `examine` is offered every bdev as it is registered, which lets a module
/// attach to a base bdev whichever of the two shows up first.
pub trait BdevModule: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn examine(&self, _bdev: &Arc<Bdev>) {}

    fn fini(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BdevInfo {
    pub name: String,
    pub product_name: String,
    pub block_size: u32,
    pub block_count: u64,
    /// Name of the module providing the bdev
    pub module: String,
}

impl BdevInfo {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BdevError::Config("bdev name must not be empty".into()));
        }
        if self.block_size == 0 {
            return Err(BdevError::Config(format!("bdev {}: block size must be > 0", self.name)));
        }
        Ok(())
    }
}

struct DescInner {
    id: u64,
    thread: Thread,
    write: AtomicBool,
    closed: AtomicBool,
    hot_remove: Mutex<Option<HotRemoveFn>>,
}

struct Claim {
    desc: u64,
    module: String,
}

struct UnregisterWaiter {
    thread: Thread,
    cb: Option<BdevUnregisterFn>,
}

#[derive(Default)]
struct BdevState {
    removing: bool,
    descs: Vec<Arc<DescInner>>,
    claim: Option<Claim>,
    unregister: Option<UnregisterWaiter>,
}

pub struct Bdev {
    info: BdevInfo,
    name: Arc<str>,
    ops: Arc<dyn BdevOps>,
    state: Mutex<BdevState>,
}

impl Bdev {
    #[inline]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[inline]
    pub fn product_name(&self) -> &str {
        &self.info.product_name
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.info.block_size
    }

    #[inline]
    pub fn block_count(&self) -> u64 {
        self.info.block_count
    }

    #[inline]
    pub fn module_name(&self) -> &str {
        &self.info.module
    }

    pub fn info(&self) -> &BdevInfo {
        &self.info
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.ops.io_type_supported(io_type)
    }

    pub fn is_removing(&self) -> bool {
        self.state.lock().removing
    }

    pub fn open_descs(&self) -> usize {
        self.state.lock().descs.len()
    }

    /// Module holding the claim on this bdev
    pub fn claimed_by(&self) -> Option<String> {
        self.state.lock().claim.as_ref().map(|c| c.module.clone())
    }

    /// Description of the bdev in the shape of a `get_bdevs` entry
    pub fn dump_info_json(&self) -> Value {
        let supported: serde_json::Map<String, Value> = IoType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), Value::Bool(self.io_type_supported(*t))))
            .collect();
        json!({
            "name": self.info.name,
            "product_name": self.info.product_name,
            "block_size": self.info.block_size,
            "num_blocks": self.info.block_count,
            "claimed": self.claimed_by().is_some(),
            "supported_io_types": supported,
            "driver_specific": self.ops.dump_info_json().unwrap_or_else(|| json!({})),
        })
    }

    pub fn write_config_json(&self) -> Option<Value> {
        self.ops.write_config_json()
    }
}

impl std::fmt::Debug for Bdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.info.name)
            .field("module", &self.info.module)
            .field("blocks", &self.info.block_count)
            .finish()
    }
}

/// An open handle on a bdev.
///
/// Clones share the same descriptor; [`bdev_close`] closes it for all of
/// them.
#[derive(Clone)]
pub struct BdevDesc {
    bdev: Arc<Bdev>,
    inner: Arc<DescInner>,
}

impl BdevDesc {
    #[inline]
    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.inner.write.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Thread that opened the descriptor and receives its hot-remove call
    #[inline]
    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }
}

impl std::fmt::Debug for BdevDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevDesc")
            .field("bdev", &self.bdev.info.name)
            .field("write", &self.is_write())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct BdevRegistry {
    bdevs: Vec<Arc<Bdev>>,
    modules: Vec<Arc<dyn BdevModule>>,
}

static BDEVS: Mutex<BdevRegistry> = Mutex::new(BdevRegistry {
    bdevs: Vec::new(),
    modules: Vec::new(),
});

static NEXT_DESC_ID: AtomicU64 = AtomicU64::new(1);

/// Add a module to the list consulted by `bdev_register`
pub fn bdev_module_register(module: Arc<dyn BdevModule>) -> Result<()> {
    let mut reg = BDEVS.lock();
    if reg.modules.iter().any(|m| m.name() == module.name()) {
        return Err(BdevError::AlreadyExists(module.name().to_string()));
    }
    debug!(module = module.name(), "bdev module registered");
    reg.modules.push(module);
    Ok(())
}

pub fn bdev_module_names() -> Vec<&'static str> {
    BDEVS.lock().modules.iter().map(|m| m.name()).collect()
}

/// Run every module's `fini` and drop the module list.
///
/// Returns the number of bdevs still registered.
pub fn bdev_modules_fini() -> usize {
    let (modules, leaked) = {
        let mut reg = BDEVS.lock();
        let leaked: Vec<String> = reg.bdevs.iter().map(|b| b.info.name.clone()).collect();
        (std::mem::take(&mut reg.modules), leaked)
    };
    for module in modules.iter().rev() {
        module.fini();
        debug!(module = module.name(), "bdev module finished");
    }
    for name in &leaked {
        warn!(bdev = %name, "bdev still registered at bdev layer teardown");
    }
    leaked.len()
}

/// Register a bdev and offer it to every module's `examine`.
pub fn bdev_register(info: BdevInfo, ops: Arc<dyn BdevOps>) -> Result<Arc<Bdev>> {
    info.validate()?;
    let bdev = Arc::new(Bdev {
        name: Arc::from(info.name.as_str()),
        info,
        ops,
        state: Mutex::new(BdevState::default()),
    });

    let modules = {
        let mut reg = BDEVS.lock();
        if reg.bdevs.iter().any(|b| b.info.name == bdev.info.name) {
            return Err(BdevError::AlreadyExists(bdev.info.name.clone()));
        }
        reg.bdevs.push(bdev.clone());
        reg.modules.clone()
    };
    info!(
        bdev = %bdev.info.name,
        module = %bdev.info.module,
        blocks = bdev.info.block_count,
        block_size = bdev.info.block_size,
        "bdev registered"
    );

    for module in &modules {
        trace!(bdev = %bdev.info.name, module = module.name(), "bdev examine");
        module.examine(&bdev);
    }
    Ok(bdev)
}

pub fn get_bdev_by_name(name: &str) -> Option<Arc<Bdev>> {
    BDEVS
        .lock()
        .bdevs
        .iter()
        .find(|b| b.info.name == name)
        .cloned()
}

/// Registered bdevs in registration order
pub fn bdev_list() -> Vec<Arc<Bdev>> {
    BDEVS.lock().bdevs.clone()
}

/// Calls that recreate every bdev whose module supports it
pub fn bdev_config_json() -> Vec<Value> {
    bdev_list()
        .iter()
        .filter_map(|b| b.write_config_json())
        .collect()
}

/// Open the bdev `name` on the calling thread.
///
/// `hot_remove` is called on this thread if the bdev is unregistered while
/// the descriptor is open; the consumer is expected to release its
/// channels and close the descriptor in response.
pub fn bdev_open(name: &str, write: bool, hot_remove: Option<HotRemoveFn>) -> Result<BdevDesc> {
    let thread = tls::current_thread().ok_or(CoreError::NotOnThread)?;
    let bdev = get_bdev_by_name(name).ok_or_else(|| BdevError::NotFound(name.to_string()))?;

    let inner = Arc::new(DescInner {
        id: NEXT_DESC_ID.fetch_add(1, Ordering::Relaxed),
        thread,
        write: AtomicBool::new(write),
        closed: AtomicBool::new(false),
        hot_remove: Mutex::new(hot_remove),
    });

    {
        let mut state = bdev.state.lock();
        if state.removing {
            return Err(BdevError::Removing(name.to_string()));
        }
        if let Some(claim) = state.claim.as_ref().filter(|_| write) {
            return Err(BdevError::Claimed {
                bdev: name.to_string(),
                module: claim.module.clone(),
            });
        }
        state.descs.push(inner.clone());
    }

    debug!(bdev = %name, write, thread = %inner.thread.name(), "bdev opened");
    Ok(BdevDesc { bdev, inner })
}

/// Close a descriptor, dropping any claim taken through it.
///
/// Closing the last descriptor of a bdev being removed lets its
/// unregistration finish.
pub fn bdev_close(desc: BdevDesc) {
    if desc.inner.closed.swap(true, Ordering::AcqRel) {
        warn!(bdev = %desc.bdev.info.name, "bdev descriptor closed twice");
        return;
    }
    desc.inner.hot_remove.lock().take();

    let finish = {
        let mut state = desc.bdev.state.lock();
        state.descs.retain(|d| !Arc::ptr_eq(d, &desc.inner));
        if state.claim.as_ref().is_some_and(|c| c.desc == desc.inner.id) {
            state.claim = None;
            debug!(bdev = %desc.bdev.info.name, "bdev claim released");
        }
        state.removing && state.descs.is_empty()
    };
    debug!(bdev = %desc.bdev.info.name, "bdev closed");

    if finish {
        finish_unregister(desc.bdev);
    }
}

/// Give `module` exclusive ownership of the bdev behind `desc`.
///
/// Write opens by anyone else are refused while the claim is held; the
/// claiming descriptor is promoted to write access.
pub fn bdev_claim(desc: &BdevDesc, module: &str) -> Result<()> {
    if desc.is_closed() {
        return Err(BdevError::Closed(desc.bdev.info.name.clone()));
    }
    let mut state = desc.bdev.state.lock();
    if let Some(claim) = &state.claim {
        return Err(BdevError::Claimed {
            bdev: desc.bdev.info.name.clone(),
            module: claim.module.clone(),
        });
    }
    state.claim = Some(Claim {
        desc: desc.inner.id,
        module: module.to_string(),
    });
    desc.inner.write.store(true, Ordering::Release);
    debug!(bdev = %desc.bdev.info.name, module, "bdev claimed");
    Ok(())
}

/// Start removing a bdev.
///
/// Every open descriptor gets its hot-remove call. Once all of them are
/// closed the module's `destruct` runs and then `cb`, both on the calling
/// thread.
pub fn bdev_unregister(bdev: &Arc<Bdev>, cb: Option<BdevUnregisterFn>) -> Result<()> {
    let thread = tls::current_thread().ok_or(CoreError::NotOnThread)?;

    let (observers, finish) = {
        let mut state = bdev.state.lock();
        if state.removing {
            return Err(BdevError::Removing(bdev.info.name.clone()));
        }
        state.removing = true;
        state.unregister = Some(UnregisterWaiter { thread, cb });
        (state.descs.clone(), state.descs.is_empty())
    };
    info!(bdev = %bdev.info.name, descs = observers.len(), "bdev unregistering");

    for desc in observers {
        let target = desc.thread.clone();
        let name = bdev.name.clone();
        let notify = move || {
            if desc.closed.load(Ordering::Acquire) {
                return;
            }
            let hot_remove = desc.hot_remove.lock().take();
            if let Some(hot_remove) = hot_remove {
                debug!(bdev = %name, "bdev hot remove");
                hot_remove();
            }
        };
        if let Err(err) = target.send_msg(notify) {
            error!(bdev = %bdev.info.name, thread = %target.name(), error = %err, "hot remove notification lost");
        }
    }

    if finish {
        finish_unregister(bdev.clone());
    }
    Ok(())
}

/// Remove the bdev from the list, destruct it and fire the unregister
/// completion, on the thread that asked for the unregistration
fn finish_unregister(bdev: Arc<Bdev>) {
    BDEVS.lock().bdevs.retain(|b| !Arc::ptr_eq(b, &bdev));
    let waiter = bdev.state.lock().unregister.take();

    let run = move |cb: Option<BdevUnregisterFn>| {
        bdev.ops.destruct();
        info!(bdev = %bdev.info.name, "bdev destructed");
        if let Some(cb) = cb {
            cb(Ok(()));
        }
    };

    match waiter {
        Some(UnregisterWaiter { thread, cb }) if !thread.is_current() => {
            let name = thread.name().to_string();
            if let Err(err) = thread.send_msg(move || run(cb)) {
                error!(thread = %name, error = %err, "bdev unregister completion lost");
            }
        }
        Some(UnregisterWaiter { cb, .. }) => run(cb),
        None => run(None),
    }
}

/// The calling thread's channel to the bdev behind `desc`
pub fn bdev_get_io_channel(desc: &BdevDesc) -> Result<IoChannel> {
    if desc.is_closed() {
        return Err(BdevError::Closed(desc.bdev.info.name.clone()));
    }
    Ok(desc.bdev.ops.get_io_channel()?)
}

/// Check that `io` may be submitted through `desc` on `ch`
pub fn validate_io(desc: &BdevDesc, ch: &IoChannel, io: &BdevIo) -> Result<()> {
    let bdev = &desc.bdev;
    if desc.is_closed() {
        return Err(BdevError::Closed(bdev.info.name.clone()));
    }
    if !ch.thread().is_current() {
        return Err(CoreError::WrongThread {
            expected: ch.thread().id(),
            actual: tls::current_thread_id(),
        }
        .into());
    }

    let io_type = io.io_type();
    if io_type.is_write() && !desc.is_write() {
        return Err(BdevError::ReadOnly(bdev.info.name.clone()));
    }
    if !bdev.io_type_supported(io_type) {
        return Err(BdevError::Unsupported {
            bdev: bdev.info.name.clone(),
            io_type,
        });
    }
    if io_type.has_range() {
        let end = io.offset_blocks().checked_add(io.num_blocks());
        if end.map_or(true, |end| end > bdev.info.block_count) {
            return Err(BdevError::OutOfRange {
                bdev: bdev.info.name.clone(),
                offset: io.offset_blocks(),
                num: io.num_blocks(),
                count: bdev.info.block_count,
            });
        }
    }
    if io_type == IoType::Write {
        let expected = io.num_blocks() as usize * bdev.info.block_size as usize;
        if io.buf().len() != expected {
            return Err(BdevError::BufferSize {
                expected,
                actual: io.buf().len(),
            });
        }
    }
    Ok(())
}

/// Hand an already validated request to the module
pub(crate) fn dispatch(desc: &BdevDesc, ch: &IoChannel, mut io: BdevIo) {
    let bdev = &desc.bdev;
    io.prepare(bdev.name.clone(), bdev.info.block_size, ch.thread().clone());
    trace!(bdev = %bdev.info.name, io = ?io, "bdev_io submit");
    in_submit(|| bdev.ops.submit_request(ch, io));
}

/// Submit `io` through `desc` on `ch`.
///
/// A request that fails validation is dropped without its completion
/// running and the reason is returned.
pub fn submit_io(desc: &BdevDesc, ch: &IoChannel, io: BdevIo) -> Result<()> {
    validate_io(desc, ch, &io)?;
    dispatch(desc, ch, io);
    Ok(())
}

pub fn bdev_read<F>(desc: &BdevDesc, ch: &IoChannel, offset_blocks: u64, num_blocks: u64, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    submit_io(desc, ch, BdevIo::new(IoType::Read, offset_blocks, num_blocks).on_complete(cb))
}

/// Write `buf`, a whole number of blocks, at `offset_blocks`
pub fn bdev_write<F>(desc: &BdevDesc, ch: &IoChannel, offset_blocks: u64, buf: Vec<u8>, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    let block_size = desc.bdev.info.block_size as usize;
    if buf.len() % block_size != 0 {
        return Err(BdevError::BufferSize {
            expected: buf.len().next_multiple_of(block_size),
            actual: buf.len(),
        });
    }
    let num_blocks = (buf.len() / block_size) as u64;
    let io = BdevIo::new(IoType::Write, offset_blocks, num_blocks)
        .with_buf(buf)
        .on_complete(cb);
    submit_io(desc, ch, io)
}

pub fn bdev_write_zeroes<F>(desc: &BdevDesc, ch: &IoChannel, offset_blocks: u64, num_blocks: u64, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    submit_io(desc, ch, BdevIo::new(IoType::WriteZeroes, offset_blocks, num_blocks).on_complete(cb))
}

pub fn bdev_unmap<F>(desc: &BdevDesc, ch: &IoChannel, offset_blocks: u64, num_blocks: u64, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    submit_io(desc, ch, BdevIo::new(IoType::Unmap, offset_blocks, num_blocks).on_complete(cb))
}

pub fn bdev_flush<F>(desc: &BdevDesc, ch: &IoChannel, offset_blocks: u64, num_blocks: u64, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    submit_io(desc, ch, BdevIo::new(IoType::Flush, offset_blocks, num_blocks).on_complete(cb))
}

pub fn bdev_reset<F>(desc: &BdevDesc, ch: &IoChannel, cb: F) -> Result<()>
where
    F: FnOnce(BdevIo) + Send + 'static,
{
    submit_io(desc, ch, BdevIo::new(IoType::Reset, 0, 0).on_complete(cb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoStatus;
    use iochan_core::DeviceId;
    use iochan_thread::sim::SimHarness;
    use iochan_thread::{get_io_channel, put_io_channel, register_device, unregister_device, IoDevice};
    use std::sync::atomic::AtomicU32;

    /// Completes every request inline with success
    struct NullDisk {
        destructed: AtomicU32,
    }

    impl NullDisk {
        fn register(name: &str) -> (Arc<NullDisk>, Arc<Bdev>) {
            let disk = Arc::new(NullDisk {
                destructed: AtomicU32::new(0),
            });
            register_device(&disk, Some(name)).unwrap();
            let info = BdevInfo {
                name: name.to_string(),
                product_name: "Null disk".into(),
                block_size: 512,
                block_count: 16,
                module: "null".into(),
            };
            let bdev = bdev_register(info, disk.clone()).unwrap();
            (disk, bdev)
        }
    }

    impl IoDevice for NullDisk {
        type Channel = ();

        fn create_channel(&self) -> iochan_core::Result<()> {
            Ok(())
        }
    }

    impl BdevOps for NullDisk {
        fn submit_request(&self, _ch: &IoChannel, io: BdevIo) {
            io.complete(IoStatus::Success);
        }

        fn io_type_supported(&self, io_type: IoType) -> bool {
            io_type != IoType::Reset
        }

        fn get_io_channel(&self) -> iochan_core::Result<IoChannel> {
            get_io_channel(DeviceId::from_ref(self))
        }

        fn destruct(&self) {
            self.destructed.fetch_add(1, Ordering::SeqCst);
            let _ = unregister_device(DeviceId::from_ref(self), None);
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let (_disk, bdev) = NullDisk::register("Null0");

        assert!(Arc::ptr_eq(&get_bdev_by_name("Null0").unwrap(), &bdev));
        assert!(bdev_list().iter().any(|b| b.name() == "Null0"));

        let info = bdev.info().clone();
        let dup = bdev_register(info, Arc::new(NullDisk { destructed: AtomicU32::new(0) }));
        assert!(matches!(dup, Err(BdevError::AlreadyExists(name)) if name == "Null0"));

        let dump = bdev.dump_info_json();
        assert_eq!(dump["num_blocks"], 16);
        assert_eq!(dump["supported_io_types"]["reset"], false);
        assert_eq!(dump["claimed"], false);

        bdev_unregister(&bdev, None).unwrap();
        assert!(get_bdev_by_name("Null0").is_none());
    }

    #[test]
    fn test_open_claim_close() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let (_disk, bdev) = NullDisk::register("Null1");

        let ro = bdev_open("Null1", false, None).unwrap();
        let owner = bdev_open("Null1", false, None).unwrap();
        bdev_claim(&owner, "vbdev").unwrap();
        assert!(owner.is_write());
        assert_eq!(bdev.claimed_by().as_deref(), Some("vbdev"));

        assert!(matches!(bdev_claim(&ro, "other"), Err(BdevError::Claimed { .. })));
        assert!(matches!(
            bdev_open("Null1", true, None),
            Err(BdevError::Claimed { module, .. }) if module == "vbdev"
        ));
        // read-only opens are still allowed
        let ro2 = bdev_open("Null1", false, None).unwrap();

        bdev_close(owner);
        assert!(bdev.claimed_by().is_none());
        bdev_close(ro);
        bdev_close(ro2);
        assert_eq!(bdev.open_descs(), 0);
        assert!(matches!(bdev_open("Nope", false, None), Err(BdevError::NotFound(_))));

        bdev_unregister(&bdev, None).unwrap();
    }

    #[test]
    fn test_unregister_waits_for_close() {
        let mut sim = SimHarness::new(2);
        sim.set_thread(0);
        let (disk, bdev) = NullDisk::register("Null2");

        // consumer on thread 1
        sim.set_thread(1);
        let removed_on = Arc::new(parking_lot::Mutex::new(None));
        let slot: Arc<Mutex<Option<BdevDesc>>> = Arc::new(Mutex::new(None));
        let (r, s) = (removed_on.clone(), slot.clone());
        let desc = bdev_open(
            "Null2",
            false,
            Some(Box::new(move || {
                *r.lock() = tls::current_thread().map(|t| t.id());
                let held = s.lock().take();
                if let Some(desc) = held {
                    bdev_close(desc);
                }
            })),
        )
        .unwrap();
        *slot.lock() = Some(desc);

        sim.set_thread(0);
        let done = Arc::new(AtomicU32::new(0));
        let d = done.clone();
        bdev_unregister(
            &bdev,
            Some(Box::new(move |status: Result<()>| {
                assert!(status.is_ok());
                d.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(bdev.is_removing());
        assert!(matches!(bdev_open("Null2", false, None), Err(BdevError::Removing(_))));
        assert!(matches!(bdev_unregister(&bdev, None), Err(BdevError::Removing(_))));
        assert_eq!(disk.destructed.load(Ordering::SeqCst), 0);

        sim.clear_thread();
        sim.poll_threads();
        assert_eq!(*removed_on.lock(), Some(sim.thread(1).id()));
        assert_eq!(disk.destructed.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(get_bdev_by_name("Null2").is_none());
    }

    #[test]
    fn test_submit_validation() {
        let mut sim = SimHarness::new(2);
        sim.set_thread(0);
        let (_disk, bdev) = NullDisk::register("Null3");
        let ro = bdev_open("Null3", false, None).unwrap();
        let rw = bdev_open("Null3", true, None).unwrap();
        let ch = bdev_get_io_channel(&rw).unwrap();

        let done = Arc::new(AtomicU32::new(0));
        let cb = {
            let done = done.clone();
            move |io: BdevIo| {
                assert!(io.status().is_success());
                done.fetch_add(1, Ordering::SeqCst);
            }
        };

        assert!(matches!(
            bdev_write(&ro, &ch, 0, vec![0; 512], cb.clone()),
            Err(BdevError::ReadOnly(_))
        ));
        assert!(matches!(
            bdev_read(&rw, &ch, 15, 2, cb.clone()),
            Err(BdevError::OutOfRange { offset: 15, num: 2, count: 16, .. })
        ));
        assert!(matches!(
            bdev_write(&rw, &ch, 0, vec![0; 100], cb.clone()),
            Err(BdevError::BufferSize { expected: 512, actual: 100 })
        ));
        assert!(matches!(
            bdev_reset(&rw, &ch, cb.clone()),
            Err(BdevError::Unsupported { io_type: IoType::Reset, .. })
        ));
        assert!(matches!(
            bdev_read(&rw, &ch, u64::MAX, 2, cb.clone()),
            Err(BdevError::OutOfRange { .. })
        ));

        sim.set_thread(1);
        assert!(matches!(
            bdev_read(&rw, &ch, 0, 1, cb.clone()),
            Err(BdevError::Core(CoreError::WrongThread { .. }))
        ));

        sim.set_thread(0);
        bdev_read(&ro, &ch, 0, 1, cb.clone()).unwrap();
        bdev_write(&rw, &ch, 15, vec![1; 512], cb).unwrap();
        // completions raised inside submit are deferred to the next poll
        assert_eq!(done.load(Ordering::SeqCst), 0);
        sim.clear_thread();
        sim.poll_threads();
        assert_eq!(done.load(Ordering::SeqCst), 2);

        sim.set_thread(0);
        put_io_channel(ch);
        bdev_close(ro);
        bdev_close(rw);
        bdev_unregister(&bdev, None).unwrap();
    }

    struct Watcher {
        seen: Mutex<Vec<String>>,
    }

    impl BdevModule for Watcher {
        fn name(&self) -> &'static str {
            "watcher"
        }

        fn examine(&self, bdev: &Arc<Bdev>) {
            self.seen.lock().push(bdev.name().to_string());
        }
    }

    #[test]
    fn test_modules_examine_new_bdevs() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let watcher = Arc::new(Watcher {
            seen: Mutex::new(Vec::new()),
        });
        bdev_module_register(watcher.clone()).unwrap();
        assert!(bdev_module_register(watcher.clone()).is_err());
        assert_eq!(bdev_module_names(), ["watcher"]);

        let (_disk, bdev) = NullDisk::register("Null4");
        assert_eq!(*watcher.seen.lock(), ["Null4"]);

        bdev_unregister(&bdev, None).unwrap();
        assert_eq!(bdev_modules_fini(), 0);
        assert!(bdev_module_names().is_empty());
    }
}
