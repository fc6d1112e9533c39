//! In-memory base bdev
//!
//! Requests are executed against a byte buffer at submission time and
//! completed from a per-channel poller, the way a hardware queue would
//! report them.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error};

use iochan_core::{DeviceId, PollStatus};
use iochan_thread::{get_io_channel, register_device, register_poller, unregister_device, IoChannel, IoDevice, Poller};

use crate::bdev::{bdev_register, bdev_unregister, get_bdev_by_name, Bdev, BdevInfo, BdevOps, BdevUnregisterFn};
use crate::error::{BdevError, Result};
use crate::io::{BdevIo, IoStatus, IoType};

pub const MALLOC_MODULE: &str = "malloc";

type Completions = Arc<SegQueue<(BdevIo, IoStatus)>>;

pub struct MallocDisk {
    name: String,
    block_size: u32,
    block_count: u64,
    data: Mutex<Vec<u8>>,
}

/// Per-thread state of a malloc disk
pub struct MallocChannel {
    completions: Completions,
    poller: Poller,
}

impl MallocChannel {
    /// Requests executed but not yet completed
    pub fn pending(&self) -> usize {
        self.completions.len()
    }
}

impl MallocDisk {
    #[inline]
    fn device_id(&self) -> DeviceId {
        DeviceId::from_ref(self)
    }

    fn execute(&self, io: &mut BdevIo) -> IoStatus {
        let bs = self.block_size as usize;
        let start = io.offset_blocks() as usize * bs;
        let len = io.num_blocks() as usize * bs;

        let mut data = self.data.lock();
        let Some(range) = data.get_mut(start..start + len) else {
            return IoStatus::Failed;
        };
        match io.io_type() {
            IoType::Read => {
                let buf = io.buf_mut();
                buf.resize(len, 0);
                buf.copy_from_slice(range);
            }
            IoType::Write => {
                if io.buf().len() != len {
                    return IoStatus::Failed;
                }
                range.copy_from_slice(io.buf());
            }
            IoType::WriteZeroes | IoType::Unmap => range.fill(0),
            IoType::Flush | IoType::Reset => {}
        }
        IoStatus::Success
    }
}

impl IoDevice for MallocDisk {
    type Channel = MallocChannel;

    fn create_channel(&self) -> iochan_core::Result<MallocChannel> {
        let completions: Completions = Arc::new(SegQueue::new());
        let queue = completions.clone();
        let poller = register_poller(&format!("malloc:{}", self.name), Duration::ZERO, move || {
            let mut done = 0usize;
            while let Some((io, status)) = queue.pop() {
                io.complete(status);
                done += 1;
            }
            PollStatus::from(done > 0)
        })?;
        Ok(MallocChannel { completions, poller })
    }

    fn destroy_channel(&self, ch: MallocChannel) {
        ch.poller.unregister();
        while let Some((io, status)) = ch.completions.pop() {
            io.complete(status);
        }
    }
}

impl BdevOps for MallocDisk {
    fn submit_request(&self, ch: &IoChannel, mut io: BdevIo) {
        let status = self.execute(&mut io);
        match ch.ctx::<MallocChannel>() {
            Ok(mch) => mch.completions.push((io, status)),
            Err(err) => {
                error!(bdev = %self.name, error = %err, "malloc channel unavailable");
                io.complete(IoStatus::Failed);
            }
        }
    }

    fn io_type_supported(&self, _io_type: IoType) -> bool {
        true
    }

    fn get_io_channel(&self) -> iochan_core::Result<IoChannel> {
        get_io_channel(self.device_id())
    }

    fn destruct(&self) {
        if let Err(err) = unregister_device(self.device_id(), None) {
            error!(bdev = %self.name, error = %err, "malloc io_device unregister failed");
        }
    }

    fn write_config_json(&self) -> Option<Value> {
        Some(json!({
            "method": "construct_malloc_bdev",
            "params": {
                "name": self.name,
                "num_blocks": self.block_count,
                "block_size": self.block_size,
            }
        }))
    }
}

/// Create and register a zero-filled in-memory bdev
pub fn create_malloc_disk(name: &str, block_count: u64, block_size: u32) -> Result<Arc<Bdev>> {
    if block_count == 0 || block_size == 0 {
        return Err(BdevError::Config(format!(
            "malloc disk {}: block count and size must be > 0",
            name
        )));
    }
    let bytes = usize::try_from(block_count)
        .ok()
        .and_then(|n| n.checked_mul(block_size as usize))
        .ok_or_else(|| BdevError::Config(format!("malloc disk {}: size overflows", name)))?;

    let disk = Arc::new(MallocDisk {
        name: name.to_string(),
        block_size,
        block_count,
        data: Mutex::new(vec![0; bytes]),
    });
    let id = register_device(&disk, Some(name))?;

    let info = BdevInfo {
        name: name.to_string(),
        product_name: "Malloc disk".to_string(),
        block_size,
        block_count,
        module: MALLOC_MODULE.to_string(),
    };
    match bdev_register(info, disk) {
        Ok(bdev) => {
            debug!(bdev = %name, bytes, "malloc disk created");
            Ok(bdev)
        }
        Err(err) => {
            if let Err(cleanup) = unregister_device(id, None) {
                error!(bdev = %name, error = %cleanup, "malloc io_device unregister failed");
            }
            Err(err)
        }
    }
}

/// Unregister a malloc bdev; `cb` runs once it is destructed
pub fn delete_malloc_disk(name: &str, cb: Option<BdevUnregisterFn>) -> Result<()> {
    let bdev = get_bdev_by_name(name)
        .filter(|b| b.module_name() == MALLOC_MODULE)
        .ok_or_else(|| BdevError::NotFound(name.to_string()))?;
    bdev_unregister(&bdev, cb)
}
