//! Block I/O requests
//!
//! A [`BdevIo`] is owned by whoever is working on it: the submitter builds
//! it, the module that executes it holds it until it is done, and
//! [`BdevIo::complete`] hands it back to the submitter's callback on the
//! thread of the channel it was submitted on.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use iochan_thread::Thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Read,
    Write,
    WriteZeroes,
    Unmap,
    Flush,
    Reset,
}

impl IoType {
    pub const ALL: [IoType; 6] = [
        IoType::Read,
        IoType::Write,
        IoType::WriteZeroes,
        IoType::Unmap,
        IoType::Flush,
        IoType::Reset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IoType::Read => "read",
            IoType::Write => "write",
            IoType::WriteZeroes => "write_zeroes",
            IoType::Unmap => "unmap",
            IoType::Flush => "flush",
            IoType::Reset => "reset",
        }
    }

    /// Whether the request modifies the device contents
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, IoType::Write | IoType::WriteZeroes | IoType::Unmap)
    }

    /// Whether the request addresses a block range
    #[inline]
    pub fn has_range(self) -> bool {
        !matches!(self, IoType::Reset)
    }
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Pending,
    Success,
    Failed,
    NoMemory,
}

impl IoStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == IoStatus::Success
    }
}

impl From<bool> for IoStatus {
    fn from(success: bool) -> Self {
        if success {
            IoStatus::Success
        } else {
            IoStatus::Failed
        }
    }
}

/// Completion callback of a request
pub type IoCompletion = Box<dyn FnOnce(BdevIo) + Send + 'static>;

thread_local! {
    /// Nesting depth of `submit_request` calls on this OS thread
    static SUBMIT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct SubmitScope;

impl SubmitScope {
    fn enter() -> Self {
        SUBMIT_DEPTH.with(|d| d.set(d.get() + 1));
        SubmitScope
    }
}

impl Drop for SubmitScope {
    fn drop(&mut self) {
        SUBMIT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Run a module's `submit_request`; completions raised inside are deferred
pub(crate) fn in_submit<R>(f: impl FnOnce() -> R) -> R {
    let _scope = SubmitScope::enter();
    f()
}

fn submitting() -> bool {
    SUBMIT_DEPTH.with(|d| d.get() > 0)
}

pub struct BdevIo {
    io_type: IoType,
    offset_blocks: u64,
    num_blocks: u64,
    buf: Vec<u8>,
    status: IoStatus,
    bdev: Option<Arc<str>>,
    block_size: u32,
    thread: Option<Thread>,
    cb: Option<IoCompletion>,
}

impl BdevIo {
    pub fn new(io_type: IoType, offset_blocks: u64, num_blocks: u64) -> Self {
        Self {
            io_type,
            offset_blocks,
            num_blocks,
            buf: Vec::new(),
            status: IoStatus::Pending,
            bdev: None,
            block_size: 0,
            thread: None,
            cb: None,
        }
    }

    pub fn with_buf(mut self, buf: Vec<u8>) -> Self {
        self.buf = buf;
        self
    }

    pub fn on_complete<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(BdevIo) + Send + 'static,
    {
        self.cb = Some(Box::new(cb));
        self
    }

    #[inline]
    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    #[inline]
    pub fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }

    #[inline]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    #[inline]
    pub fn status(&self) -> IoStatus {
        self.status
    }

    /// Name of the bdev the request was submitted to
    pub fn bdev_name(&self) -> &str {
        self.bdev.as_deref().unwrap_or("")
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Bytes covered by the block range
    pub fn len_bytes(&self) -> usize {
        (self.num_blocks as usize).saturating_mul(self.block_size as usize)
    }

    /// Thread of the channel the request was submitted on
    pub fn thread(&self) -> Option<&Thread> {
        self.thread.as_ref()
    }

    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn take_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_buf(&mut self, buf: Vec<u8>) {
        self.buf = buf;
    }

    /// Stamp the request with its target before it reaches a module
    pub(crate) fn prepare(&mut self, bdev: Arc<str>, block_size: u32, thread: Thread) {
        self.bdev = Some(bdev);
        self.block_size = block_size;
        self.thread = Some(thread);
        self.status = IoStatus::Pending;
    }

    /// Finish the request with `status`.
    ///
    /// The callback runs on the submitting channel's thread: inline when
    /// already there, otherwise (or when called from inside a module's
    /// `submit_request`) through a message.
    pub fn complete(mut self, status: IoStatus) {
        self.status = status;
        let Some(thread) = self.thread.clone() else {
            self.finish();
            return;
        };

        if thread.is_current() && !submitting() {
            self.finish();
            return;
        }
        if let Err(err) = thread.send_msg(move || self.finish()) {
            error!(thread = %thread.name(), error = %err, "bdev_io completion lost");
        }
    }

    fn finish(mut self) {
        trace!(
            bdev = self.bdev_name(),
            io_type = %self.io_type,
            offset = self.offset_blocks,
            blocks = self.num_blocks,
            status = ?self.status,
            "bdev_io complete"
        );
        if let Some(cb) = self.cb.take() {
            cb(self);
        }
    }
}

impl fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BdevIo")
            .field("bdev", &self.bdev_name())
            .field("type", &self.io_type)
            .field("offset_blocks", &self.offset_blocks)
            .field("num_blocks", &self.num_blocks)
            .field("status", &self.status)
            .finish()
    }
}
