//! Logical threads and the message pump
//!
//! A [`Thread`] is a cooperative execution context owned by the embedder.
//! Work reaches it only as messages: [`send_msg`] queues a closure and
//! calls the thread's [`Deliver`] hook, and the embedder eventually calls
//! [`Thread::poll`] on some OS thread to run what was queued.
//!
//! ```text
//!   sender thread                 target thread (embedder loop)
//!   ─────────────                 ─────────────────────────────
//!   send_msg(t, f) ──push──► [ msg queue ] ──poll()──► f()
//!        │                                    │
//!        └──deliver.notify(t)──► wake ────────┘   then pollers
//! ```
//!
//! Messages are FIFO per queue, so messages from one sender to one receiver
//! run in the order they were sent.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use tracing::{debug, trace, warn};

use iochan_core::{DeviceId, Error, PollStatus, PollerState, Result, ThreadId, ThreadState};

use crate::channel::IoChannel;
use crate::local::OwnerCell;
use crate::poller::PollerEntry;
use crate::registry;
use crate::tls;

/// A queued unit of work
pub type Msg = Box<dyn FnOnce() + Send + 'static>;

/// The embedder's delivery hook.
///
/// Called after a message was queued for `thread`. The implementation must
/// arrange for `thread.poll()` to run eventually (wake a parked reactor,
/// write an eventfd, or nothing at all for a busy-polling loop).
///
/// **Contract:** `notify()` may be called from any OS thread, including
/// from inside `poll()` of the target itself, and must never block.
pub trait Deliver: Send + Sync {
    fn notify(&self, thread: &Thread);
}

impl<F> Deliver for F
where
    F: Fn(&Thread) + Send + Sync,
{
    fn notify(&self, thread: &Thread) {
        self(thread)
    }
}

/// Delivery hook for threads that are polled continuously
#[derive(Debug, Default, Clone, Copy)]
pub struct PollDriven;

impl Deliver for PollDriven {
    fn notify(&self, _thread: &Thread) {}
}

/// Thread state touched only by the owning thread
pub(crate) struct ThreadLocal {
    pub(crate) channels: BTreeMap<DeviceId, IoChannel>,
    pub(crate) pollers: Vec<PollerEntry>,
    pub(crate) exit_deadline: Option<Instant>,
}

/// Counters reported by [`Thread::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub busy_polls: u64,
    pub idle_polls: u64,
    pub msgs_run: u64,
    pub pollers_run: u64,
}

#[derive(Default)]
struct StatCounters {
    busy_polls: AtomicU64,
    idle_polls: AtomicU64,
    msgs_run: AtomicU64,
    pollers_run: AtomicU64,
}

pub(crate) struct ThreadInner {
    id: ThreadId,
    name: String,
    state: AtomicU8,
    /// Set while the thread is current on some OS thread
    active: AtomicBool,
    messages: SegQueue<Msg>,
    deliver: Box<dyn Deliver>,
    pub(crate) local: OwnerCell<ThreadLocal>,
    pub(crate) open_channels: AtomicUsize,
    pub(crate) pending_iters: AtomicUsize,
    msg_batch_size: usize,
    pub(crate) max_pollers: usize,
    exit_timeout: std::time::Duration,
    stats: StatCounters,
}

/// Handle to a logical thread
///
/// Cheap to clone; all clones refer to the same thread.
#[derive(Clone)]
pub struct Thread {
    pub(crate) inner: Arc<ThreadInner>,
}

impl Thread {
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ThreadState) {
        self.inner.state.store(state.into(), Ordering::Release);
    }

    /// Whether this thread is current on the calling OS thread
    #[inline]
    pub fn is_current(&self) -> bool {
        tls::current_thread_id() == self.inner.id
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    #[inline]
    pub fn is_exited(&self) -> bool {
        self.state() == ThreadState::Exited
    }

    /// Channels currently open on this thread
    #[inline]
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::Acquire)
    }

    /// Messages queued but not yet run
    #[inline]
    pub fn pending_msgs(&self) -> usize {
        self.inner.messages.len()
    }

    pub fn stats(&self) -> ThreadStats {
        let s = &self.inner.stats;
        ThreadStats {
            busy_polls: s.busy_polls.load(Ordering::Relaxed),
            idle_polls: s.idle_polls.load(Ordering::Relaxed),
            msgs_run: s.msgs_run.load(Ordering::Relaxed),
            pollers_run: s.pollers_run.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_poller_run(&self) {
        self.inner.stats.pollers_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue `f` to run on this thread
    pub fn send_msg<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state().accepts_messages() {
            return Err(Error::ThreadExited(self.inner.name.clone()));
        }
        self.inner.messages.push(Box::new(f));
        trace!(thread = %self.inner.name, "message queued");
        self.inner.deliver.notify(self);
        Ok(())
    }

    /// Make this thread current on the calling OS thread.
    ///
    /// The previous current thread is restored when the guard drops.
    /// Entering the thread that is already current is a no-op. Fails with
    /// `ThreadBusy` if the thread is current on another OS thread.
    pub fn enter(&self) -> Result<ThreadGuard> {
        if self.is_current() {
            return Ok(ThreadGuard {
                prev: None,
                owned: None,
                _not_send: PhantomData,
            });
        }
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ThreadBusy(self.inner.name.clone()));
        }
        let prev = tls::set_current(Some(self.clone()));
        Ok(ThreadGuard {
            prev,
            owned: Some(self.clone()),
            _not_send: PhantomData,
        })
    }

    /// Run up to the configured batch of queued messages, then the pollers.
    ///
    /// The thread is current for the duration of the call. Returns `Busy`
    /// if any message ran or any poller reported work.
    pub fn poll(&self) -> Result<PollStatus> {
        self.poll_max(self.inner.msg_batch_size)
    }

    /// Like [`poll`](Self::poll) with an explicit message budget
    pub fn poll_max(&self, max_msgs: usize) -> Result<PollStatus> {
        if self.is_exited() {
            return Ok(PollStatus::Idle);
        }
        let _guard = self.enter()?;

        let mut ran = 0u64;
        for _ in 0..max_msgs.max(1) {
            let Some(msg) = self.inner.messages.pop() else {
                break;
            };
            msg();
            ran += 1;
        }
        if ran > 0 {
            self.inner.stats.msgs_run.fetch_add(ran, Ordering::Relaxed);
        }

        let status = PollStatus::from(ran > 0).merge(crate::poller::run_pollers(self)?);
        let counter = if status.is_busy() {
            &self.inner.stats.busy_polls
        } else {
            &self.inner.stats.idle_polls
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.state() == ThreadState::Exiting {
            self.check_exited()?;
        }
        Ok(status)
    }

    /// Ask the thread to exit.
    ///
    /// The thread keeps running messages and pollers until it has nothing
    /// left (no queued messages, no live pollers, no open channels, no
    /// for-each walk it started) or the exit timeout elapses; it is then
    /// exited and may be freed.
    pub fn exit(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ThreadState::Running.into(),
                ThreadState::Exiting.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(thread = %self.inner.name, "thread exiting");
        }
    }

    fn check_exited(&self) -> Result<()> {
        let timeout = self.inner.exit_timeout;
        let (live_pollers, timed_out) = self.inner.local.with(|local| {
            let now = Instant::now();
            let deadline = *local.exit_deadline.get_or_insert(now + timeout);
            let live = local
                .pollers
                .iter()
                .filter(|p| p.state() != PollerState::Unregistered)
                .count();
            (live, now >= deadline)
        })?;

        let drained = self.inner.messages.is_empty()
            && live_pollers == 0
            && self.open_channels() == 0
            && self.inner.pending_iters.load(Ordering::Acquire) == 0;

        if drained {
            debug!(thread = %self.inner.name, "thread exited");
            self.set_state(ThreadState::Exited);
        } else if timed_out {
            warn!(
                thread = %self.inner.name,
                msgs = self.inner.messages.len(),
                pollers = live_pollers,
                channels = self.open_channels(),
                "thread exit timed out"
            );
            self.set_state(ThreadState::Exited);
        }
        Ok(())
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Keeps a thread current on this OS thread; see [`Thread::enter`]
pub struct ThreadGuard {
    prev: Option<Thread>,
    owned: Option<Thread>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if let Some(thread) = self.owned.take() {
            tls::set_current(self.prev.take());
            thread.inner.active.store(false, Ordering::Release);
        }
    }
}

/// Register a new logical thread.
///
/// `deliver` is called whenever work is queued for the thread; the
/// embedder decides how that leads to `poll()`. The name defaults to
/// `thread<id>`. The first thread allocated becomes the app thread.
pub fn allocate_thread<D>(deliver: D, name: Option<&str>) -> Result<Thread>
where
    D: Deliver + 'static,
{
    let mut reg = registry::lock();
    let config = reg.config;
    if reg.threads.len() >= config.max_threads {
        return Err(Error::TooManyThreads(config.max_threads));
    }

    let id = reg.next_thread_id;
    reg.next_thread_id = id.next();

    let name = name.map_or_else(|| format!("thread{}", id), str::to_string);
    let thread = Thread {
        inner: Arc::new(ThreadInner {
            id,
            name,
            state: AtomicU8::new(ThreadState::Running.into()),
            active: AtomicBool::new(false),
            messages: SegQueue::new(),
            deliver: Box::new(deliver),
            local: OwnerCell::new(
                id,
                "thread local state",
                ThreadLocal {
                    channels: BTreeMap::new(),
                    pollers: Vec::new(),
                    exit_deadline: None,
                },
            ),
            open_channels: AtomicUsize::new(0),
            pending_iters: AtomicUsize::new(0),
            msg_batch_size: config.msg_batch_size,
            max_pollers: config.max_pollers,
            exit_timeout: config.exit_timeout,
            stats: StatCounters::default(),
        }),
    };

    reg.threads.insert(id, thread.clone());
    if reg.app_thread.is_none() {
        reg.app_thread = Some(thread.clone());
    }
    drop(reg);

    debug!(thread = %thread.name(), id = %id, "thread allocated");
    Ok(thread)
}

/// Remove a thread from the registry.
///
/// The thread must have no open channels. Messages still queued are
/// dropped without running.
pub fn free_thread(thread: &Thread) {
    let removed = {
        let mut reg = registry::lock();
        if reg.app_thread.as_ref() == Some(thread) {
            reg.app_thread = None;
        }
        reg.threads.remove(&thread.id())
    };
    if removed.is_none() {
        warn!(thread = %thread.name(), "free of unknown thread");
        return;
    }

    thread.set_state(ThreadState::Exited);
    if thread.open_channels() != 0 {
        warn!(
            thread = %thread.name(),
            channels = thread.open_channels(),
            "thread freed with open channels"
        );
    }

    let mut dropped = 0usize;
    while let Some(msg) = thread.inner.messages.pop() {
        drop(msg);
        dropped += 1;
    }
    if dropped > 0 {
        warn!(thread = %thread.name(), dropped, "thread freed with pending messages");
    }
    debug!(thread = %thread.name(), "thread freed");
}

/// Queue `f` to run on `thread`
#[inline]
pub fn send_msg<F>(thread: &Thread, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread.send_msg(f)
}

/// The logical thread current on this OS thread
#[inline]
pub fn get_thread() -> Option<Thread> {
    tls::current_thread()
}

pub fn get_thread_by_id(id: ThreadId) -> Option<Thread> {
    registry::lock().threads.get(&id).cloned()
}

/// The first thread allocated, while it is still allocated
pub fn app_thread() -> Option<Thread> {
    registry::lock().app_thread.clone()
}

pub fn thread_count() -> usize {
    registry::lock().threads.len()
}

/// Running threads in allocation order
pub(crate) fn running_threads() -> Vec<Thread> {
    registry::lock()
        .threads
        .values()
        .filter(|t| t.is_running())
        .cloned()
        .collect()
}
