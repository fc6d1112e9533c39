//! Pollers
//!
//! A poller is a closure a thread runs from [`Thread::poll`] after draining
//! messages: on every poll (period zero) or at most once per period. Device
//! channels use them to reap completions.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use iochan_core::{Error, PollStatus, PollerState, Result, ThreadId};

use crate::thread::Thread;
use crate::tls;

static NEXT_POLLER_ID: AtomicU64 = AtomicU64::new(1);

struct PollerShared {
    id: u64,
    name: String,
    thread: ThreadId,
    state: AtomicU8,
}

/// Handle to a registered poller
#[derive(Clone)]
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl Poller {
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Thread the poller runs on
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    #[inline]
    pub fn state(&self) -> PollerState {
        PollerState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// Stop running the poller; it is dropped at the next poll
    pub fn unregister(&self) {
        self.shared
            .state
            .store(PollerState::Unregistered.into(), Ordering::Release);
        debug!(poller = %self.shared.name, "poller unregistered");
    }

    /// Skip the poller until [`resume`](Self::resume)
    pub fn pause(&self) {
        let _ = self.shared.state.compare_exchange(
            PollerState::Waiting.into(),
            PollerState::Paused.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn resume(&self) {
        let _ = self.shared.state.compare_exchange(
            PollerState::Paused.into(),
            PollerState::Waiting.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct PollerEntry {
    shared: Arc<PollerShared>,
    period: Duration,
    next_run: Instant,
    f: Box<dyn FnMut() -> PollStatus + Send>,
}

impl PollerEntry {
    #[inline]
    pub(crate) fn state(&self) -> PollerState {
        PollerState::from(self.shared.state.load(Ordering::Acquire))
    }
}

/// Register a poller on the current thread.
///
/// A zero `period` runs the poller on every poll; otherwise it runs at most
/// once per period.
pub fn register_poller<F>(name: &str, period: Duration, f: F) -> Result<Poller>
where
    F: FnMut() -> PollStatus + Send + 'static,
{
    let thread = tls::current_thread().ok_or(Error::NotOnThread)?;
    let max = thread.inner.max_pollers;

    let shared = Arc::new(PollerShared {
        id: NEXT_POLLER_ID.fetch_add(1, Ordering::Relaxed),
        name: name.to_string(),
        thread: thread.id(),
        state: AtomicU8::new(PollerState::Waiting.into()),
    });
    let entry = PollerEntry {
        shared: shared.clone(),
        period,
        next_run: Instant::now() + period,
        f: Box::new(f),
    };

    thread.inner.local.with(|local| {
        let live = local
            .pollers
            .iter()
            .filter(|p| p.state() != PollerState::Unregistered)
            .count();
        if live >= max {
            return Err(Error::TooManyPollers(max));
        }
        local.pollers.push(entry);
        Ok(())
    })??;

    debug!(poller = %name, thread = %thread.name(), ?period, "poller registered");
    Ok(Poller { shared })
}

/// Run the due pollers of `thread`, which must be current
pub(crate) fn run_pollers(thread: &Thread) -> Result<PollStatus> {
    // Pollers run with the table released so they may register or
    // unregister pollers themselves.
    let mut pollers = thread
        .inner
        .local
        .with(|local| std::mem::take(&mut local.pollers))?;
    if pollers.is_empty() {
        return Ok(PollStatus::Idle);
    }

    let mut status = PollStatus::Idle;
    for entry in pollers.iter_mut() {
        if entry.state() != PollerState::Waiting {
            continue;
        }
        if !entry.period.is_zero() {
            let now = Instant::now();
            if now < entry.next_run {
                continue;
            }
            entry.next_run = now + entry.period;
        }
        let result = (entry.f)();
        trace!(poller = %entry.shared.name, ?result, "poller ran");
        thread.record_poller_run();
        status = status.merge(result);
    }

    let (keep, dead): (Vec<_>, Vec<_>) = pollers
        .into_iter()
        .partition(|p| p.state() != PollerState::Unregistered);
    thread.inner.local.with(|local| {
        let added = std::mem::replace(&mut local.pollers, keep);
        local.pollers.extend(added);
    })?;
    drop(dead);

    Ok(status)
}
