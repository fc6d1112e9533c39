//! Thread-local storage for the current logical thread
//!
//! A logical thread is "current" on an OS thread while it is being polled or
//! while a [`ThreadGuard`](crate::thread::ThreadGuard) for it is alive.

use std::cell::{Cell, RefCell};

use iochan_core::ThreadId;

use crate::thread::Thread;

thread_local! {
    /// Id of the logical thread current on this OS thread
    static CURRENT_ID: Cell<u64> = const { Cell::new(0) };

    /// Handle of the logical thread current on this OS thread
    static CURRENT: RefCell<Option<Thread>> = const { RefCell::new(None) };
}

/// Install `thread` as current, returning the previous one
pub(crate) fn set_current(thread: Option<Thread>) -> Option<Thread> {
    let id = thread.as_ref().map_or(0, |t| t.id().as_u64());
    CURRENT_ID.with(|cell| cell.set(id));
    CURRENT.with(|cell| cell.replace(thread))
}

/// Id of the current logical thread, `ThreadId::NONE` if there is none
#[inline]
pub fn current_thread_id() -> ThreadId {
    ThreadId::new(CURRENT_ID.with(|cell| cell.get()))
}

/// Handle of the current logical thread
#[inline]
pub fn current_thread() -> Option<Thread> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Check if a logical thread is current on this OS thread
#[inline]
pub fn is_on_thread() -> bool {
    CURRENT_ID.with(|cell| cell.get() != 0)
}
