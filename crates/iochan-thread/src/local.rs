//! Owner-thread cells
//!
//! State that belongs to one logical thread (its channel table, its pollers,
//! a channel's context) lives in an [`OwnerCell`]. Access is checked against
//! the current logical thread instead of being locked.

use std::cell::{RefCell, RefMut};

use iochan_core::{Error, Result, ThreadId};

use crate::tls;

pub(crate) struct OwnerCell<T> {
    owner: ThreadId,
    label: &'static str,
    cell: RefCell<T>,
}

// Safety: the cell is only borrowed while `owner` is the current logical
// thread, and `Thread::enter` guarantees a logical thread is current on at
// most one OS thread at a time.
unsafe impl<T: Send> Sync for OwnerCell<T> {}

impl<T> OwnerCell<T> {
    pub(crate) fn new(owner: ThreadId, label: &'static str, value: T) -> Self {
        Self {
            owner,
            label,
            cell: RefCell::new(value),
        }
    }

    fn check_owner(&self) -> Result<()> {
        let actual = tls::current_thread_id();
        if actual != self.owner {
            return Err(Error::WrongThread {
                expected: self.owner,
                actual,
            });
        }
        Ok(())
    }

    /// Borrow the value mutably; owner thread only, not reentrant
    pub(crate) fn borrow_mut(&self) -> Result<RefMut<'_, T>> {
        self.check_owner()?;
        self.cell
            .try_borrow_mut()
            .map_err(|_| Error::ContextBusy(self.label.to_string()))
    }

    /// Run `f` with the value borrowed mutably
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.borrow_mut()?;
        Ok(f(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHarness;

    #[test]
    fn test_owner_access() {
        let mut sim = SimHarness::new(2);
        let owner = sim.thread(0).id();
        let cell = OwnerCell::new(owner, "counter", 0u32);

        assert!(matches!(cell.with(|v| *v += 1), Err(Error::WrongThread { .. })));

        sim.set_thread(1);
        let err = cell.with(|v| *v += 1).unwrap_err();
        assert!(matches!(err, Error::WrongThread { expected, .. } if expected == owner));

        sim.set_thread(0);
        cell.with(|v| *v += 1).unwrap();
        assert_eq!(cell.with(|v| *v).unwrap(), 1);
    }

    #[test]
    fn test_reentrant_borrow_rejected() {
        let mut sim = SimHarness::new(1);
        sim.set_thread(0);
        let cell = OwnerCell::new(sim.thread(0).id(), "table", Vec::<u8>::new());

        let _held = cell.borrow_mut().unwrap();
        assert!(matches!(cell.with(|v| v.push(1)), Err(Error::ContextBusy(l)) if l == "table"));
    }
}
