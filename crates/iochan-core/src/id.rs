//! Thread and device identifier types

use core::fmt;
use std::sync::Arc;

/// Unique identifier for a logical thread
///
/// Ids are handed out monotonically starting at 1, so ordering by id is
/// ordering by allocation. Zero is reserved as the "no thread" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Sentinel value indicating no thread
    pub const NONE: ThreadId = ThreadId(0);

    /// First id handed out by the registry
    pub const FIRST: ThreadId = ThreadId(1);

    #[inline]
    pub const fn new(id: u64) -> Self {
        ThreadId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The id following this one
    #[inline]
    pub const fn next(self) -> ThreadId {
        ThreadId(self.0 + 1)
    }

    #[inline]
    pub const fn to_option(self) -> Option<ThreadId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for ThreadId {
    #[inline]
    fn from(id: u64) -> Self {
        ThreadId(id)
    }
}

impl From<ThreadId> for u64 {
    #[inline]
    fn from(id: ThreadId) -> Self {
        id.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ThreadId(NONE)")
        } else {
            write!(f, "ThreadId({})", self.0)
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        ThreadId::NONE
    }
}

/// Identity of a registered I/O device
///
/// A device is keyed by the address of the object its owner registered.
/// The registry keeps that object alive for as long as the entry exists,
/// so the address cannot be reused by another device in the meantime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceId(usize);

impl DeviceId {
    /// Identity of the object behind an `Arc`
    #[inline]
    pub fn of<T: ?Sized>(obj: &Arc<T>) -> Self {
        DeviceId(Arc::as_ptr(obj) as *const () as usize)
    }

    /// Identity of a referenced object.
    ///
    /// Equal to [`DeviceId::of`] when `obj` points into the same `Arc`,
    /// which is what lets a device find its own id from `&self`.
    #[inline]
    pub fn from_ref<T: ?Sized>(obj: &T) -> Self {
        DeviceId(obj as *const T as *const () as usize)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        DeviceId(addr)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:#x})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_basics() {
        let id = ThreadId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(!id.is_none());
        assert_eq!(id.next(), ThreadId::new(43));
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_thread_id_none() {
        let none = ThreadId::NONE;
        assert!(none.is_none());
        assert_eq!(none.to_option(), None);
        assert_eq!(ThreadId::default(), ThreadId::NONE);
        assert_eq!(format!("{:?}", none), "ThreadId(NONE)");
    }

    #[test]
    fn test_thread_id_ordering() {
        assert!(ThreadId::FIRST < ThreadId::FIRST.next());
        let raw: u64 = ThreadId::from(7u64).into();
        assert_eq!(raw, 7);
    }

    #[test]
    fn test_device_id_identity() {
        let a = Arc::new(5u32);
        let b = Arc::new(5u32);
        assert_eq!(DeviceId::of(&a), DeviceId::of(&a.clone()));
        assert_ne!(DeviceId::of(&a), DeviceId::of(&b));
        assert_eq!(DeviceId::of(&a), DeviceId::from_ref(&*a));
    }

    #[test]
    fn test_device_id_unsized() {
        let a: Arc<dyn fmt::Debug + Send + Sync> = Arc::new(1u8);
        let id = DeviceId::of(&a);
        assert_eq!(id.addr(), Arc::as_ptr(&a) as *const () as usize);
        assert!(format!("{}", id).starts_with("0x"));
    }
}
