//! Remote Handles
//!
//! A [`RemoteHandle`] is an opaque address in the remote (device) address
//! space. It carries no ownership: the memory table decides when a handle
//! goes back to the nursery or to the backend.
//!
//! [`DevicePtr<T>`] tags a handle with an element type so callers cannot mix
//! up buffers of different element types. Casting only changes the tag.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Opaque address of an allocation in the remote memory space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteHandle(u64);

impl RemoteHandle {
    /// Wrap a raw remote address.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw remote address.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Tag this handle with an element type.
    pub fn typed<T>(self) -> DevicePtr<T> {
        DevicePtr::new(self)
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteHandle({:#x})", self.0)
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A remote handle tagged with its element type.
///
/// `DevicePtr<T>` is `Copy` regardless of `T` and has the same
/// representation as [`RemoteHandle`].
#[repr(transparent)]
pub struct DevicePtr<T> {
    handle: RemoteHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DevicePtr<T> {
    /// Tag a raw handle.
    pub const fn new(handle: RemoteHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    /// The untyped handle.
    pub const fn handle(&self) -> RemoteHandle {
        self.handle
    }

    /// Re-tag the handle with another element type.
    pub fn cast<U>(self) -> DevicePtr<U> {
        DevicePtr::new(self.handle)
    }
}

impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DevicePtr<T> {}

impl<T> PartialEq for DevicePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for DevicePtr<T> {}

impl<T> Hash for DevicePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl<T> fmt::Debug for DevicePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DevicePtr<{}>({:#x})",
            std::any::type_name::<T>(),
            self.handle.as_u64()
        )
    }
}

impl<T> From<DevicePtr<T>> for RemoteHandle {
    fn from(ptr: DevicePtr<T>) -> Self {
        ptr.handle
    }
}
