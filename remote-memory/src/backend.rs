//! Backend Interface
//!
//! The memory table never talks to a device directly. A backend plugs in by
//! implementing [`RemoteAllocator`] and is injected at table construction,
//! so there is no process-wide allocator to swap at runtime.

use std::sync::Arc;

use crate::handle::RemoteHandle;

/// Raw allocation primitives of a remote memory space.
///
/// Implementations must be thread-safe: the table calls `allocate` and
/// `release` from worker threads and from finalizer threads without holding
/// any lock of its own.
pub trait RemoteAllocator: Send + Sync {
    /// Allocation granularity the backend currently prefers, in bytes.
    ///
    /// Queried on every allocation; backends may change it over time.
    fn chunk_size(&self) -> usize;

    /// Allocate `bytes` bytes of remote memory.
    ///
    /// Returns `None` when the remote space is exhausted.
    fn allocate(&self, bytes: usize) -> Option<RemoteHandle>;

    /// Return an allocation to the remote space.
    fn release(&self, handle: RemoteHandle);
}

impl<A: RemoteAllocator + ?Sized> RemoteAllocator for Arc<A> {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    fn allocate(&self, bytes: usize) -> Option<RemoteHandle> {
        (**self).allocate(bytes)
    }

    fn release(&self, handle: RemoteHandle) {
        (**self).release(handle)
    }
}

impl<A: RemoteAllocator + ?Sized> RemoteAllocator for &A {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    fn allocate(&self, bytes: usize) -> Option<RemoteHandle> {
        (**self).allocate(bytes)
    }

    fn release(&self, handle: RemoteHandle) {
        (**self).release(handle)
    }
}
