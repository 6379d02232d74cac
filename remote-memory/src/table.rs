//! # Memory Table
//!
//! Concurrent map from host buffer identity to the remote allocation that
//! mirrors it.
//!
//! ## Design
//!
//! - One mutex guards the map. Critical sections are O(1) map work: no
//!   backend call, no death callback and no strong buffer reference is ever
//!   taken while it is held.
//! - Every entry holds a weak [`Observation`] of its buffer. The death
//!   callback captures only a `Weak` reference to the table, so it becomes
//!   a no-op once the table is torn down.
//! - Removal is idempotent. Whichever of `free`, the death callback or a
//!   `clean` sweep removes the entry first retires it; the others see
//!   "already removed", which is not an error.
//!
//! ## Allocation ladder
//!
//! `malloc` rounds the request to the backend's chunk size, then tries, in
//! order: the nursery, the backend, `clean` + nursery, `purge` + backend.
//! Exhaustion after the last step returns `None`.

use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::accounting::{round_to_chunk, AllocationStats, StatsSnapshot};
use crate::backend::RemoteAllocator;
use crate::config::{MemoryConfig, ReclaimConfig};
use crate::error::{MemoryError, Operation, Result};
use crate::handle::{DevicePtr, RemoteHandle};
use crate::liveness::{BufferId, Collector, HostBuffer, Observation};
use crate::nursery::Nursery;

/// A table entry.
pub(crate) struct Entry {
    pub(crate) handle: RemoteHandle,
    /// Rounded size; 0 for unmanaged entries.
    pub(crate) bytes: usize,
    pub(crate) observation: Observation,
}

/// Why an entry left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Explicit,
    Finalizer,
    Clean,
    Replaced,
}

/// Read-only view of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Buffer identity.
    pub id: BufferId,
    /// Remote allocation.
    pub handle: RemoteHandle,
    /// Size in bytes (0 for unmanaged entries).
    pub bytes: usize,
    /// Whether the buffer was still alive when the view was taken.
    pub alive: bool,
}

impl EntryInfo {
    /// Whether the entry's memory is owned by the caller.
    pub fn is_unmanaged(&self) -> bool {
        self.bytes == 0
    }
}

pub(crate) struct TableInner {
    pub(crate) entries: Mutex<HashMap<BufferId, Entry>>,
    pub(crate) nursery: Nursery,
    pub(crate) allocator: Arc<dyn RemoteAllocator>,
    pub(crate) collector: Collector,
    pub(crate) stats: AllocationStats,
    pub(crate) reclaim: ReclaimConfig,
}

impl TableInner {
    /// Record `handle` for `buffer` and attach the death callback.
    fn register(self: &Arc<Self>, buffer: &HostBuffer, handle: RemoteHandle, bytes: usize) {
        let id = buffer.id();
        let table: Weak<TableInner> = Arc::downgrade(self);
        let observation = self.collector.observe(
            buffer,
            Some(Box::new(move |dead| {
                if let Some(table) = table.upgrade() {
                    table.remove(dead, Removal::Finalizer);
                }
            })),
        );

        let displaced = self.entries.lock().insert(
            id,
            Entry {
                handle,
                bytes,
                observation,
            },
        );
        self.stats.entry_added(bytes);
        trace!(buffer = %id, %handle, bytes, "registered");

        if let Some(old) = displaced {
            debug!(buffer = %id, old = %old.handle, new = %handle, "replacing existing entry");
            if old.handle == handle {
                // Same allocation re-registered: only the old callback goes.
                self.stats.entry_removed(old.bytes);
                old.observation.cancel();
            } else {
                self.retire(id, old, Removal::Replaced);
            }
        }
    }

    /// Remove the entry for `id`, if any.
    pub(crate) fn remove(&self, id: BufferId, reason: Removal) -> bool {
        let removed = self.entries.lock().remove(&id);
        match removed {
            Some(entry) => {
                self.retire(id, entry, reason);
                true
            }
            None => {
                AllocationStats::bump(&self.stats.benign_races);
                trace!(buffer = %id, ?reason, "entry already removed");
                false
            }
        }
    }

    /// Dispose of an entry that is no longer in the map.
    fn retire(&self, id: BufferId, entry: Entry, reason: Removal) {
        self.stats.entry_removed(entry.bytes);
        match reason {
            Removal::Explicit => AllocationStats::bump(&self.stats.explicit_frees),
            Removal::Finalizer => AllocationStats::bump(&self.stats.finalizer_frees),
            Removal::Clean => AllocationStats::bump(&self.stats.cleaned_entries),
            Removal::Replaced => {}
        }

        entry.observation.cancel();

        if entry.bytes == 0 {
            trace!(buffer = %id, handle = %entry.handle, ?reason, "unmanaged entry dropped");
            return;
        }

        trace!(buffer = %id, handle = %entry.handle, bytes = entry.bytes, ?reason, "to nursery");
        if let Some(rejected) = self.nursery.insert(entry.bytes, entry.handle) {
            self.allocator.release(rejected);
            AllocationStats::bump(&self.stats.released_handles);
        }
    }

    fn take_from_nursery(&self, bytes: usize) -> Option<RemoteHandle> {
        if !self.nursery.is_enabled() {
            return None;
        }
        match self.nursery.lookup(bytes) {
            Some(handle) => {
                AllocationStats::bump(&self.stats.nursery_hits);
                Some(handle)
            }
            None => {
                AllocationStats::bump(&self.stats.nursery_misses);
                None
            }
        }
    }

    fn allocate_fresh(&self, bytes: usize) -> Option<RemoteHandle> {
        let handle = self.allocator.allocate(bytes)?;
        AllocationStats::bump(&self.stats.fresh_allocations);
        Some(handle)
    }

    /// Run the allocation ladder for a rounded size.
    fn acquire(&self, bytes: usize) -> Option<RemoteHandle> {
        if let Some(handle) = self.take_from_nursery(bytes) {
            return Some(handle);
        }
        if let Some(handle) = self.allocate_fresh(bytes) {
            return Some(handle);
        }

        if self.reclaim.clean_on_pressure {
            debug!(bytes, "allocation failed, cleaning dead entries");
            self.clean();
            if let Some(handle) = self.take_from_nursery(bytes) {
                return Some(handle);
            }
        }

        if self.reclaim.purge_on_pressure {
            debug!(bytes, "allocation failed, purging nursery");
            self.purge();
            if let Some(handle) = self.allocate_fresh(bytes) {
                return Some(handle);
            }
        }

        None
    }
}

impl Drop for TableInner {
    fn drop(&mut self) {
        let entries = std::mem::take(self.entries.get_mut());
        let mut released = 0usize;
        for entry in entries.into_values() {
            if entry.bytes > 0 {
                self.allocator.release(entry.handle);
                released += 1;
            }
        }
        let (purged, _) = self.nursery.cleanup(|handle| self.allocator.release(handle));

        if released + purged > 0 {
            debug!(entries = released, nursery = purged, "memory table torn down");
        }
    }
}

/// Map from host buffers to the remote allocations mirroring them.
///
/// Cheap to clone; clones share the same table. The table is torn down
/// when the last clone is dropped: remaining managed allocations and the
/// whole nursery are released to the backend.
#[derive(Clone)]
pub struct MemoryTable {
    pub(crate) inner: Arc<TableInner>,
}

impl MemoryTable {
    /// Create an empty table with default configuration.
    ///
    /// `allocator.release` is only called by purges, by teardown and when
    /// the nursery refuses a handle.
    pub fn new(allocator: Arc<dyn RemoteAllocator>, collector: Collector) -> Self {
        Self::with_config(allocator, collector, &MemoryConfig::default())
    }

    /// Create an empty table.
    pub fn with_config(
        allocator: Arc<dyn RemoteAllocator>,
        collector: Collector,
        config: &MemoryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: Mutex::new(HashMap::new()),
                nursery: Nursery::with_config(&config.nursery),
                allocator,
                collector,
                stats: AllocationStats::new(),
                reclaim: config.reclaim.clone(),
            }),
        }
    }

    /// Get the remote allocation registered for `buffer`.
    ///
    /// Returns `Ok(None)` if the buffer has no entry. An entry whose weak
    /// observation is dead cannot exist while the caller borrows the
    /// buffer; finding one is reported as [`MemoryError::DeadObservation`]
    /// and should be treated as fatal.
    pub fn lookup<T>(&self, buffer: &HostBuffer) -> Result<Option<DevicePtr<T>>> {
        let id = buffer.id();
        let found = self
            .inner
            .entries
            .lock()
            .get(&id)
            .map(|entry| (entry.handle, entry.observation.is_alive()));

        match found {
            None => Ok(None),
            Some((handle, true)) => Ok(Some(handle.typed())),
            Some((handle, false)) => {
                error!(
                    buffer = %id,
                    %handle,
                    operation = %Operation::Lookup,
                    "weak observation dead while buffer is borrowed"
                );
                Err(MemoryError::DeadObservation {
                    id,
                    operation: Operation::Lookup,
                })
            }
        }
    }

    /// Allocate remote memory for `count` elements of `T` mirroring `buffer`.
    ///
    /// Returns `None` when remote memory is exhausted after cleaning and
    /// purging. Any previous entry for the buffer is freed.
    pub fn malloc<T>(&self, buffer: &HostBuffer, count: usize) -> Option<DevicePtr<T>> {
        let id = buffer.id();
        let Some(requested) = count.checked_mul(size_of::<T>()) else {
            warn!(buffer = %id, count, element = size_of::<T>(), "allocation size overflows");
            AllocationStats::bump(&self.inner.stats.allocation_failures);
            return None;
        };

        let chunk_size = self.inner.allocator.chunk_size();
        let Some(bytes) = round_to_chunk(requested, chunk_size) else {
            warn!(buffer = %id, requested, chunk_size, "rounded allocation size overflows");
            AllocationStats::bump(&self.inner.stats.allocation_failures);
            return None;
        };

        match self.inner.acquire(bytes) {
            Some(handle) => {
                self.inner.register(buffer, handle, bytes);
                Some(handle.typed())
            }
            None => {
                AllocationStats::bump(&self.inner.stats.allocation_failures);
                warn!(buffer = %id, requested, bytes, "remote memory exhausted");
                None
            }
        }
    }

    /// Free the allocation registered for `buffer`.
    ///
    /// Managed allocations go to the nursery; unmanaged entries are just
    /// forgotten. Returns `false` if there was no entry.
    pub fn free(&self, buffer: &HostBuffer) -> bool {
        self.inner.remove(buffer.id(), Removal::Explicit)
    }

    /// Free the allocation registered under `id`.
    ///
    /// Same as [`MemoryTable::free`] but usable without the buffer, e.g.
    /// from a finalizer.
    pub fn free_by_identity(&self, id: BufferId) -> bool {
        self.inner.remove(id, Removal::Explicit)
    }

    /// Register a managed allocation of `bytes` bytes for `buffer`.
    ///
    /// When the buffer dies the allocation moves to the nursery. A zero
    /// size is rejected; use [`MemoryTable::insert_unmanaged`] for memory
    /// the table does not own.
    pub fn insert<T>(&self, buffer: &HostBuffer, ptr: DevicePtr<T>, bytes: usize) -> Result<()> {
        if bytes == 0 {
            error!(
                buffer = %buffer.id(),
                handle = %ptr.handle(),
                operation = %Operation::Insert,
                "managed entry with zero size"
            );
            return Err(MemoryError::ZeroSizedEntry {
                id: buffer.id(),
                operation: Operation::Insert,
            });
        }
        self.inner.register(buffer, ptr.handle(), bytes);
        Ok(())
    }

    /// Register memory the table does not own.
    ///
    /// The entry is removed when the buffer dies, but the handle is never
    /// cached in the nursery nor released by the table.
    pub fn insert_unmanaged<T>(&self, buffer: &HostBuffer, ptr: DevicePtr<T>) {
        self.inner.register(buffer, ptr.handle(), 0);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Whether `buffer` has an entry.
    pub fn contains(&self, buffer: &HostBuffer) -> bool {
        self.contains_id(buffer.id())
    }

    /// Whether `id` has an entry.
    pub fn contains_id(&self, id: BufferId) -> bool {
        self.inner.entries.lock().contains_key(&id)
    }

    /// Size of the entry for `buffer` (0 for unmanaged entries).
    pub fn entry_bytes(&self, buffer: &HostBuffer) -> Option<usize> {
        self.inner.entries.lock().get(&buffer.id()).map(|entry| entry.bytes)
    }

    /// Copy of every entry, in no particular order.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| EntryInfo {
                id: *id,
                handle: entry.handle,
                bytes: entry.bytes,
                alive: entry.observation.is_alive(),
            })
            .collect()
    }

    /// The nursery backing this table.
    pub fn nursery(&self) -> &Nursery {
        &self.inner.nursery
    }

    /// The collector used for weak observations.
    pub fn collector(&self) -> &Collector {
        &self.inner.collector
    }

    /// The backend allocator.
    pub fn allocator(&self) -> &Arc<dyn RemoteAllocator> {
        &self.inner.allocator
    }

    /// Snapshot of the table's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("entries", &self.len())
            .field("nursery", &self.inner.nursery)
            .field("collector", &self.inner.collector)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;

    fn table_with(device: &Arc<SimulatedDevice>) -> (MemoryTable, Collector) {
        let collector = Collector::immediate();
        let allocator: Arc<dyn RemoteAllocator> = device.clone();
        (MemoryTable::new(allocator, collector.clone()), collector)
    }

    #[test]
    fn test_malloc_rounds_to_chunk() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 40);

        let ptr = table.malloc::<u32>(&buffer, 10).unwrap();
        assert_eq!(table.entry_bytes(&buffer), Some(256));
        assert_eq!(table.lookup::<u32>(&buffer).unwrap(), Some(ptr));
        assert_eq!(device.used(), 256);
    }

    #[test]
    fn test_chunk_size_queried_per_allocation() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);

        let a = HostBuffer::zeroed(&collector, 8);
        table.malloc::<u8>(&a, 8).unwrap();
        device.set_chunk_size(1024);
        let b = HostBuffer::zeroed(&collector, 8);
        table.malloc::<u8>(&b, 8).unwrap();

        assert_eq!(table.entry_bytes(&a), Some(256));
        assert_eq!(table.entry_bytes(&b), Some(1024));
    }

    #[test]
    fn test_lookup_absent() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);
        assert_eq!(table.lookup::<u8>(&buffer).unwrap(), None);
    }

    #[test]
    fn test_free_moves_to_nursery() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        let ptr = table.malloc::<u8>(&buffer, 8).unwrap();
        assert!(table.free(&buffer));
        assert!(!table.contains(&buffer));
        assert!(table.nursery().contains(ptr.handle()));
        assert_eq!(device.releases(), 0);

        // Second free is a benign no-op.
        assert!(!table.free(&buffer));
        assert_eq!(table.nursery().size(), 1);
        assert_eq!(table.stats().benign_races, 1);
    }

    #[test]
    fn test_free_cancels_death_callback() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        table.malloc::<u8>(&buffer, 8).unwrap();
        assert_eq!(buffer.observer_count(), 1);
        table.free(&buffer);
        assert_eq!(buffer.observer_count(), 0);

        drop(buffer);
        assert_eq!(table.stats().finalizer_frees, 0);
        assert_eq!(table.stats().benign_races, 0);
    }

    #[test]
    fn test_buffer_death_returns_to_nursery() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        let ptr = table.malloc::<u8>(&buffer, 8).unwrap();
        drop(buffer);

        assert!(table.is_empty());
        assert!(table.nursery().contains(ptr.handle()));
        assert_eq!(table.stats().finalizer_frees, 1);
    }

    #[test]
    fn test_insert_zero_size_rejected() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        let err = table
            .insert::<u8>(&buffer, RemoteHandle::new(0x10).typed(), 0)
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(
            err,
            MemoryError::ZeroSizedEntry { id, operation: Operation::Insert } if id == buffer.id()
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_lookup_dead_observation_is_fatal() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        // Entry for a live buffer whose observation points at a dead one.
        let gone = HostBuffer::zeroed(&collector, 8);
        let observation = collector.observe(&gone, None);
        drop(gone);
        assert!(!observation.is_alive());
        table.inner.entries.lock().insert(
            buffer.id(),
            Entry {
                handle: RemoteHandle::new(0xbad0),
                bytes: 0,
                observation,
            },
        );

        let err = table.lookup::<u8>(&buffer).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DeadObservation { id, operation: Operation::Lookup } if id == buffer.id()
        ));
        assert!(err.is_invariant_violation());
        assert_eq!(err.buffer(), Some(buffer.id()));

        // The entry is left in place for diagnosis.
        assert!(table.contains(&buffer));
    }

    #[test]
    fn test_reinsert_replaces_entry() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        let first = table.malloc::<u8>(&buffer, 8).unwrap();
        let second = table.malloc::<u8>(&buffer, 300).unwrap();
        assert_ne!(first, second);

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup::<u8>(&buffer).unwrap(), Some(second));
        assert!(table.nursery().contains(first.handle()));
        assert_eq!(buffer.observer_count(), 1);
        assert_eq!(table.stats().live_managed, 1);
    }

    #[test]
    fn test_reinsert_same_handle_not_cached() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);

        let ptr = table.malloc::<u8>(&buffer, 8).unwrap();
        table.insert(&buffer, ptr, 256).unwrap();

        assert_eq!(table.len(), 1);
        assert!(table.nursery().is_empty());
        assert_eq!(buffer.observer_count(), 1);
        assert_eq!(table.stats().managed_bytes, 256);
    }

    #[test]
    fn test_unmanaged_entry() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);
        let foreign = RemoteHandle::new(0xdead_0000);

        table.insert_unmanaged::<f32>(&buffer, foreign.typed());
        assert_eq!(table.entry_bytes(&buffer), Some(0));
        assert_eq!(table.lookup::<f32>(&buffer).unwrap().map(|p| p.handle()), Some(foreign));

        assert!(table.free(&buffer));
        assert!(table.nursery().is_empty());
        assert_eq!(device.invalid_releases(), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let device = Arc::new(SimulatedDevice::new(512, 256));
        let (table, collector) = table_with(&device);

        let a = HostBuffer::zeroed(&collector, 8);
        let b = HostBuffer::zeroed(&collector, 8);
        table.malloc::<u8>(&a, 512).unwrap();
        assert!(table.malloc::<u8>(&b, 1).is_none());
        assert_eq!(table.stats().allocation_failures, 1);
        assert!(!table.contains(&b));
    }

    #[test]
    fn test_overflowing_request_returns_none() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);
        assert!(table.malloc::<u64>(&buffer, usize::MAX).is_none());
        assert_eq!(device.allocations(), 0);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = table_with(&device);

        let live = HostBuffer::zeroed(&collector, 8);
        let freed = HostBuffer::zeroed(&collector, 8);
        let foreign = HostBuffer::zeroed(&collector, 8);
        table.malloc::<u8>(&live, 8).unwrap();
        table.malloc::<u8>(&freed, 8).unwrap();
        table.insert_unmanaged::<u8>(&foreign, RemoteHandle::new(0xf00).typed());
        table.free(&freed);

        drop(table);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.releases(), 2);
        assert_eq!(device.invalid_releases(), 0);

        // Death callbacks after teardown are no-ops.
        drop(live);
        drop(foreign);
        assert_eq!(device.invalid_releases(), 0);
    }

    #[test]
    fn test_entries_view() {
        let device = Arc::new(SimulatedDevice::unbounded(128));
        let (table, collector) = table_with(&device);
        let buffer = HostBuffer::zeroed(&collector, 8);
        let ptr = table.malloc::<u16>(&buffer, 4).unwrap();

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, buffer.id());
        assert_eq!(entries[0].handle, ptr.handle());
        assert_eq!(entries[0].bytes, 128);
        assert!(entries[0].alive);
        assert!(!entries[0].is_unmanaged());
    }
}
