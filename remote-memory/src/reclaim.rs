//! # Reclamation
//!
//! Two independently invokable recovery phases for the memory table:
//!
//! - **clean**: run pending finalizations, then sweep entries whose buffer
//!   is dead and move their allocations to the nursery.
//! - **purge**: release every nursery allocation to the backend.
//!
//! `reclaim` runs both, in that order. The allocation ladder in
//! [`MemoryTable::malloc`] uses the same phases under memory pressure.
//!
//! Host buffers are reference counted, so with
//! [`FinalizationMode::Immediate`] a dead buffer's entry is normally gone
//! before any sweep could see it and `clean` finds nothing. The sweep
//! matters for [`FinalizationMode::Deferred`], where a buffer can be dead
//! while its death callback is still queued.
//!
//! [`FinalizationMode::Immediate`]: crate::liveness::FinalizationMode::Immediate
//! [`FinalizationMode::Deferred`]: crate::liveness::FinalizationMode::Deferred

use tracing::debug;

use crate::accounting::AllocationStats;
use crate::liveness::BufferId;
use crate::table::{MemoryTable, Removal, TableInner};

/// Outcome of a [`MemoryTable::reclaim`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Entries removed by the clean phase.
    pub cleaned: usize,
    /// Handles released by the purge phase.
    pub purged: usize,
    /// Bytes released by the purge phase.
    pub purged_bytes: usize,
}

impl TableInner {
    pub(crate) fn clean(&self) -> usize {
        AllocationStats::bump(&self.stats.cleans);
        let finalized = self.collector.request_collection_pass();

        let dead: Vec<BufferId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.observation.is_alive())
            .map(|(id, _)| *id)
            .collect();

        // Entries removed concurrently since the snapshot are skipped.
        let cleaned = dead
            .into_iter()
            .filter(|id| self.remove(*id, Removal::Clean))
            .count();

        debug!(finalized, cleaned, "clean");
        cleaned
    }

    pub(crate) fn purge(&self) -> (usize, usize) {
        AllocationStats::bump(&self.stats.purges);
        let (count, bytes) = self.nursery.cleanup(|handle| self.allocator.release(handle));
        self.stats
            .released_handles
            .fetch_add(count as u64, std::sync::atomic::Ordering::Relaxed);
        debug!(handles = count, bytes, "purge");
        (count, bytes)
    }
}

impl MemoryTable {
    /// Sweep entries whose host buffer has died.
    ///
    /// Requests a collection pass first. Returns the number of entries this
    /// call removed; entries already removed by someone else are skipped.
    pub fn clean(&self) -> usize {
        self.inner.clean()
    }

    /// Release every nursery allocation to the backend.
    ///
    /// Returns the number of handles released. The nursery is empty
    /// afterwards (until the next free).
    pub fn purge(&self) -> usize {
        self.inner.purge().0
    }

    /// Run [`clean`](MemoryTable::clean) then [`purge`](MemoryTable::purge).
    pub fn reclaim(&self) -> ReclaimReport {
        let cleaned = self.inner.clean();
        let (purged, purged_bytes) = self.inner.purge();
        ReclaimReport {
            cleaned,
            purged,
            purged_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::RemoteAllocator;
    use crate::liveness::{Collector, HostBuffer};
    use crate::sim::SimulatedDevice;
    use crate::table::MemoryTable;

    fn deferred_table(device: &Arc<SimulatedDevice>) -> (MemoryTable, Collector) {
        let collector = Collector::deferred();
        let allocator: Arc<dyn RemoteAllocator> = device.clone();
        (MemoryTable::new(allocator, collector.clone()), collector)
    }

    #[test]
    fn test_clean_removes_dead_entries() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = deferred_table(&device);

        let dead = HostBuffer::zeroed(&collector, 8);
        let alive = HostBuffer::zeroed(&collector, 8);
        let dead_ptr = table.malloc::<u8>(&dead, 8).unwrap();
        table.malloc::<u8>(&alive, 8).unwrap();
        drop(dead);

        // Deferred: the entry survives the drop.
        assert_eq!(table.len(), 2);
        assert_eq!(collector.pending(), 1);

        table.clean();
        assert_eq!(table.len(), 1);
        assert!(table.contains(&alive));
        assert!(table.nursery().contains(dead_ptr.handle()));
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_sweep_without_collection_pass() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let buffers_collector = Collector::deferred();
        // The table uses its own collector, so its pass does not run the
        // buffer's queued callback; the sweep still finds the dead entry.
        let allocator: Arc<dyn RemoteAllocator> = device.clone();
        let table = MemoryTable::new(allocator, Collector::deferred());

        let buffer = HostBuffer::zeroed(&buffers_collector, 8);
        table.malloc::<u8>(&buffer, 8).unwrap();
        drop(buffer);

        assert_eq!(table.clean(), 1);
        assert!(table.is_empty());
        assert_eq!(table.stats().cleaned_entries, 1);

        // The late finalizer finds nothing to do.
        buffers_collector.request_collection_pass();
        assert_eq!(table.stats().benign_races, 1);
        assert_eq!(table.nursery().size(), 1);
    }

    #[test]
    fn test_purge_empties_nursery() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = deferred_table(&device);

        for _ in 0..3 {
            let buffer = HostBuffer::zeroed(&collector, 8);
            table.malloc::<u8>(&buffer, 8).unwrap();
            table.free(&buffer);
        }
        assert_eq!(table.nursery().size(), 1);
        assert_eq!(device.allocations(), 1);

        assert_eq!(table.purge(), 1);
        assert!(table.nursery().is_empty());
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn test_reclaim_report() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, collector) = deferred_table(&device);

        let a = HostBuffer::zeroed(&collector, 8);
        let b = HostBuffer::zeroed(&collector, 8);
        table.malloc::<u8>(&a, 8).unwrap();
        table.malloc::<u8>(&b, 300).unwrap();
        drop(a);
        drop(b);

        let report = table.reclaim();
        // The collection pass runs the queued callbacks, so the sweep
        // itself has nothing left to remove.
        assert_eq!(report.cleaned, 0);
        assert_eq!(report.purged, 2);
        assert_eq!(report.purged_bytes, 768);
        assert!(table.is_empty());
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(table.stats().finalizer_frees, 2);
    }

    #[test]
    fn test_clean_on_empty_table() {
        let device = Arc::new(SimulatedDevice::unbounded(256));
        let (table, _collector) = deferred_table(&device);
        assert_eq!(table.clean(), 0);
        assert_eq!(table.purge(), 0);
        assert_eq!(table.stats().cleans, 1);
        assert_eq!(table.stats().purges, 1);
    }
}
