//! Backend session
//!
//! A [`Session`] is one backend context: the collector that tracks host
//! buffers, the memory table mirroring them and, when configured, the
//! background finalizer thread.

use std::sync::Arc;

use tracing::info;

use crate::accounting::StatsSnapshot;
use crate::backend::RemoteAllocator;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::liveness::{Collector, FinalizerThread, HostBuffer};
use crate::table::MemoryTable;

/// Collector, memory table and finalizer thread for one backend.
pub struct Session {
    // Dropped first so the thread is joined before the table goes away.
    finalizer: Option<FinalizerThread>,
    table: MemoryTable,
    collector: Collector,
}

impl Session {
    /// Start a session on `allocator`.
    ///
    /// Fails if `config` is invalid or the finalizer thread cannot be
    /// spawned.
    pub fn new(allocator: Arc<dyn RemoteAllocator>, config: &MemoryConfig) -> Result<Self> {
        config.validate()?;

        let collector = Collector::from_config(&config.collector);
        let table = MemoryTable::with_config(allocator, collector.clone(), config);
        let finalizer = match config.collector.finalizer_interval {
            Some(interval) => Some(collector.spawn_finalizer(interval)?),
            None => None,
        };

        info!(
            mode = collector.mode().as_str(),
            nursery = config.nursery.enabled,
            finalizer = finalizer.is_some(),
            chunk_size = table.allocator().chunk_size(),
            "memory session started"
        );

        Ok(Self {
            finalizer,
            table,
            collector,
        })
    }

    /// The memory table.
    pub fn table(&self) -> &MemoryTable {
        &self.table
    }

    /// The collector host buffers must be created with.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Create a host buffer holding `data`.
    pub fn new_buffer(&self, data: impl Into<Box<[u8]>>) -> HostBuffer {
        HostBuffer::new(&self.collector, data)
    }

    /// Create a zero-filled host buffer of `len` bytes.
    pub fn zeroed(&self, len: usize) -> HostBuffer {
        HostBuffer::zeroed(&self.collector, len)
    }

    /// Whether a background finalizer thread is running.
    pub fn has_finalizer_thread(&self) -> bool {
        self.finalizer.as_ref().map_or(false, FinalizerThread::is_running)
    }

    /// End the session.
    ///
    /// Stops the finalizer thread, runs a last collection pass and a full
    /// reclaim, and returns the final counters. Allocations of buffers that
    /// are still alive are released when the last table clone is dropped.
    pub fn shutdown(mut self) -> StatsSnapshot {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.stop();
        }
        self.collector.request_collection_pass();
        let report = self.table.reclaim();
        let stats = self.table.stats();

        info!(
            cleaned = report.cleaned,
            purged = report.purged,
            purged_bytes = report.purged_bytes,
            live = stats.live_managed + stats.live_unmanaged,
            "memory session shut down"
        );
        stats
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("table", &self.table)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}
