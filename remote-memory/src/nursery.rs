//! # Nursery
//!
//! Size-bucketed free list of remote allocations that are no longer in use
//! but have not been returned to the backend.
//!
//! Lookups are exact-size only, with no best-fit. The table rounds every
//! request to the backend's chunk size, so sizes cluster into few buckets.
//!
//! A handle is never in the nursery and the memory table at the same time:
//! it enters on `free` after the table entry is gone, and leaves on reuse
//! before the new table entry is created.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::NurseryConfig;
use crate::handle::RemoteHandle;

#[derive(Default)]
struct Buckets {
    /// Free handles by exact byte size.
    by_size: HashMap<usize, Vec<RemoteHandle>>,
    /// Number of cached handles.
    count: usize,
    /// Sum of cached sizes in bytes.
    bytes: usize,
}

/// Free list of reusable remote allocations.
pub struct Nursery {
    buckets: Mutex<Buckets>,
    /// Maximum cached bytes (0 = unlimited).
    max_bytes: usize,
    /// Whether caching is enabled at all.
    enabled: bool,
    /// Insertions refused because of the byte bound.
    rejected: AtomicU64,
}

impl Nursery {
    /// Create an unbounded nursery.
    pub fn new() -> Self {
        Self::with_config(&NurseryConfig::default())
    }

    /// Create a nursery from configuration.
    pub fn with_config(config: &NurseryConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            max_bytes: config.max_cached_bytes,
            enabled: config.enabled,
            rejected: AtomicU64::new(0),
        }
    }

    /// Whether the nursery caches anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remove and return a cached handle of exactly `size` bytes.
    pub fn lookup(&self, size: usize) -> Option<RemoteHandle> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.by_size.get_mut(&size)?;
        let handle = bucket.pop()?;
        if bucket.is_empty() {
            buckets.by_size.remove(&size);
        }
        buckets.count -= 1;
        buckets.bytes -= size;
        trace!(%handle, size, "nursery reuse");
        Some(handle)
    }

    /// Cache `handle` as a free allocation of `size` bytes.
    ///
    /// Returns the handle back if the nursery is disabled or caching it
    /// would exceed the byte bound; the caller must release it.
    pub fn insert(&self, size: usize, handle: RemoteHandle) -> Option<RemoteHandle> {
        if !self.enabled {
            return Some(handle);
        }

        let mut buckets = self.buckets.lock();
        if self.max_bytes != 0 && buckets.bytes.saturating_add(size) > self.max_bytes {
            drop(buckets);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(%handle, size, "nursery full");
            return Some(handle);
        }

        let bucket = buckets.by_size.entry(size).or_default();
        debug_assert!(!bucket.contains(&handle), "handle {} cached twice", handle);
        bucket.push(handle);
        buckets.count += 1;
        buckets.bytes += size;
        None
    }

    /// Number of cached handles.
    pub fn size(&self) -> usize {
        self.buckets.lock().count
    }

    /// Whether the nursery is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total bytes of cached handles.
    pub fn bytes(&self) -> usize {
        self.buckets.lock().bytes
    }

    /// Number of cached handles of exactly `size` bytes.
    pub fn count_of(&self, size: usize) -> usize {
        self.buckets.lock().by_size.get(&size).map_or(0, Vec::len)
    }

    /// Whether `handle` is currently cached.
    pub fn contains(&self, handle: RemoteHandle) -> bool {
        self.buckets
            .lock()
            .by_size
            .values()
            .any(|bucket| bucket.contains(&handle))
    }

    /// Insertions refused because of the byte bound.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Drain every cached handle, calling `release` on each.
    ///
    /// `release` runs after the nursery lock is dropped. Returns the number
    /// of handles and bytes drained.
    pub fn cleanup(&self, mut release: impl FnMut(RemoteHandle)) -> (usize, usize) {
        let drained = std::mem::take(&mut *self.buckets.lock());
        for handle in drained.by_size.into_values().flatten() {
            release(handle);
        }
        (drained.count, drained.bytes)
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Nursery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.buckets.lock();
        f.debug_struct("Nursery")
            .field("handles", &buckets.count)
            .field("bytes", &buckets.bytes)
            .field("buckets", &buckets.by_size.len())
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}
