//! Allocation Accounting
//!
//! Size rounding policy and usage counters for the memory table.
//!
//! ## Rounding
//!
//! The table never allocates exactly the requested number of bytes. Every
//! request is rounded up to a multiple of the backend's current chunk size,
//! so that freed allocations cluster into a few nursery buckets and exact
//! size lookups hit more often.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Round `bytes` up to the next multiple of `chunk_size`.
///
/// A zero-byte request rounds to one chunk so managed sizes stay positive,
/// and a zero chunk size is treated as one byte. Returns `None` if the
/// rounded size does not fit in `usize`.
pub fn round_to_chunk(bytes: usize, chunk_size: usize) -> Option<usize> {
    let chunk = chunk_size.max(1);
    let bytes = bytes.max(1);
    let chunks = bytes / chunk + usize::from(bytes % chunk != 0);
    chunks.checked_mul(chunk)
}

/// Counters for the memory table.
///
/// All counters are monotonic except the `live_*`/`managed_bytes` gauges.
#[derive(Debug, Default)]
pub struct AllocationStats {
    /// Allocations served from the nursery.
    pub nursery_hits: AtomicU64,
    /// Nursery lookups that found no handle of the requested size.
    pub nursery_misses: AtomicU64,
    /// Allocations served by the backend.
    pub fresh_allocations: AtomicU64,
    /// `malloc` calls that failed after the full recovery ladder.
    pub allocation_failures: AtomicU64,
    /// Entries removed by an explicit `free`.
    pub explicit_frees: AtomicU64,
    /// Entries removed by a death callback.
    pub finalizer_frees: AtomicU64,
    /// Entries removed by a `clean` sweep.
    pub cleaned_entries: AtomicU64,
    /// Removals that found the entry already gone.
    pub benign_races: AtomicU64,
    /// `clean` passes run.
    pub cleans: AtomicU64,
    /// `purge` passes run.
    pub purges: AtomicU64,
    /// Handles released to the backend by purges, teardown or the nursery bound.
    pub released_handles: AtomicU64,
    /// Current managed entries.
    pub live_managed: AtomicU64,
    /// Current unmanaged entries.
    pub live_unmanaged: AtomicU64,
    /// Bytes held by current managed entries.
    pub managed_bytes: AtomicU64,
    /// Highest value `managed_bytes` has reached.
    pub peak_managed_bytes: AtomicU64,
}

impl AllocationStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entry_added(&self, bytes: usize) {
        if bytes == 0 {
            self.live_unmanaged.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.live_managed.fetch_add(1, Ordering::Relaxed);
        let now = self.managed_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.peak_managed_bytes.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn entry_removed(&self, bytes: usize) {
        if bytes == 0 {
            self.live_unmanaged.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        self.live_managed.fetch_sub(1, Ordering::Relaxed);
        self.managed_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            nursery_hits: load(&self.nursery_hits),
            nursery_misses: load(&self.nursery_misses),
            fresh_allocations: load(&self.fresh_allocations),
            allocation_failures: load(&self.allocation_failures),
            explicit_frees: load(&self.explicit_frees),
            finalizer_frees: load(&self.finalizer_frees),
            cleaned_entries: load(&self.cleaned_entries),
            benign_races: load(&self.benign_races),
            cleans: load(&self.cleans),
            purges: load(&self.purges),
            released_handles: load(&self.released_handles),
            live_managed: load(&self.live_managed),
            live_unmanaged: load(&self.live_unmanaged),
            managed_bytes: load(&self.managed_bytes),
            peak_managed_bytes: load(&self.peak_managed_bytes),
        }
    }
}

/// Plain copy of [`AllocationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Allocations served from the nursery.
    pub nursery_hits: u64,
    /// Nursery lookups that missed.
    pub nursery_misses: u64,
    /// Allocations served by the backend.
    pub fresh_allocations: u64,
    /// Failed `malloc` calls.
    pub allocation_failures: u64,
    /// Explicit frees.
    pub explicit_frees: u64,
    /// Frees run by death callbacks.
    pub finalizer_frees: u64,
    /// Entries removed by `clean`.
    pub cleaned_entries: u64,
    /// Removals of already-removed entries.
    pub benign_races: u64,
    /// `clean` passes.
    pub cleans: u64,
    /// `purge` passes.
    pub purges: u64,
    /// Handles released to the backend.
    pub released_handles: u64,
    /// Current managed entries.
    pub live_managed: u64,
    /// Current unmanaged entries.
    pub live_unmanaged: u64,
    /// Bytes held by managed entries.
    pub managed_bytes: u64,
    /// Peak of `managed_bytes`.
    pub peak_managed_bytes: u64,
}

impl StatsSnapshot {
    /// Fraction of nursery lookups that were hits, in `[0, 1]`.
    pub fn nursery_hit_rate(&self) -> f64 {
        let total = self.nursery_hits + self.nursery_misses;
        if total == 0 {
            0.0
        } else {
            self.nursery_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "entries: {} managed ({}), {} unmanaged; peak {}",
            self.live_managed,
            format_bytes(self.managed_bytes),
            self.live_unmanaged,
            format_bytes(self.peak_managed_bytes),
        )?;
        writeln!(
            f,
            "allocations: {} fresh, {} reused ({:.1}% nursery hit rate), {} failed",
            self.fresh_allocations,
            self.nursery_hits,
            self.nursery_hit_rate() * 100.0,
            self.allocation_failures,
        )?;
        write!(
            f,
            "frees: {} explicit, {} finalized, {} cleaned, {} raced; {} cleans, {} purges, {} released",
            self.explicit_frees,
            self.finalizer_frees,
            self.cleaned_entries,
            self.benign_races,
            self.cleans,
            self.purges,
            self.released_handles,
        )
    }
}

/// Format a byte count with a binary unit suffix.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
