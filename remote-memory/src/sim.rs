//! Simulated Device
//!
//! An in-process [`RemoteAllocator`] standing in for real device memory.
//! It hands out opaque addresses from a private range, enforces a byte
//! capacity, and keeps enough bookkeeping to catch double or unknown
//! releases. Useful for tests, benchmarks and for running the table
//! without an accelerator.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::backend::RemoteAllocator;
use crate::handle::RemoteHandle;

#[derive(Default)]
struct DeviceState {
    live: HashMap<RemoteHandle, usize>,
    used: usize,
    peak: usize,
    allocations: u64,
    releases: u64,
    invalid_releases: u64,
    failed_allocations: u64,
}

/// Simulated remote memory space.
pub struct SimulatedDevice {
    capacity: usize,
    chunk_size: AtomicUsize,
    next_address: AtomicU64,
    /// Allocations to fail regardless of capacity.
    fail_next: AtomicUsize,
    state: Mutex<DeviceState>,
}

impl SimulatedDevice {
    /// First address handed out.
    pub const BASE_ADDRESS: u64 = 0x7f00_0000_0000;

    /// Create a device with `capacity` bytes and the given chunk size.
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        Self {
            capacity,
            chunk_size: AtomicUsize::new(chunk_size),
            next_address: AtomicU64::new(Self::BASE_ADDRESS),
            fail_next: AtomicUsize::new(0),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Create a device that never runs out of memory.
    pub fn unbounded(chunk_size: usize) -> Self {
        Self::new(usize::MAX, chunk_size)
    }

    /// Change the chunk size reported to the table.
    pub fn set_chunk_size(&self, bytes: usize) {
        self.chunk_size.store(bytes, Ordering::Release);
    }

    /// Make the next `count` allocations fail.
    pub fn fail_next_allocations(&self, count: usize) {
        self.fail_next.store(count, Ordering::Release);
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Bytes still available.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Highest number of bytes allocated at once.
    pub fn peak(&self) -> usize {
        self.state.lock().peak
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether `handle` is currently allocated.
    pub fn is_live(&self, handle: RemoteHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Successful allocations so far.
    pub fn allocations(&self) -> u64 {
        self.state.lock().allocations
    }

    /// Successful releases so far.
    pub fn releases(&self) -> u64 {
        self.state.lock().releases
    }

    /// Releases of handles that were not allocated.
    pub fn invalid_releases(&self) -> u64 {
        self.state.lock().invalid_releases
    }

    /// Allocations refused so far.
    pub fn failed_allocations(&self) -> u64 {
        self.state.lock().failed_allocations
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RemoteAllocator for SimulatedDevice {
    fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Acquire)
    }

    fn allocate(&self, bytes: usize) -> Option<RemoteHandle> {
        let mut state = self.state.lock();
        let fits = state
            .used
            .checked_add(bytes)
            .map_or(false, |total| total <= self.capacity);
        if !fits || self.take_injected_failure() {
            state.failed_allocations += 1;
            return None;
        }

        let address = self.next_address.fetch_add(bytes.max(1) as u64, Ordering::Relaxed);
        let handle = RemoteHandle::new(address);
        state.live.insert(handle, bytes);
        state.used += bytes;
        state.peak = state.peak.max(state.used);
        state.allocations += 1;
        Some(handle)
    }

    fn release(&self, handle: RemoteHandle) {
        let mut state = self.state.lock();
        match state.live.remove(&handle) {
            Some(bytes) => {
                state.used -= bytes;
                state.releases += 1;
            }
            None => {
                state.invalid_releases += 1;
                drop(state);
                error!(%handle, "release of a handle that is not allocated");
            }
        }
    }
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedDevice")
            .field("capacity", &self.capacity)
            .field("chunk_size", &self.chunk_size.load(Ordering::Relaxed))
            .field("used", &state.used)
            .field("live", &state.live.len())
            .finish()
    }
}
