//! # Weak Liveness Tracking
//!
//! Host buffers, weak observations and the collector that runs their death
//! callbacks.
//!
//! ## Design
//!
//! A [`HostBuffer`] is a reference-counted handle to host memory. The buffer
//! dies when its last handle is dropped. An [`Observation`] is a weak,
//! non-owning view of a buffer: it never extends the buffer's lifetime, and
//! testing it never creates a strong reference.
//!
//! Death callbacks registered through [`Collector::observe`] fire at most
//! once, after the buffer is unreachable:
//!
//! - [`FinalizationMode::Immediate`]: on the thread that dropped the last
//!   handle, before `drop` returns.
//! - [`FinalizationMode::Deferred`]: queued on the collector and run by the
//!   next [`Collector::request_collection_pass`], either from a caller or
//!   from a background [`FinalizerThread`]. Between the drop and the pass
//!   the observation already reports the buffer as dead.
//!
//! Callbacks always run with no collector or buffer lock held.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as cc, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CollectorConfig;
use crate::error::Result;

/// Unique identity of a host buffer.
///
/// Assigned once when the buffer is created and never reused within the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    /// Build an identity from its raw value.
    ///
    /// Useful for diagnostics and for addressing table entries by id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Global buffer ID counter.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Global observer ID counter.
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> BufferId {
    BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Callback run when an observed buffer dies.
pub type DeathCallback = Box<dyn FnOnce(BufferId) + Send + 'static>;

/// When death callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizationMode {
    /// Run callbacks on the thread that drops the last buffer handle.
    #[default]
    Immediate,
    /// Queue callbacks until the next collection pass.
    Deferred,
}

impl FinalizationMode {
    /// Parse a finalization mode from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "immediate" | "eager" => Some(FinalizationMode::Immediate),
            "deferred" | "lazy" => Some(FinalizationMode::Deferred),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationMode::Immediate => "immediate",
            FinalizationMode::Deferred => "deferred",
        }
    }
}

// ============================================================================
// Host Buffers
// ============================================================================

struct BufferInner {
    id: BufferId,
    data: Box<[u8]>,
    observers: Mutex<Vec<(u64, DeathCallback)>>,
    collector: Weak<CollectorInner>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let callbacks: Vec<DeathCallback> = self
            .observers
            .get_mut()
            .drain(..)
            .map(|(_, callback)| callback)
            .collect();
        if callbacks.is_empty() {
            return;
        }

        match self.collector.upgrade() {
            Some(collector) => collector.finalize(self.id, callbacks),
            // Collector gone: nobody will ever run a pass, so run now.
            None => run_callbacks(self.id, callbacks),
        }
    }
}

/// Reference-counted handle to a host-resident buffer.
///
/// Cloning is cheap and shares the buffer. The buffer belongs to the
/// collector it was created with, which decides when its death callbacks
/// run.
#[derive(Clone)]
pub struct HostBuffer {
    inner: Arc<BufferInner>,
}

impl HostBuffer {
    /// Create a buffer holding `data`.
    pub fn new(collector: &Collector, data: impl Into<Box<[u8]>>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: next_buffer_id(),
                data: data.into(),
                observers: Mutex::new(Vec::new()),
                collector: Arc::downgrade(&collector.inner),
            }),
        }
    }

    /// Create a zero-filled buffer of `len` bytes.
    pub fn zeroed(collector: &Collector, len: usize) -> Self {
        Self::new(collector, vec![0u8; len])
    }

    /// The buffer's identity.
    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// The buffer contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner.data
    }

    /// Number of live handles to this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Number of death callbacks currently attached.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.data.len())
            .field("handles", &self.handle_count())
            .finish()
    }
}

// ============================================================================
// Observations
// ============================================================================

/// Weak observation of a host buffer.
pub struct Observation {
    id: BufferId,
    buffer: Weak<BufferInner>,
    observer: Option<u64>,
}

impl Observation {
    /// Identity of the observed buffer.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Whether the buffer is still reachable.
    ///
    /// Reads the strong count only; never creates a strong reference.
    pub fn is_alive(&self) -> bool {
        self.buffer.strong_count() > 0
    }

    /// Get a strong handle to the buffer if it is still alive.
    pub fn upgrade(&self) -> Option<HostBuffer> {
        self.buffer.upgrade().map(|inner| HostBuffer { inner })
    }

    /// Whether this observation carries a death callback.
    pub fn has_callback(&self) -> bool {
        self.observer.is_some()
    }

    /// Detach this observation's death callback from a still-live buffer.
    ///
    /// Returns `true` if a callback was removed. After a successful cancel
    /// the callback never runs. Must not be called while holding a lock
    /// that a death callback could take: the temporary strong reference
    /// taken here may turn out to be the buffer's last one.
    pub fn cancel(&self) -> bool {
        let Some(observer) = self.observer else {
            return false;
        };
        let Some(inner) = self.buffer.upgrade() else {
            return false;
        };

        let removed = {
            let mut observers = inner.observers.lock();
            observers
                .iter()
                .position(|(id, _)| *id == observer)
                .map(|index| observers.swap_remove(index).1)
        };
        let cancelled = removed.is_some();
        drop(removed);
        drop(inner);
        cancelled
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("has_callback", &self.observer.is_some())
            .finish()
    }
}

// ============================================================================
// Collector
// ============================================================================

struct PendingFinalization {
    id: BufferId,
    callbacks: Vec<DeathCallback>,
}

struct CollectorInner {
    mode: FinalizationMode,
    sender: Sender<PendingFinalization>,
    receiver: Receiver<PendingFinalization>,
    passes: AtomicU64,
    finalized: AtomicU64,
}

impl CollectorInner {
    fn finalize(&self, id: BufferId, callbacks: Vec<DeathCallback>) {
        match self.mode {
            FinalizationMode::Immediate => {
                self.finalized.fetch_add(1, Ordering::Relaxed);
                run_callbacks(id, callbacks);
            }
            FinalizationMode::Deferred => {
                trace!(buffer = %id, "queued finalization");
                // The receiver lives in `self`, so the channel cannot be
                // disconnected here; fall back to running inline anyway.
                let pending = PendingFinalization { id, callbacks };
                if let Err(cc::SendError(pending)) = self.sender.send(pending) {
                    run_callbacks(pending.id, pending.callbacks);
                }
            }
        }
    }

    fn drain(&self) -> usize {
        let mut count = 0;
        for pending in self.receiver.try_iter() {
            run_callbacks(pending.id, pending.callbacks);
            count += 1;
        }
        self.finalized.fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}

impl Drop for CollectorInner {
    fn drop(&mut self) {
        let leftover = self.drain();
        if leftover > 0 {
            debug!(finalized = leftover, "collector dropped with pending finalizations");
        }
    }
}

fn run_callbacks(id: BufferId, callbacks: Vec<DeathCallback>) {
    trace!(buffer = %id, callbacks = callbacks.len(), "running death callbacks");
    for callback in callbacks {
        callback(id);
    }
}

/// Host environment for weak observation.
///
/// Cheap to clone; clones share the same pending-finalization queue.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl Collector {
    /// Create a collector with the given finalization mode.
    pub fn new(mode: FinalizationMode) -> Self {
        let (sender, receiver) = cc::unbounded();
        Self {
            inner: Arc::new(CollectorInner {
                mode,
                sender,
                receiver,
                passes: AtomicU64::new(0),
                finalized: AtomicU64::new(0),
            }),
        }
    }

    /// Collector that finalizes on drop.
    pub fn immediate() -> Self {
        Self::new(FinalizationMode::Immediate)
    }

    /// Collector that queues finalizations until a collection pass.
    pub fn deferred() -> Self {
        Self::new(FinalizationMode::Deferred)
    }

    /// Create a collector from configuration.
    ///
    /// Does not start a finalizer thread; see [`Collector::spawn_finalizer`].
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(config.mode)
    }

    /// The finalization mode.
    pub fn mode(&self) -> FinalizationMode {
        self.inner.mode
    }

    /// Attach a weak observation to `buffer`.
    ///
    /// `on_death`, if given, runs at most once after the buffer becomes
    /// unreachable. Observing never extends the buffer's lifetime.
    pub fn observe(&self, buffer: &HostBuffer, on_death: Option<DeathCallback>) -> Observation {
        let observer = on_death.map(|callback| {
            let observer = NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed);
            buffer.inner.observers.lock().push((observer, callback));
            observer
        });

        Observation {
            id: buffer.inner.id,
            buffer: Arc::downgrade(&buffer.inner),
            observer,
        }
    }

    /// Get the observed buffer if it is still alive.
    pub fn deref(&self, observation: &Observation) -> Option<HostBuffer> {
        observation.upgrade()
    }

    /// Identity of `buffer`.
    pub fn identity_of(&self, buffer: &HostBuffer) -> BufferId {
        buffer.id()
    }

    /// Run every queued finalization.
    ///
    /// Returns the number of buffers finalized by this call. Finalizations
    /// being run concurrently by another pass are not waited for.
    pub fn request_collection_pass(&self) -> usize {
        self.inner.passes.fetch_add(1, Ordering::Relaxed);
        let count = self.inner.drain();
        if count > 0 {
            debug!(finalized = count, "collection pass");
        }
        count
    }

    /// Number of dead buffers whose callbacks are still queued.
    pub fn pending(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Number of collection passes requested so far.
    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::Relaxed)
    }

    /// Number of buffers finalized so far.
    pub fn finalized(&self) -> u64 {
        self.inner.finalized.load(Ordering::Relaxed)
    }

    /// Start a background thread running a collection pass every `interval`.
    pub fn spawn_finalizer(&self, interval: Duration) -> Result<FinalizerThread> {
        let (shutdown, stop) = cc::bounded::<()>(0);
        let collector = self.clone();

        let handle = thread::Builder::new()
            .name("remote-memory-finalizer".into())
            .spawn(move || {
                let ticker = cc::tick(interval);
                loop {
                    cc::select! {
                        recv(ticker) -> _ => {
                            collector.request_collection_pass();
                        }
                        recv(stop) -> _ => break,
                    }
                }
                collector.request_collection_pass();
            })?;

        debug!(?interval, "finalizer thread started");
        Ok(FinalizerThread {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::immediate()
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("mode", &self.inner.mode)
            .field("pending", &self.pending())
            .field("passes", &self.passes())
            .field("finalized", &self.finalized())
            .finish()
    }
}

/// Background thread running periodic collection passes.
///
/// Stops (after one last pass) when [`FinalizerThread::stop`] is called or
/// the handle is dropped.
pub struct FinalizerThread {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FinalizerThread {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn shutdown_and_join(&mut self) {
        // Disconnecting the channel wakes the thread's select.
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("finalizer thread panicked");
            }
        }
    }
}

impl Drop for FinalizerThread {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl fmt::Debug for FinalizerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerThread")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> DeathCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_buffer_ids_are_unique() {
        let collector = Collector::immediate();
        let a = HostBuffer::zeroed(&collector, 8);
        let b = HostBuffer::zeroed(&collector, 8);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(collector.identity_of(&a), a.id());
    }

    #[test]
    fn test_observation_does_not_keep_alive() {
        let collector = Collector::immediate();
        let buffer = HostBuffer::new(&collector, vec![1u8, 2, 3]);
        let observation = collector.observe(&buffer, None);

        assert!(observation.is_alive());
        assert_eq!(buffer.handle_count(), 1);
        assert_eq!(collector.deref(&observation).map(|b| b.len()), Some(3));

        drop(buffer);
        assert!(!observation.is_alive());
        assert!(observation.upgrade().is_none());
    }

    #[test]
    fn test_immediate_callback_fires_once_on_last_drop() {
        let collector = Collector::immediate();
        let fired = Arc::new(AtomicUsize::new(0));
        let buffer = HostBuffer::zeroed(&collector, 16);
        let _observation = collector.observe(&buffer, Some(counting_callback(&fired)));

        let clone = buffer.clone();
        drop(buffer);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(clone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(collector.finalized(), 1);
    }

    #[test]
    fn test_deferred_callback_waits_for_pass() {
        let collector = Collector::deferred();
        let fired = Arc::new(AtomicUsize::new(0));
        let buffer = HostBuffer::zeroed(&collector, 16);
        let observation = collector.observe(&buffer, Some(counting_callback(&fired)));

        drop(buffer);
        assert!(!observation.is_alive());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(collector.pending(), 1);

        assert_eq!(collector.request_collection_pass(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(collector.pending(), 0);

        // Nothing left to run.
        assert_eq!(collector.request_collection_pass(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(collector.passes(), 2);
    }

    #[test]
    fn test_callback_receives_identity() {
        let collector = Collector::immediate();
        let seen = Arc::new(Mutex::new(None));
        let buffer = HostBuffer::zeroed(&collector, 4);
        let id = buffer.id();
        let sink = Arc::clone(&seen);
        let _obs = collector.observe(
            &buffer,
            Some(Box::new(move |dead| *sink.lock() = Some(dead))),
        );

        drop(buffer);
        assert_eq!(*seen.lock(), Some(id));
    }

    #[test]
    fn test_cancel_detaches_callback() {
        let collector = Collector::immediate();
        let fired = Arc::new(AtomicUsize::new(0));
        let buffer = HostBuffer::zeroed(&collector, 16);
        let observation = collector.observe(&buffer, Some(counting_callback(&fired)));
        assert_eq!(buffer.observer_count(), 1);

        assert!(observation.cancel());
        assert!(!observation.cancel());
        assert_eq!(buffer.observer_count(), 0);

        drop(buffer);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_death_is_noop() {
        let collector = Collector::immediate();
        let buffer = HostBuffer::zeroed(&collector, 16);
        let observation = collector.observe(&buffer, Some(Box::new(|_| {})));
        drop(buffer);
        assert!(!observation.cancel());
    }

    #[test]
    fn test_buffer_outliving_collector_finalizes_inline() {
        let collector = Collector::deferred();
        let fired = Arc::new(AtomicUsize::new(0));
        let buffer = HostBuffer::zeroed(&collector, 16);
        let _obs = collector.observe(&buffer, Some(counting_callback(&fired)));

        drop(collector);
        drop(buffer);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_collector_runs_pending() {
        let collector = Collector::deferred();
        let fired = Arc::new(AtomicUsize::new(0));
        let buffer = HostBuffer::zeroed(&collector, 16);
        let _obs = collector.observe(&buffer, Some(counting_callback(&fired)));

        drop(buffer);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(collector);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_thread_runs_passes() {
        let collector = Collector::deferred();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalizer = collector.spawn_finalizer(Duration::from_millis(5)).unwrap();
        assert!(finalizer.is_running());

        for _ in 0..4 {
            let buffer = HostBuffer::zeroed(&collector, 16);
            let _obs = collector.observe(&buffer, Some(counting_callback(&fired)));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 4);

        finalizer.stop();
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_finalizer_thread_final_pass_on_stop() {
        let collector = Collector::deferred();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalizer = collector.spawn_finalizer(Duration::from_secs(3600)).unwrap();

        let buffer = HostBuffer::zeroed(&collector, 16);
        let _obs = collector.observe(&buffer, Some(counting_callback(&fired)));
        drop(buffer);

        drop(finalizer);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalization_mode_from_str() {
        assert_eq!(FinalizationMode::from_str("Deferred"), Some(FinalizationMode::Deferred));
        assert_eq!(FinalizationMode::from_str("immediate"), Some(FinalizationMode::Immediate));
        assert_eq!(FinalizationMode::from_str("sometimes"), None);
        assert_eq!(FinalizationMode::Deferred.as_str(), "deferred");
    }
}
