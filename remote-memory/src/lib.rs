//! # Remote Memory Table
//!
//! Host-side bookkeeping for memory that lives in a separate address space
//! (an accelerator device, typically) and mirrors host buffers:
//!
//! - **Memory Table**: maps each host buffer to its remote allocation
//! - **Weak Liveness**: death callbacks that never keep a buffer alive
//! - **Nursery**: size-bucketed free list of reusable remote allocations
//! - **Reclamation**: `clean` (sweep dead buffers) and `purge` (flush the
//!   nursery), used automatically under allocation pressure
//! - **Accounting**: chunk-size rounding and allocation counters
//!
//! The remote address space itself is behind the [`RemoteAllocator`]
//! trait; [`sim::SimulatedDevice`] is an in-process implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SESSION                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  observe   ┌──────────────┐                    │
//! │  │  Collector   │◄───────────│ Memory Table │                    │
//! │  │(liveness.rs) │───────────►│  (table.rs)  │                    │
//! │  └──────────────┘  on death  └──────────────┘                    │
//! │                                 │        │                       │
//! │                  free / reuse   │        │ allocate / release    │
//! │                                 ▼        ▼                       │
//! │                       ┌──────────────┐  ┌──────────────┐         │
//! │                       │   Nursery    │  │  Allocator   │         │
//! │                       │ (nursery.rs) │  │ (backend.rs) │         │
//! │                       └──────────────┘  └──────────────┘         │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use remote_memory::{MemoryConfig, Session, sim::SimulatedDevice};
//!
//! let device = Arc::new(SimulatedDevice::unbounded(256));
//! let session = Session::new(device, &MemoryConfig::default())?;
//!
//! let buffer = session.zeroed(40);
//! let ptr = session.table().malloc::<u32>(&buffer, 10).expect("device full");
//! assert_eq!(session.table().lookup::<u32>(&buffer)?, Some(ptr));
//!
//! drop(buffer); // the allocation moves to the nursery
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod accounting;
pub mod backend;
pub mod config;
pub mod error;
pub mod handle;
pub mod liveness;
pub mod log;
pub mod nursery;
pub mod reclaim;
pub mod session;
pub mod sim;
pub mod table;

// Re-exports
pub use accounting::{round_to_chunk, AllocationStats, StatsSnapshot};
pub use backend::RemoteAllocator;
pub use config::{LogLevel, MemoryConfig, MemoryConfigBuilder};
pub use error::{ConfigError, MemoryError, Operation, Result};
pub use handle::{DevicePtr, RemoteHandle};
pub use liveness::{
    BufferId, Collector, DeathCallback, FinalizationMode, FinalizerThread, HostBuffer, Observation,
};
pub use nursery::Nursery;
pub use reclaim::ReclaimReport;
pub use session::Session;
pub use table::{EntryInfo, MemoryTable};

use std::sync::Arc;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a session configured from environment variables.
///
/// Reads `REMOTE_MEMORY_*` variables (see [`MemoryConfig::try_from_env`])
/// and installs the log subscriber unless one is already set. A variable
/// that is set but malformed is an error.
pub fn init_from_env(allocator: Arc<dyn RemoteAllocator>) -> Result<Session> {
    let config = MemoryConfig::try_from_env()?;
    log::init(&config.log);
    Session::new(allocator, &config)
}
