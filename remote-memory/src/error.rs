//! Error Types
//!
//! Exhaustion is not an error here: [`MemoryTable::malloc`] reports it by
//! returning `None`. The variants below are reserved for broken invariants,
//! environment failures and bad configuration.
//!
//! [`MemoryTable::malloc`]: crate::table::MemoryTable::malloc

use std::fmt;

use thiserror::Error;

use crate::liveness::BufferId;

/// Table operation in progress when an error was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `MemoryTable::lookup`.
    Lookup,
    /// `MemoryTable::insert`.
    Insert,
}

impl Operation {
    /// Get the operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Lookup => "lookup",
            Operation::Insert => "insert",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the memory table and its collaborators.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A weak observation was dead where the caller's borrow guarantees the
    /// buffer is alive. Indicates a bug in the table or its caller.
    #[error(
        "internal error during {operation}: weak observation for {id} is dead \
         while the buffer is borrowed"
    )]
    DeadObservation {
        /// Offending buffer.
        id: BufferId,
        /// Operation in progress.
        operation: Operation,
    },

    /// A managed entry was registered with a size of zero.
    #[error("internal error during {operation}: managed entry for {id} has zero size")]
    ZeroSizedEntry {
        /// Offending buffer.
        id: BufferId,
        /// Operation in progress.
        operation: Operation,
    },

    /// The background finalizer thread could not be started.
    #[error("failed to spawn finalizer thread: {0}")]
    FinalizerSpawn(#[from] std::io::Error),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MemoryError {
    /// Whether this error is an internal invariant violation.
    ///
    /// Callers should abort the operation (or the process) on these rather
    /// than retry.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            MemoryError::DeadObservation { .. } | MemoryError::ZeroSizedEntry { .. }
        )
    }

    /// The buffer the error refers to, if any.
    pub fn buffer(&self) -> Option<BufferId> {
        match self {
            MemoryError::DeadObservation { id, .. } | MemoryError::ZeroSizedEntry { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    /// The table operation in progress, for invariant violations.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            MemoryError::DeadObservation { operation, .. }
            | MemoryError::ZeroSizedEntry { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Result type for memory table operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
