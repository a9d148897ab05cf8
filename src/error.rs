//! Error types for Rememory

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for Rememory operations
pub type Result<T> = std::result::Result<T, RememoryError>;

/// Errors that can occur in Rememory operations
#[derive(Debug, Error)]
pub enum RememoryError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to unlink a shared memory object
    #[error("Failed to unlink shared memory '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The OS rejected a lock or unlock request
    #[error("Lock operation on '{name}' failed: {source}")]
    Lock {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Container name is empty, too long or contains reserved characters
    #[error("Invalid container name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The named lock could not be acquired in time
    #[error("Timed out after {timeout:?} waiting for lock '{name}'")]
    LockTimeout { name: String, timeout: Duration },

    /// The handle already holds its lock
    #[error("Lock '{0}' is already held by this handle")]
    LockAlreadyHeld(String),

    /// Release was called without a matching acquire
    #[error("Lock '{0}' is not held by this handle")]
    LockNotHeld(String),

    /// No segment exists under the requested name
    #[error("Shared segment '{0}' does not exist")]
    SegmentNotFound(String),

    /// Header magic, version or length is not what a writer would produce
    #[error("Corrupted envelope: {reason}")]
    CorruptedEnvelope { reason: String },

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Map lookup of an absent key
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Removal or lookup of an absent set or sequence element
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Sequence index past the end
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Fixed-capacity text or blob cell cannot hold the value
    #[error("Capacity exceeded: max {max} bytes, got {got} bytes")]
    CapacityExceeded { max: usize, got: usize },

    /// Raw write larger than the mapped segment
    #[error("Buffer overflow: max {max} bytes, got {got} bytes")]
    BufferOverflow { max: usize, got: usize },

    /// The stored container is of a different kind than requested
    #[error("Container '{name}' holds a {found}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// A value did not have the shape the caller asked for
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// The operation is not defined for this container kind
    #[error("Operation '{op}' is not supported on a {kind}")]
    UnsupportedOperation { op: &'static str, kind: String },

    /// The segment kept changing generation underneath the reader
    #[error("Container '{name}' still stale after {attempts} attempts")]
    Contention { name: String, attempts: u32 },
}

impl RememoryError {
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Self::CorruptedEnvelope {
            reason: reason.into(),
        }
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Whether the caller can reasonably retry or fall back.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::SegmentNotFound(_)
                | Self::KeyNotFound(_)
                | Self::ElementNotFound(_)
                | Self::IndexOutOfRange { .. }
                | Self::Contention { .. }
        )
    }
}
