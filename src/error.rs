//! Error types for mapped-memory.

use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shared-memory and transfer-buffer operations.
///
/// Running out of room in the manager is not an error: `alloc` returns
/// `None` and the caller decides whether to back off.
#[derive(Error, Debug)]
pub enum Error {
    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// The transfer-buffer factory refused a buffer over its budget.
    #[error("transfer buffer of {requested} bytes would exceed the {limit} byte limit")]
    TransferBufferLimit {
        /// Requested buffer size in bytes.
        requested: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
