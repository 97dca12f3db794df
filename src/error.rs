//! Error types for DataBuffer
//!
//! Provides a unified error type for all buffer operations.

use std::io;

use thiserror::Error;

/// Result type alias using BufferError
pub type Result<T> = std::result::Result<T, BufferError>;

/// Unified error type for DataBuffer operations
#[derive(Debug, Error)]
pub enum BufferError {
    // -------------------------------------------------------------------------
    // Validation Errors (recoverable, no state change)
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Uninitialised: {0}")]
    Uninitialised(String),

    // -------------------------------------------------------------------------
    // Fatal Errors (the buffer stops)
    // -------------------------------------------------------------------------
    #[error("Value of {size} bytes cannot exceed the disk limit of {limit} bytes")]
    CannotExceedLimit { size: u64, limit: u64 },

    #[error("Filesystem I/O error: {0}")]
    FilesystemIo(#[from] io::Error),

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("No such element")]
    NoSuchElement,
}

impl BufferError {
    /// Error returned once the buffer has stopped (shutdown or fatal failure)
    pub(crate) fn stopped() -> Self {
        BufferError::FilesystemIo(io::Error::new(
            io::ErrorKind::Other,
            "data buffer is no longer running",
        ))
    }
}
