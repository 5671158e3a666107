//! Error types for mapping store operations.

use thiserror::Error;

/// Errors raised by the mapping store itself.
///
/// Any of these aborts the calling element-store operation; callers must not
/// assume a partial write happened.
#[derive(Debug, Error)]
pub enum MappingStoreError {
    /// The store cannot serve requests (poisoned lock, closed journal).
    #[error("mapping store unavailable: {0}")]
    Unavailable(String),

    /// Journal I/O failure.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The journal holds a damaged record followed by more data. Only a torn
    /// final record is discarded on open.
    #[error("journal {path} is corrupt at offset {offset}: {reason}")]
    Corrupt {
        path: String,
        offset: u64,
        reason: String,
    },

    /// Rows may only move between versions of one object key.
    #[error("cannot relocate {from} to {to}")]
    Relocation { from: String, to: String },
}

/// Convenience type alias for mapping store operations.
pub type MappingResult<T> = std::result::Result<T, MappingStoreError>;
