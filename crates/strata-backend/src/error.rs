//! Error types for backend drivers.

use thiserror::Error;

/// Errors raised by a [`BackendDriver`](crate::BackendDriver).
///
/// A missing object is not an error on `read`/`exists`/`delete`; drivers
/// report it through `Option`/`bool` and leave the interpretation to the
/// caller.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Local disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote service answered with an error status.
    #[error("remote storage returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// The remote service could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The object is in a cold tier and has not been restored.
    #[error("object {key} is frozen; a restore has been requested")]
    Frozen { key: String },

    /// Driver misconfiguration (no bucket for an organization, bad root).
    #[error("backend configuration error: {0}")]
    Config(String),

    /// The driver cannot serve requests.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Convenience type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
