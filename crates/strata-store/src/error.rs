use strata_backend::BackendError;
use strata_mapping::MappingStoreError;
use strata_types::{ObjectLocator, StoragePath, TypeError};
use thiserror::Error;

/// Errors from element store operations.
///
/// A path with no mapping is never an error: lookups answer `None` or
/// `false` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Disk or network failure in the backend driver.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// An active mapping points at an object the backend does not have.
    #[error("data integrity violation: {path} maps to missing object {locator}")]
    DataIntegrity {
        path: StoragePath,
        locator: ObjectLocator,
    },

    /// The mapping store itself failed; nothing about the operation can be
    /// assumed applied.
    #[error("mapping store error: {0}")]
    Mapping(#[from] MappingStoreError),

    /// The bytes of a source could not be opened.
    #[error("cannot fetch {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    #[error(transparent)]
    Type(#[from] TypeError),

    /// Every generation key of a path is shared with other paths.
    #[error("no free object key for {path}")]
    KeysExhausted { path: StoragePath },

    #[error("configuration error: {0}")]
    Config(String),

    /// The configured backend does not offer the operation.
    #[error("unsupported by the {backend} backend: {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },
}

/// Result alias for element store operations.
pub type StoreResult<T> = Result<T, StoreError>;
