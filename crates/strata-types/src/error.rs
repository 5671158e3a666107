use thiserror::Error;

/// Errors produced when constructing or parsing strata value types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidIdentifier {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    #[error("invalid file extension: {0:?}")]
    InvalidExtension(String),

    #[error("invalid object key {key:?}: {reason}")]
    InvalidObjectKey { key: String, reason: String },

    #[error("invalid source uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid mime type: {0:?}")]
    InvalidMimeType(String),
}
