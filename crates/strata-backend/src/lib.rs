//! Backend drivers for strata.
//!
//! A backend driver stores and retrieves the physical bytes of objects by
//! [`ObjectKey`](strata_types::ObjectKey). It knows nothing about storage
//! paths, copies or reference counts; that bookkeeping lives in the mapping
//! store.
//!
//! # Drivers
//!
//! - [`FilesystemBackend`]: objects under `root/org/mediapackage/version/element.ext`,
//!   optional hard-link copies.
//! - [`RemoteBackend`]: S3-dialect object storage through an
//!   [`ObjectStorageClient`], with bucket versioning, storage classes and
//!   cold-tier restores.
//! - [`InMemoryBackend`]: a `HashMap`, for tests.

pub mod error;
pub mod filesystem;
pub mod memory;
pub mod remote;
pub mod tier;
pub mod traits;

pub use error::{BackendError, BackendResult};
pub use filesystem::{FilesystemBackend, FilesystemConfig};
pub use memory::InMemoryBackend;
pub use remote::{
    BucketMap, Credentials, HttpObjectStorage, HttpStorageConfig, MemoryObjectStorage,
    ObjectStorageClient, RemoteBackend, RemoteConfig,
};
pub use tier::{ClassChange, RestoreStatus, StorageClass};
pub use traits::{BackendDriver, TieredStorage};
