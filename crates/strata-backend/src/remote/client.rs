//! The object-storage service seen by [`RemoteBackend`](super::RemoteBackend).

use std::fmt;
use std::io::Read;

use crate::error::BackendResult;
use crate::tier::{RestoreStatus, StorageClass};

/// A request body of known length.
pub struct ObjectBody {
    pub reader: Box<dyn Read + Send>,
    pub len: u64,
}

impl ObjectBody {
    pub fn new(reader: Box<dyn Read + Send>, len: u64) -> Self {
        Self { reader, len }
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody").field("len", &self.len).finish()
    }
}

/// Metadata of a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    /// Raw version id as the service reports it (`"null"` in unversioned
    /// buckets, or absent).
    pub version_id: Option<String>,
    pub size: u64,
    pub storage_class: StorageClass,
    pub restore: RestoreStatus,
}

/// Tag set of an object.
pub type Tags = Vec<(String, String)>;

/// The subset of an S3-dialect object-storage API the remote backend needs.
///
/// `version_id` arguments select a specific object version; `None` addresses
/// the current one. Missing objects are reported as `None`/`false`, never as
/// errors.
pub trait ObjectStorageClient: Send + Sync {
    /// `false` if the bucket does not exist. Any other failure is an error.
    fn bucket_exists(&self, bucket: &str) -> BackendResult<bool>;

    fn create_bucket(&self, bucket: &str) -> BackendResult<()>;

    fn enable_versioning(&self, bucket: &str) -> BackendResult<()>;

    /// `true` only while versioning is enabled on the bucket; never-versioned
    /// and suspended buckets answer `false`.
    fn bucket_versioning(&self, bucket: &str) -> BackendResult<bool>;

    /// Upload an object. Returns the raw version id, if any.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        content_type: Option<&str>,
    ) -> BackendResult<Option<String>>;

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>>;

    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<ObjectHead>>;

    fn delete_object(&self, bucket: &str, key: &str, version_id: Option<&str>)
        -> BackendResult<()>;

    fn get_object_tags(&self, bucket: &str, key: &str, version_id: Option<&str>)
        -> BackendResult<Tags>;

    fn put_object_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        tags: &[(String, String)],
    ) -> BackendResult<()>;

    /// Copy an object version onto its own key with a new storage class.
    /// Returns the raw version id of the copy, which in versioned buckets is
    /// a new version next to the source.
    fn change_storage_class(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        class: &StorageClass,
    ) -> BackendResult<Option<String>>;

    /// Request a temporary readable copy of a frozen object.
    fn restore_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        days: u32,
    ) -> BackendResult<()>;
}
