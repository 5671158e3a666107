//! Remote object-storage backend.
//!
//! [`RemoteBackend`] maps object keys onto buckets of an S3-dialect service
//! reached through an [`ObjectStorageClient`]. Buckets are chosen per
//! organization and created with versioning enabled on first use; buckets
//! that already exist are used with whatever versioning state they report.
//! Objects
//! with audio, image or video content are tagged as freezable so they may
//! later be moved to a cold storage class.

mod client;
mod http;
mod memory;
pub mod sigv4;

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strata_types::{MimeType, ObjectKey, ObjectVersion};
use tracing::{debug, info, warn};

pub use client::{ObjectBody, ObjectHead, ObjectStorageClient, Tags};
pub use http::{Credentials, HttpObjectStorage, HttpStorageConfig};
pub use memory::MemoryObjectStorage;

use crate::error::{BackendError, BackendResult};
use crate::tier::{ClassChange, RestoreStatus, StorageClass};
use crate::traits::{BackendDriver, TieredStorage};

/// Bucket map key matching every organization without its own entry.
pub const DEFAULT_BUCKET_KEY: &str = "*";

const FREEZABLE_TAG: &str = "Freezable";

/// Organization id to bucket name, with an optional `"*"` default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketMap(BTreeMap<String, String>);

impl BucketMap {
    /// A map sending every organization to `bucket`.
    pub fn single(bucket: impl Into<String>) -> Self {
        Self::default().with(DEFAULT_BUCKET_KEY, bucket)
    }

    pub fn with(mut self, organization_id: impl Into<String>, bucket: impl Into<String>) -> Self {
        self.0.insert(organization_id.into(), bucket.into());
        self
    }

    /// The bucket for `organization_id`, falling back to the default.
    pub fn resolve(&self, organization_id: &str) -> BackendResult<&str> {
        self.0
            .get(organization_id)
            .or_else(|| self.0.get(DEFAULT_BUCKET_KEY))
            .map(String::as_str)
            .ok_or_else(|| {
                BackendError::Config(format!(
                    "no bucket configured for organization {organization_id}"
                ))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Remote backend behaviour.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub buckets: BucketMap,
    /// Days a restored copy stays readable when a read triggers the restore.
    pub restore_days: u32,
    /// Enable versioning on buckets this backend creates.
    pub versioning: bool,
}

impl RemoteConfig {
    pub fn new(buckets: BucketMap) -> Self {
        Self {
            buckets,
            restore_days: 2,
            versioning: true,
        }
    }
}

/// A [`BackendDriver`] over an [`ObjectStorageClient`].
pub struct RemoteBackend {
    client: Arc<dyn ObjectStorageClient>,
    config: RemoteConfig,
    /// Buckets known to exist, with whether they version objects.
    ready: RwLock<HashMap<String, bool>>,
}

/// Version ids the service uses to say "no version".
fn normalize_version(raw: Option<String>) -> Option<ObjectVersion> {
    raw.filter(|v| !v.is_empty() && v != "null" && v != "-1")
        .map(ObjectVersion::new)
}

impl RemoteBackend {
    pub fn new(client: Arc<dyn ObjectStorageClient>, config: RemoteConfig) -> BackendResult<Self> {
        if config.buckets.is_empty() {
            return Err(BackendError::Config("remote backend has no buckets".into()));
        }
        Ok(Self {
            client,
            config,
            ready: RwLock::new(HashMap::new()),
        })
    }

    fn bucket_for(&self, key: &ObjectKey) -> BackendResult<&str> {
        self.config.buckets.resolve(key.organization_id())
    }

    /// Make sure `bucket` exists, creating it (with versioning, if
    /// configured) when the service says it does not. Returns whether the
    /// bucket versions objects. Probe failures are errors and leave the
    /// bucket unverified.
    fn ensure_bucket(&self, bucket: &str) -> BackendResult<bool> {
        let known = self
            .ready
            .read()
            .map_err(|_| BackendError::Unavailable("bucket cache lock poisoned".into()))?
            .get(bucket)
            .copied();
        if let Some(versioned) = known {
            return Ok(versioned);
        }
        let versioned = if self.client.bucket_exists(bucket)? {
            let versioned = self.client.bucket_versioning(bucket)?;
            if !versioned {
                warn!(bucket, "bucket does not version objects; shared keys are never rewritten");
            }
            versioned
        } else {
            info!(bucket, "creating bucket");
            self.client.create_bucket(bucket)?;
            if self.config.versioning {
                self.client.enable_versioning(bucket)?;
                info!(bucket, "bucket versioning enabled");
            }
            self.config.versioning
        };
        self.ready
            .write()
            .map_err(|_| BackendError::Unavailable("bucket cache lock poisoned".into()))?
            .insert(bucket.to_string(), versioned);
        Ok(versioned)
    }

    fn head(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<Option<ObjectHead>> {
        let bucket = self.bucket_for(key)?;
        self.client
            .head_object(bucket, key.as_str(), version.map(ObjectVersion::as_str))
    }

    fn is_freezable(
        &self,
        bucket: &str,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<bool> {
        let tags = self
            .client
            .get_object_tags(bucket, key.as_str(), version.map(ObjectVersion::as_str))?;
        Ok(tags
            .iter()
            .any(|(k, v)| k == FREEZABLE_TAG && v.eq_ignore_ascii_case("true")))
    }

    /// Spool `data` to a temporary file so the upload has a known length.
    fn spool(data: &mut dyn Read) -> BackendResult<ObjectBody> {
        let mut file = tempfile::tempfile()?;
        let len = io::copy(data, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(ObjectBody::new(Box::new(file), len))
    }
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackendDriver for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn write(
        &self,
        key: &ObjectKey,
        data: &mut dyn Read,
        mime_type: Option<&MimeType>,
    ) -> BackendResult<Option<ObjectVersion>> {
        let bucket = self.bucket_for(key)?;
        self.ensure_bucket(bucket)?;

        let body = Self::spool(data)?;
        let bytes = body.len;
        let content_type = mime_type.map(MimeType::to_string);
        let raw_version =
            self.client
                .put_object(bucket, key.as_str(), body, content_type.as_deref())?;
        let version = normalize_version(raw_version);
        info!(%key, bucket, bytes, version = ?version, "object uploaded");

        if mime_type.is_some_and(MimeType::is_media) {
            debug!(%key, "tagging object as freezable");
            let tags = [(FREEZABLE_TAG.to_string(), "true".to_string())];
            let v = version.as_ref().map(ObjectVersion::as_str);
            if let Err(e) = self.client.put_object_tags(bucket, key.as_str(), v, &tags) {
                // The upload is not reported as done, so nothing will map to it.
                if let Err(cleanup) = self.client.delete_object(bucket, key.as_str(), v) {
                    warn!(%key, error = %cleanup, "could not remove untagged upload");
                }
                return Err(e);
            }
        }
        Ok(version)
    }

    fn read(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>> {
        let Some(head) = self.head(key, version)? else {
            return Ok(None);
        };
        if head.storage_class.is_frozen() && !head.restore.is_readable() {
            if head.restore != RestoreStatus::Restoring {
                let bucket = self.bucket_for(key)?;
                self.client.restore_object(
                    bucket,
                    key.as_str(),
                    version.map(ObjectVersion::as_str),
                    self.config.restore_days,
                )?;
                info!(%key, days = self.config.restore_days, "restore initiated for read");
            }
            return Err(BackendError::Frozen {
                key: key.to_string(),
            });
        }
        let bucket = self.bucket_for(key)?;
        self.client
            .get_object(bucket, key.as_str(), version.map(ObjectVersion::as_str))
    }

    fn exists(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool> {
        Ok(self.head(key, version)?.is_some())
    }

    fn delete(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool> {
        if self.head(key, version)?.is_none() {
            return Ok(false);
        }
        let bucket = self.bucket_for(key)?;
        self.client
            .delete_object(bucket, key.as_str(), version.map(ObjectVersion::as_str))?;
        info!(%key, bucket, version = ?version, "object deleted");
        Ok(true)
    }

    fn versions_objects(&self, key: &ObjectKey) -> BackendResult<bool> {
        self.ensure_bucket(self.bucket_for(key)?)
    }

    fn tiering(&self) -> Option<&dyn TieredStorage> {
        Some(self)
    }
}

impl TieredStorage for RemoteBackend {
    fn storage_class(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<StorageClass>> {
        Ok(self.head(key, version)?.map(|h| h.storage_class))
    }

    fn modify_storage_class(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
        target: &StorageClass,
    ) -> BackendResult<Option<ClassChange>> {
        let Some(head) = self.head(key, version)? else {
            return Ok(None);
        };
        let unchanged = |class: StorageClass| -> BackendResult<Option<ClassChange>> {
            Ok(Some(ClassChange {
                class,
                version: version.cloned(),
            }))
        };
        let current = head.storage_class;
        if current == *target {
            info!(%key, class = %target, "object already in storage class");
            return unchanged(current);
        }
        if current.is_frozen() && head.restore == RestoreStatus::None {
            warn!(%key, from = %current, to = %target, "object must be restored before it can move");
            return unchanged(current);
        }
        let bucket = self.bucket_for(key)?;
        if target.is_frozen() && !self.is_freezable(bucket, key, version)? {
            warn!(%key, to = %target, "object is not tagged freezable");
            return unchanged(current);
        }
        let raw = self.client.change_storage_class(
            bucket,
            key.as_str(),
            version.map(ObjectVersion::as_str),
            target,
        )?;
        let moved = normalize_version(raw);
        info!(%key, from = %current, to = %target, version = ?moved, "storage class changed");
        Ok(Some(ClassChange {
            class: target.clone(),
            version: moved,
        }))
    }

    fn restore_status(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<RestoreStatus>> {
        Ok(self.head(key, version)?.map(|h| h.restore))
    }

    fn initiate_restore(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
        days: u32,
    ) -> BackendResult<bool> {
        let Some(head) = self.head(key, version)? else {
            return Ok(false);
        };
        if !head.storage_class.is_frozen() {
            debug!(%key, class = %head.storage_class, "object is not frozen; nothing to restore");
            return Ok(true);
        }
        if head.restore == RestoreStatus::Restoring {
            info!(%key, "object is already being restored");
            return Ok(true);
        }
        let bucket = self.bucket_for(key)?;
        self.client
            .restore_object(bucket, key.as_str(), version.map(ObjectVersion::as_str), days)?;
        info!(%key, version = ?version, days, "restore initiated");
        Ok(true)
    }
}
