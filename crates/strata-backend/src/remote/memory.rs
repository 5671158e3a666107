//! In-process object-storage service for tests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};

use super::client::{ObjectBody, ObjectHead, ObjectStorageClient, Tags};
use crate::error::{BackendError, BackendResult};
use crate::tier::{RestoreStatus, StorageClass};

#[derive(Clone, Debug)]
struct StoredObject {
    version_id: Option<String>,
    data: Arc<Vec<u8>>,
    storage_class: StorageClass,
    restore: RestoreStatus,
    tags: Tags,
}

#[derive(Debug, Default)]
struct Bucket {
    versioning: bool,
    objects: HashMap<String, Vec<StoredObject>>,
}

impl Bucket {
    fn find(&self, key: &str, version_id: Option<&str>) -> Option<&StoredObject> {
        let versions = self.objects.get(key)?;
        match version_id {
            Some(v) => versions.iter().find(|o| o.version_id.as_deref() == Some(v)),
            None => versions.last(),
        }
    }

    fn find_mut(&mut self, key: &str, version_id: Option<&str>) -> Option<&mut StoredObject> {
        let versions = self.objects.get_mut(key)?;
        match version_id {
            Some(v) => versions.iter_mut().find(|o| o.version_id.as_deref() == Some(v)),
            None => versions.last_mut(),
        }
    }
}

/// A versioning-aware object store held in memory.
///
/// Unversioned buckets report the version id `"null"`, as the real service
/// does. Frozen objects refuse reads until [`complete_restores`] is called
/// after a restore request.
///
/// [`complete_restores`]: MemoryObjectStorage::complete_restores
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
    next_version: AtomicU64,
    puts: AtomicUsize,
    restores: AtomicUsize,
    deny_bucket_lookup: AtomicBool,
}

fn no_such(what: &str, name: &str) -> BackendError {
    BackendError::Remote {
        status: 404,
        message: format!("{what}: {name}"),
    }
}

fn poisoned() -> BackendError {
    BackendError::Unavailable("object storage lock poisoned".into())
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a bucket.
    pub fn with_bucket(self, bucket: &str, versioning: bool) -> Self {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.insert(
                bucket.to_string(),
                Bucket {
                    versioning,
                    objects: HashMap::new(),
                },
            );
        }
        self
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.read().is_ok_and(|b| b.contains_key(bucket))
    }

    pub fn is_versioned(&self, bucket: &str) -> bool {
        self.buckets
            .read()
            .is_ok_and(|b| b.get(bucket).is_some_and(|b| b.versioning))
    }

    /// Number of versions stored under `key`.
    pub fn version_count(&self, bucket: &str, key: &str) -> usize {
        self.buckets
            .read()
            .map_or(0, |b| b.get(bucket).and_then(|b| b.objects.get(key)).map_or(0, Vec::len))
    }

    /// Number of object uploads.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of accepted restore requests.
    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// Make bucket lookups fail as if access were denied.
    pub fn deny_bucket_lookup(&self, deny: bool) {
        self.deny_bucket_lookup.store(deny, Ordering::SeqCst);
    }

    /// Finish every running restore; restored copies expire in `days`.
    pub fn complete_restores(&self, days: i64) {
        let Ok(mut buckets) = self.buckets.write() else {
            return;
        };
        let expires = Utc::now() + Duration::days(days);
        for object in buckets
            .values_mut()
            .flat_map(|b| b.objects.values_mut())
            .flatten()
        {
            if object.restore == RestoreStatus::Restoring {
                object.restore = RestoreStatus::Restored { expires };
            }
        }
    }
}

impl ObjectStorageClient for MemoryObjectStorage {
    fn bucket_exists(&self, bucket: &str) -> BackendResult<bool> {
        if self.deny_bucket_lookup.load(Ordering::SeqCst) {
            return Err(BackendError::Remote {
                status: 403,
                message: format!("AccessDenied: {bucket}"),
            });
        }
        Ok(self.has_bucket(bucket))
    }

    fn create_bucket(&self, bucket: &str) -> BackendResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn enable_versioning(&self, bucket: &str) -> BackendResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such("NoSuchBucket", bucket))?;
        b.versioning = true;
        Ok(())
    }

    fn bucket_versioning(&self, bucket: &str) -> BackendResult<bool> {
        let buckets = self.buckets.read().map_err(|_| poisoned())?;
        buckets
            .get(bucket)
            .map(|b| b.versioning)
            .ok_or_else(|| no_such("NoSuchBucket", bucket))
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody,
        _content_type: Option<&str>,
    ) -> BackendResult<Option<String>> {
        let mut data = Vec::with_capacity(body.len as usize);
        body.reader.read_to_end(&mut data)?;

        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such("NoSuchBucket", bucket))?;
        let version_id = if b.versioning {
            Some(format!("ver-{}", self.next_version.fetch_add(1, Ordering::SeqCst) + 1))
        } else {
            None
        };
        let object = StoredObject {
            version_id: version_id.clone(),
            data: Arc::new(data),
            storage_class: StorageClass::Standard,
            restore: RestoreStatus::None,
            tags: Vec::new(),
        };
        let versions = b.objects.entry(key.to_string()).or_default();
        if !b.versioning {
            versions.clear();
        }
        versions.push(object);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(version_id.unwrap_or_else(|| "null".to_string())))
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>> {
        let buckets = self.buckets.read().map_err(|_| poisoned())?;
        let Some(object) = buckets.get(bucket).and_then(|b| b.find(key, version_id)) else {
            return Ok(None);
        };
        if object.storage_class.is_frozen() && !object.restore.is_readable() {
            return Err(BackendError::Remote {
                status: 403,
                message: format!("InvalidObjectState: {key}"),
            });
        }
        Ok(Some(Box::new(Cursor::new(object.data.to_vec()))))
    }

    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Option<ObjectHead>> {
        let buckets = self.buckets.read().map_err(|_| poisoned())?;
        Ok(buckets
            .get(bucket)
            .and_then(|b| b.find(key, version_id))
            .map(|o| ObjectHead {
                version_id: o.version_id.clone(),
                size: o.data.len() as u64,
                storage_class: o.storage_class.clone(),
                restore: o.restore,
            }))
    }

    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let Some(b) = buckets.get_mut(bucket) else {
            return Ok(());
        };
        if let Some(versions) = b.objects.get_mut(key) {
            match version_id {
                Some(v) => versions.retain(|o| o.version_id.as_deref() != Some(v)),
                None => {
                    versions.pop();
                }
            }
            if versions.is_empty() {
                b.objects.remove(key);
            }
        }
        Ok(())
    }

    fn get_object_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> BackendResult<Tags> {
        let buckets = self.buckets.read().map_err(|_| poisoned())?;
        buckets
            .get(bucket)
            .and_then(|b| b.find(key, version_id))
            .map(|o| o.tags.clone())
            .ok_or_else(|| no_such("NoSuchKey", key))
    }

    fn put_object_tags(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        tags: &[(String, String)],
    ) -> BackendResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let object = buckets
            .get_mut(bucket)
            .and_then(|b| b.find_mut(key, version_id))
            .ok_or_else(|| no_such("NoSuchKey", key))?;
        object.tags = tags.to_vec();
        Ok(())
    }

    fn change_storage_class(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        class: &StorageClass,
    ) -> BackendResult<Option<String>> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such("NoSuchBucket", bucket))?;
        let versioning = b.versioning;
        let source = b
            .find(key, version_id)
            .cloned()
            .ok_or_else(|| no_such("NoSuchKey", key))?;
        if source.storage_class.is_frozen() && !source.restore.is_readable() {
            return Err(BackendError::Remote {
                status: 403,
                message: format!("InvalidObjectState: {key}"),
            });
        }
        // A copy onto the same key: a new version in versioned buckets.
        let copy = StoredObject {
            version_id: versioning
                .then(|| format!("ver-{}", self.next_version.fetch_add(1, Ordering::SeqCst) + 1)),
            storage_class: class.clone(),
            restore: RestoreStatus::None,
            ..source
        };
        let raw = copy.version_id.clone();
        let versions = b.objects.entry(key.to_string()).or_default();
        if !versioning {
            versions.clear();
        }
        versions.push(copy);
        Ok(Some(raw.unwrap_or_else(|| "null".to_string())))
    }

    fn restore_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        _days: u32,
    ) -> BackendResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| poisoned())?;
        let object = buckets
            .get_mut(bucket)
            .and_then(|b| b.find_mut(key, version_id))
            .ok_or_else(|| no_such("NoSuchKey", key))?;
        if !object.storage_class.is_frozen() {
            return Err(BackendError::Remote {
                status: 403,
                message: format!("InvalidObjectState: {key}"),
            });
        }
        if object.restore == RestoreStatus::None {
            object.restore = RestoreStatus::Restoring;
        }
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
