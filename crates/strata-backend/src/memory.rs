//! In-memory backend for testing and ephemeral use.
//!
//! [`InMemoryBackend`] keeps objects in a `HashMap` behind a `RwLock`. It
//! counts physical writes and deletes and can be told to fail, so callers can
//! observe exactly what reached the backend.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use strata_types::{MimeType, ObjectKey, ObjectVersion};
use tracing::debug;

use crate::error::{BackendError, BackendResult};
use crate::traits::BackendDriver;

type Versions = Vec<(Option<ObjectVersion>, Arc<Vec<u8>>)>;

/// An in-memory implementation of [`BackendDriver`].
///
/// With versioning enabled every write keeps the previous versions and
/// returns a fresh version token, like a versioned bucket.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: RwLock<HashMap<ObjectKey, Versions>>,
    versioned: bool,
    next_version: AtomicU64,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_deletes: Mutex<HashSet<ObjectKey>>,
}

impl InMemoryBackend {
    /// An unversioned backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that versions objects.
    pub fn versioned() -> Self {
        Self {
            versioned: true,
            ..Self::default()
        }
    }

    /// Number of successful `write` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that removed an object.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of stored objects, counting each version.
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .map(|objects| objects.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Make every following `write` fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make deletes of `key` fail.
    pub fn fail_deletes_of(&self, key: &ObjectKey) {
        if let Ok(mut keys) = self.fail_deletes.lock() {
            keys.insert(key.clone());
        }
    }

    fn poisoned() -> BackendError {
        BackendError::Unavailable("in-memory backend lock poisoned".into())
    }
}

fn matches_version(entry: &Option<ObjectVersion>, wanted: Option<&ObjectVersion>) -> bool {
    wanted.map_or(true, |w| entry.as_ref() == Some(w))
}

impl BackendDriver for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(
        &self,
        key: &ObjectKey,
        data: &mut dyn Read,
        _mime_type: Option<&MimeType>,
    ) -> BackendResult<Option<ObjectVersion>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Io(std::io::Error::other("injected write failure")));
        }
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;

        let version = self.versioned.then(|| {
            let n = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            ObjectVersion::new(format!("v{n}"))
        });
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        let versions = objects.entry(key.clone()).or_default();
        if !self.versioned {
            versions.clear();
        }
        versions.push((version.clone(), Arc::new(bytes)));
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(%key, ?version, "memory write");
        Ok(version)
    }

    fn read(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        let found = objects.get(key).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|(v, _)| matches_version(v, version))
                .map(|(_, bytes)| Arc::clone(bytes))
        });
        Ok(found.map(|bytes| Box::new(Cursor::new(bytes.to_vec())) as Box<dyn Read + Send>))
    }

    fn exists(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .get(key)
            .is_some_and(|versions| versions.iter().any(|(v, _)| matches_version(v, version))))
    }

    fn delete(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool> {
        if self
            .fail_deletes
            .lock()
            .map_err(|_| Self::poisoned())?
            .contains(key)
        {
            return Err(BackendError::Io(std::io::Error::other("injected delete failure")));
        }
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        let Some(versions) = objects.get_mut(key) else {
            return Ok(false);
        };
        let Some(idx) = versions.iter().rposition(|(v, _)| matches_version(v, version)) else {
            return Ok(false);
        };
        versions.remove(idx);
        if versions.is_empty() {
            objects.remove(key);
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn versions_objects(&self, _key: &ObjectKey) -> BackendResult<bool> {
        Ok(self.versioned)
    }

    fn used_space(&self) -> Option<u64> {
        let objects = self.objects.read().ok()?;
        Some(
            objects
                .values()
                .flatten()
                .map(|(_, bytes)| bytes.len() as u64)
                .sum(),
        )
    }
}
