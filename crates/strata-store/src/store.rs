//! The element store.
//!
//! [`ElementStore`] coordinates a [`MappingStore`] and a [`BackendDriver`].
//! It owns no state of its own: every reference lives in the mapping store
//! and every byte in the backend.
//!
//! # Guarantees
//!
//! - `put` writes the object and records the mapping in one critical section
//!   on the object key. A failed write leaves the path's previous mapping
//!   untouched.
//! - `copy` never writes bytes unless the backend can hard-link them; the
//!   target otherwise joins the source's equivalence class.
//! - `delete` removes a physical object only when its last active mapping is
//!   being dropped, and does so before the mappings are soft-deleted.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use serde::Serialize;
use strata_backend::{
    BackendDriver, BackendError, ClassChange, RestoreStatus, StorageClass, TieredStorage,
};
use strata_mapping::{IngestOutcome, MappingStore, PhysicalObjectMapping, ReleaseOutcome};
use strata_types::{
    DeletionSelector, MimeType, ObjectKey, ObjectLocator, Source, StoragePath,
};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::fetch::{SourceFetcher, UriFetcher};

/// Highest generation tried before a put gives up on finding a free key.
const MAX_GENERATIONS: u32 = 1024;

/// Default lifetime, in days, of a copy restored from a cold tier.
pub const DEFAULT_RESTORE_DAYS: u32 = 2;

/// Outcome of [`ElementStore::delete`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    /// Paths whose mappings were soft-deleted.
    pub released: Vec<StoragePath>,
    /// Physical objects removed because nothing referenced them any more.
    pub reclaimed: Vec<ObjectLocator>,
    /// Objects whose removal failed; their paths are still stored.
    pub failures: Vec<DeletionFailure>,
}

/// One object the backend failed to remove.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeletionFailure {
    pub locator: ObjectLocator,
    pub paths: Vec<StoragePath>,
    pub reason: String,
}

impl DeletionReport {
    /// Whether every selected path was released.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Versioned, deduplicating element storage.
pub struct ElementStore {
    mappings: Arc<dyn MappingStore>,
    backend: Arc<dyn BackendDriver>,
    fetcher: Arc<dyn SourceFetcher>,
    restore_days: u32,
}

impl std::fmt::Debug for ElementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementStore")
            .field("backend", &self.backend.name())
            .field("restore_days", &self.restore_days)
            .finish_non_exhaustive()
    }
}

impl ElementStore {
    pub fn new(
        mappings: Arc<dyn MappingStore>,
        backend: Arc<dyn BackendDriver>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            mappings,
            backend,
            fetcher,
            restore_days: DEFAULT_RESTORE_DAYS,
        }
    }

    /// Open the mapping table and backend a configuration describes.
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let mappings = Arc::new(config.open_mapping()?);
        let backend = config.open_backend()?;
        let fetcher = Arc::new(UriFetcher::new()?);
        info!(backend = backend.name(), durable = mappings.is_durable(), "element store opened");
        Ok(Self::new(mappings, backend, fetcher).with_restore_days(config.restore_days()))
    }

    pub fn with_restore_days(mut self, days: u32) -> Self {
        self.restore_days = days;
        self
    }

    pub fn backend(&self) -> &dyn BackendDriver {
        self.backend.as_ref()
    }

    pub fn mappings(&self) -> &dyn MappingStore {
        self.mappings.as_ref()
    }

    // ---- Ingest ----

    /// Store the bytes of `source` under `path`, replacing what `path`
    /// stored before.
    ///
    /// The object key comes from `path` and the source's extension (the
    /// path's own hint when the source has none).
    pub fn put(&self, path: &StoragePath, source: &Source) -> StoreResult<PhysicalObjectMapping> {
        let extension = source.extension().or(path.extension());
        let mut data = self.fetcher.open(source)?;
        self.put_reader(path, &mut data, extension, source.mime_type())
    }

    /// Store the bytes read from `data` under `path`.
    pub fn put_reader(
        &self,
        path: &StoragePath,
        data: &mut dyn Read,
        extension: Option<&str>,
        mime_type: Option<&MimeType>,
    ) -> StoreResult<PhysicalObjectMapping> {
        let previous = self.mappings.find_mapping(path)?;
        // Unversioned storage overwrites in place, so a key shared with
        // other paths must not be written again.
        let home = ObjectKey::derive_generation(path, extension, 0);
        let exclusive = !self.backend.versions_objects(&home)?;

        for generation in 0..MAX_GENERATIONS {
            let key = ObjectKey::derive_generation(path, extension, generation);
            let mut failure = None;
            let outcome = self.mappings.ingest(path, &key, exclusive, &mut || {
                match self.backend.write(&key, &mut *data, mime_type) {
                    Ok(version) => Some(version),
                    Err(e) => {
                        failure = Some(e);
                        None
                    }
                }
            })?;
            match outcome {
                IngestOutcome::Stored(row) => {
                    info!(%path, locator = %row.locator(), "element stored");
                    if let Some(old) = previous.as_ref().filter(|old| old.locator() != row.locator()) {
                        self.reclaim_replaced(&old.locator());
                    }
                    return Ok(row);
                }
                IngestOutcome::Occupied { holders } => {
                    debug!(%path, %key, holders, "object key shared; trying next generation");
                }
                IngestOutcome::Aborted => {
                    let e = failure
                        .unwrap_or_else(|| BackendError::Unavailable("write aborted".into()));
                    warn!(%path, %key, error = %e, "put failed; mapping unchanged");
                    return Err(e.into());
                }
            }
        }
        Err(StoreError::KeysExhausted { path: path.clone() })
    }

    /// Physically remove an object a path no longer references, if nothing
    /// else does. A failure leaves an orphan behind but does not fail the
    /// operation that re-pointed the path.
    fn reclaim_replaced(&self, locator: &ObjectLocator) {
        let mut failure = None;
        let result = self.mappings.reclaim_unreferenced(locator, &mut |loc| {
            match self.backend.delete(&loc.key, loc.version.as_ref()) {
                Ok(_) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            }
        });
        match (result, failure) {
            (Ok(true), _) => info!(%locator, "replaced object reclaimed"),
            (Ok(false), Some(e)) => warn!(%locator, error = %e, "replaced object left orphaned"),
            (Ok(false), None) => debug!(%locator, "replaced object still referenced"),
            (Err(e), _) => warn!(%locator, error = %e, "replaced object left orphaned"),
        }
    }

    // ---- Copy ----

    /// Make `to` store what `from` stores. Returns `false` if `from` is not
    /// stored.
    pub fn copy(&self, from: &StoragePath, to: &StoragePath) -> StoreResult<bool> {
        let Some(source) = self.mappings.find_mapping(from)? else {
            debug!(%from, "copy source not stored");
            return Ok(false);
        };
        let previous = self.mappings.find_mapping(to)?;

        let row = match self.link_copy(&source, to)? {
            Some(row) => row,
            None => match self.mappings.copy_mapping(from, to)? {
                Some(row) => row,
                None => {
                    debug!(%from, "copy source removed concurrently");
                    return Ok(false);
                }
            },
        };
        info!(%from, %to, locator = %row.locator(), "element copied");
        if let Some(old) = previous.filter(|old| old.locator() != row.locator()) {
            self.reclaim_replaced(&old.locator());
        }
        Ok(true)
    }

    /// Try to give `to` its own hard link to the source object. `None` when
    /// the backend does not link.
    fn link_copy(
        &self,
        source: &PhysicalObjectMapping,
        to: &StoragePath,
    ) -> StoreResult<Option<PhysicalObjectMapping>> {
        if source.object_version.is_some() {
            return Ok(None);
        }
        let extension = to.extension().or(source.object_key.extension());
        for generation in 0..MAX_GENERATIONS {
            let key = ObjectKey::derive_generation(to, extension, generation);
            if key == source.object_key {
                return Ok(None);
            }
            let mut failure = None;
            let outcome = self.mappings.ingest(to, &key, true, &mut || {
                match self.backend.link(&source.object_key, &key) {
                    Ok(true) => Some(None),
                    Ok(false) => None,
                    Err(e) => {
                        failure = Some(e);
                        None
                    }
                }
            })?;
            match outcome {
                IngestOutcome::Stored(row) => return Ok(Some(row)),
                IngestOutcome::Occupied { .. } => continue,
                IngestOutcome::Aborted => {
                    if let Some(e) = failure {
                        warn!(from = %source.object_key, to = %key, error = %e, "hard link failed");
                    }
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    // ---- Lookup ----

    /// Open the bytes stored under `path`. `None` if nothing is stored.
    ///
    /// A path re-pointed while its old object was being read is looked up
    /// again; only a mapping that still names a missing object is an
    /// integrity violation.
    pub fn get(&self, path: &StoragePath) -> StoreResult<Option<Box<dyn Read + Send>>> {
        let Some(mut row) = self.mappings.find_mapping(path)? else {
            debug!(%path, "not stored");
            return Ok(None);
        };
        loop {
            if let Some(reader) = self
                .backend
                .read(&row.object_key, row.object_version.as_ref())?
            {
                return Ok(Some(reader));
            }
            match self.mappings.find_mapping(path)? {
                Some(current) if current.locator() != row.locator() => {
                    debug!(%path, from = %row.locator(), to = %current.locator(), "path moved during read");
                    row = current;
                }
                Some(_) => return Err(self.integrity_violation(path, row.locator())),
                None => return Ok(None),
            }
        }
    }

    /// Whether `path` is stored. Consults the mapping table only.
    pub fn contains(&self, path: &StoragePath) -> StoreResult<bool> {
        Ok(self.mappings.contains(path)?)
    }

    /// The object key behind `path`.
    pub fn object_key(&self, path: &StoragePath) -> StoreResult<Option<ObjectKey>> {
        Ok(self.mappings.find_mapping(path)?.map(|row| row.object_key))
    }

    fn integrity_violation(&self, path: &StoragePath, locator: ObjectLocator) -> StoreError {
        error!(
            integrity = true,
            %path,
            %locator,
            backend = self.backend.name(),
            "active mapping references a missing object"
        );
        StoreError::DataIntegrity {
            path: path.clone(),
            locator,
        }
    }

    // ---- Delete ----

    /// Delete every stored path the selector matches.
    ///
    /// Paths are processed per physical object. An object is removed only
    /// when all of its active references are among the selected paths. A
    /// backend failure on one object is reported and leaves that object's
    /// paths stored; the other objects are still processed.
    pub fn delete(&self, selector: &DeletionSelector) -> StoreResult<DeletionReport> {
        let mut groups: BTreeMap<ObjectLocator, Vec<StoragePath>> = BTreeMap::new();
        for row in self.mappings.find_mappings_by_selector(selector)? {
            groups.entry(row.locator()).or_default().push(row.storage_path);
        }

        let mut report = DeletionReport::default();
        for (locator, paths) in groups {
            let mut failure = None;
            let outcome = self.mappings.release(&locator, &paths, &mut |loc| {
                match self.backend.delete(&loc.key, loc.version.as_ref()) {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(integrity = true, locator = %loc, "object already absent");
                        true
                    }
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                }
            })?;
            match outcome {
                ReleaseOutcome::Reclaimed { rows } => {
                    info!(%locator, paths = rows.len(), "object reclaimed");
                    report.reclaimed.push(locator);
                    report.released.extend(rows);
                }
                ReleaseOutcome::Released { rows, remaining } => {
                    debug!(%locator, paths = rows.len(), remaining, "object still referenced");
                    report.released.extend(rows);
                }
                ReleaseOutcome::ReclaimFailed { rows } => {
                    let reason = failure
                        .map_or_else(|| "reclaim failed".to_string(), |e| e.to_string());
                    warn!(%locator, error = %reason, "object not deleted; paths kept");
                    report.failures.push(DeletionFailure {
                        locator,
                        paths: rows,
                        reason,
                    });
                }
                ReleaseOutcome::Nothing => {}
            }
        }

        info!(
            %selector,
            released = report.released.len(),
            reclaimed = report.reclaimed.len(),
            failed = report.failures.len(),
            "delete finished"
        );
        Ok(report)
    }

    // ---- Capacity ----

    pub fn used_space(&self) -> Option<u64> {
        self.backend.used_space()
    }

    pub fn usable_space(&self) -> Option<u64> {
        self.backend.usable_space()
    }

    pub fn total_space(&self) -> Option<u64> {
        self.backend.total_space()
    }

    // ---- Storage tiers ----

    fn tiers(&self, operation: &'static str) -> StoreResult<&dyn TieredStorage> {
        self.backend
            .tiering()
            .ok_or_else(|| StoreError::Unsupported {
                backend: self.backend.name().to_string(),
                operation,
            })
    }

    /// Run a tier query for the object version behind `path`. `None` if
    /// `path` is not stored; a stored path whose object is gone is an
    /// integrity error.
    fn with_stored_object<T>(
        &self,
        path: &StoragePath,
        op: impl FnOnce(&ObjectLocator) -> Result<Option<T>, BackendError>,
    ) -> StoreResult<Option<T>> {
        let Some(row) = self.mappings.find_mapping(path)? else {
            return Ok(None);
        };
        let locator = row.locator();
        match op(&locator)? {
            Some(value) => Ok(Some(value)),
            None => Err(self.integrity_violation(path, locator)),
        }
    }

    pub fn storage_class(&self, path: &StoragePath) -> StoreResult<Option<StorageClass>> {
        let tiers = self.tiers("storage class")?;
        self.with_stored_object(path, |loc| tiers.storage_class(&loc.key, loc.version.as_ref()))
    }

    /// Move the object behind `path` to `target`. Returns the class it ends
    /// up in; moves the backend refuses leave the current class.
    ///
    /// When the backend rewrites the object as a new version, every path
    /// sharing the old version is re-pointed at the new one and the old
    /// version is removed.
    pub fn modify_storage_class(
        &self,
        path: &StoragePath,
        target: StorageClass,
    ) -> StoreResult<Option<StorageClass>> {
        let tiers = self.tiers("modify storage class")?;
        let Some(row) = self.mappings.find_mapping(path)? else {
            return Ok(None);
        };
        let from = row.locator();
        let mut outcome: Option<Result<Option<ClassChange>, BackendError>> = None;
        let moved = self.mappings.relocate(&from, &mut |loc| {
            let result = tiers.modify_storage_class(&loc.key, loc.version.as_ref(), &target);
            let to = match &result {
                Ok(Some(change)) => Some(ObjectLocator::new(loc.key.clone(), change.version.clone())),
                _ => None,
            };
            outcome = Some(result);
            to
        });
        let moved = match moved {
            Ok(moved) => moved,
            Err(e) => {
                if let Some(Ok(Some(change))) = &outcome {
                    let copy = ObjectLocator::new(from.key.clone(), change.version.clone());
                    if copy != from {
                        self.reclaim_replaced(&copy);
                    }
                }
                return Err(e.into());
            }
        };
        match (outcome, moved) {
            // No longer stored, or re-pointed before the move began.
            (None, _) => match self.mappings.find_mapping(path)? {
                Some(current) if current.locator() != from => {
                    self.modify_storage_class(path, target)
                }
                _ => Ok(None),
            },
            (Some(Err(e)), _) => Err(e.into()),
            (Some(Ok(None)), _) => Err(self.integrity_violation(path, from)),
            (Some(Ok(Some(change))), Some(to)) => {
                if to != from {
                    info!(%path, %from, %to, class = %change.class, "object moved to new version");
                    self.reclaim_replaced(&from);
                }
                Ok(Some(change.class))
            }
            (Some(Ok(Some(change))), None) => Ok(Some(change.class)),
        }
    }

    pub fn restore_status(&self, path: &StoragePath) -> StoreResult<Option<RestoreStatus>> {
        let tiers = self.tiers("restore status")?;
        self.with_stored_object(path, |loc| tiers.restore_status(&loc.key, loc.version.as_ref()))
    }

    /// Request a readable copy of a frozen object for `days` (the configured
    /// default when `None`). Returns `false` if `path` is not stored.
    pub fn initiate_restore(&self, path: &StoragePath, days: Option<u32>) -> StoreResult<bool> {
        let tiers = self.tiers("restore")?;
        let days = days.unwrap_or(self.restore_days);
        let requested = self.with_stored_object(path, |loc| {
            Ok(tiers
                .initiate_restore(&loc.key, loc.version.as_ref(), days)?
                .then_some(()))
        })?;
        Ok(requested.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::thread;

    use strata_backend::{
        FilesystemBackend, FilesystemConfig, InMemoryBackend, MemoryObjectStorage,
        ObjectStorageClient, RemoteBackend, RemoteConfig, BucketMap,
    };
    use strata_mapping::MappingTable;
    use url::Url;

    use super::*;

    /// Serves registered URIs from memory.
    #[derive(Default)]
    struct MemoryFetcher {
        files: Mutex<HashMap<Url, Vec<u8>>>,
    }

    impl MemoryFetcher {
        fn source(&self, uri: &str, bytes: &[u8]) -> Source {
            let source = Source::parse(uri).unwrap();
            self.files
                .lock()
                .unwrap()
                .insert(source.uri().clone(), bytes.to_vec());
            source
        }
    }

    impl SourceFetcher for MemoryFetcher {
        fn open(&self, source: &Source) -> StoreResult<Box<dyn Read + Send>> {
            let files = self.files.lock().unwrap();
            let bytes = files.get(source.uri()).cloned().ok_or_else(|| StoreError::Fetch {
                uri: source.uri().to_string(),
                reason: "not registered".into(),
            })?;
            Ok(Box::new(std::io::Cursor::new(bytes)))
        }
    }

    struct Harness {
        store: ElementStore,
        backend: Arc<InMemoryBackend>,
        table: Arc<MappingTable>,
        fetcher: Arc<MemoryFetcher>,
    }

    fn harness_with(backend: InMemoryBackend) -> Harness {
        let backend = Arc::new(backend);
        let table = Arc::new(MappingTable::in_memory());
        let fetcher = Arc::new(MemoryFetcher::default());
        let store = ElementStore::new(table.clone(), backend.clone(), fetcher.clone());
        Harness {
            store,
            backend,
            table,
            fetcher,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryBackend::new())
    }

    fn path(mp: &str, version: u64, el: &str) -> StoragePath {
        StoragePath::new("org1", mp, version, el).unwrap()
    }

    fn read(store: &ElementStore, p: &StoragePath) -> Option<Vec<u8>> {
        store.get(p).unwrap().map(|mut r| {
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            out
        })
    }

    // ---- Test 1: put then get returns the source bytes ----
    #[test]
    fn round_trip() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"video bytes");

        let row = h.store.put(&a, &src).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA.mp4");
        assert_eq!(read(&h.store, &a).unwrap(), b"video bytes");
        assert!(h.store.contains(&a).unwrap());
        assert_eq!(h.store.object_key(&a).unwrap(), Some(row.object_key));
        assert_eq!(h.backend.writes(), 1);
    }

    // ---- Test 2: a source without extension gives a bare key ----
    #[test]
    fn key_without_extension() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let src = h.fetcher.source("https://staging.example.org/README", b"text");
        assert_eq!(h.store.put(&a, &src).unwrap().object_key.as_str(), "org1/mp1/1/elA");

        let hinted = path("mp1", 1, "elB").with_extension("xml").unwrap();
        let row = h.store.put(&hinted, &src).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elB.xml");
    }

    // ---- Test 3: unknown paths are empty results, not errors ----
    #[test]
    fn missing_paths() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        assert!(read(&h.store, &a).is_none());
        assert!(!h.store.contains(&a).unwrap());
        assert!(!h.store.copy(&a, &path("mp1", 2, "elA")).unwrap());
        assert_eq!(h.store.object_key(&a).unwrap(), None);
    }

    // ---- Test 4: copy writes nothing ----
    #[test]
    fn copy_performs_no_write() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"shared");
        h.store.put(&a, &src).unwrap();

        assert!(h.store.copy(&a, &b).unwrap());
        assert_eq!(h.backend.writes(), 1);
        assert_eq!(h.backend.object_count(), 1);
        assert_eq!(read(&h.store, &b).unwrap(), b"shared");
        assert_eq!(h.store.object_key(&a).unwrap(), h.store.object_key(&b).unwrap());
    }

    // ---- Test 5: the concrete scenario ----
    #[test]
    fn shared_survival_then_full_reclamation() {
        let h = harness();
        let v1 = path("mp1", 1, "elA");
        let v2 = path("mp1", 2, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");

        let row = h.store.put(&v1, &src).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA.mp4");
        assert!(h.store.copy(&v1, &v2).unwrap());
        assert_eq!(h.backend.writes(), 1);

        let report = h.store.delete(&DeletionSelector::version("org1", "mp1", 1).unwrap()).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.released, vec![v1.clone()]);
        assert!(report.reclaimed.is_empty());
        assert_eq!(read(&h.store, &v2).unwrap(), b"X");
        assert!(h.backend.exists(&row.object_key, None).unwrap());

        let report = h.store.delete(&DeletionSelector::version("org1", "mp1", 2).unwrap()).unwrap();
        assert_eq!(report.reclaimed, vec![row.locator()]);
        assert!(!h.backend.exists(&row.object_key, None).unwrap());
        assert!(!h.store.contains(&v1).unwrap());
        assert!(!h.store.contains(&v2).unwrap());
        assert_eq!(h.table.total_rows().unwrap(), 2);
    }

    // ---- Test 6: deleting one version leaves the others ----
    #[test]
    fn version_isolation() {
        let h = harness();
        let v1 = path("mp1", 1, "elA");
        let v2 = path("mp1", 2, "elA");
        let s1 = h.fetcher.source("https://staging.example.org/one.mp4", b"one");
        let s2 = h.fetcher.source("https://staging.example.org/two.mp4", b"two");
        let k1 = h.store.put(&v1, &s1).unwrap().object_key;
        let k2 = h.store.put(&v2, &s2).unwrap().object_key;
        assert_ne!(k1, k2);

        h.store.delete(&DeletionSelector::version("org1", "mp1", 1).unwrap()).unwrap();
        assert!(read(&h.store, &v1).is_none());
        assert_eq!(read(&h.store, &v2).unwrap(), b"two");
        assert!(!h.backend.exists(&k1, None).unwrap());
    }

    // ---- Test 7: an all-versions selector spans versions ----
    #[test]
    fn delete_all_versions() {
        let h = harness();
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
        h.store.put(&path("mp1", 1, "elA"), &src).unwrap();
        h.store.copy(&path("mp1", 1, "elA"), &path("mp1", 2, "elA")).unwrap();
        h.store.put(&path("mp1", 2, "elB"), &src).unwrap();
        h.store.put(&path("mp2", 1, "elA"), &src).unwrap();

        let report = h.store.delete(&DeletionSelector::all_versions("org1", "mp1").unwrap()).unwrap();
        assert_eq!(report.released.len(), 3);
        assert_eq!(report.reclaimed.len(), 2);
        assert_eq!(h.backend.object_count(), 1);
        assert!(h.store.contains(&path("mp2", 1, "elA")).unwrap());
    }

    // ---- Test 8: deleting twice is a successful no-op ----
    #[test]
    fn idempotent_delete() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
        h.store.put(&a, &src).unwrap();

        let selector = DeletionSelector::for_path(&a);
        assert_eq!(h.store.delete(&selector).unwrap().released.len(), 1);
        let again = h.store.delete(&selector).unwrap();
        assert!(again.is_complete());
        assert_eq!(again, DeletionReport::default());
        assert_eq!(h.backend.deletes(), 1);
    }

    // ---- Test 9: a missing object behind a mapping is loud ----
    #[test]
    fn missing_object_is_an_integrity_error() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
        let row = h.store.put(&a, &src).unwrap();
        h.backend.delete(&row.object_key, None).unwrap();

        // contains never touches the backend.
        assert!(h.store.contains(&a).unwrap());
        match h.store.get(&a) {
            Err(StoreError::DataIntegrity { path, locator }) => {
                assert_eq!(path, a);
                assert_eq!(locator, row.locator());
            }
            other => panic!("expected integrity error, got {:?}", other.map(|r| r.is_some())),
        }

        // Deleting it still succeeds and drops the mapping.
        let report = h.store.delete(&DeletionSelector::for_path(&a)).unwrap();
        assert_eq!(report.reclaimed, vec![row.locator()]);
        assert!(!h.store.contains(&a).unwrap());
    }

    // ---- Test 10: a failed write leaves the old mapping in place ----
    #[test]
    fn failed_put_keeps_previous_mapping() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let first = h.fetcher.source("https://staging.example.org/first.mp4", b"first");
        let second = h.fetcher.source("https://staging.example.org/second.mp4", b"second");
        let before = h.store.put(&a, &first).unwrap();

        h.backend.fail_writes(true);
        let err = h.store.put(&a, &second).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(h.table.find_mapping(&a).unwrap(), Some(before));
        assert_eq!(read(&h.store, &a).unwrap(), b"first");

        let fresh = path("mp1", 1, "elB");
        assert!(h.store.put(&fresh, &second).is_err());
        assert!(!h.store.contains(&fresh).unwrap());
    }

    // ---- Test 11: an unreadable source changes nothing ----
    #[test]
    fn fetch_failure_changes_nothing() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let unknown = Source::parse("https://staging.example.org/absent.mp4").unwrap();
        assert!(matches!(h.store.put(&a, &unknown), Err(StoreError::Fetch { .. })));
        assert!(!h.store.contains(&a).unwrap());
        assert_eq!(h.backend.writes(), 0);
    }

    // ---- Test 12: one failing object does not block the others ----
    #[test]
    fn partial_delete_failure_is_isolated() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 1, "elB");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
        let ka = h.store.put(&a, &src).unwrap().object_key;
        let kb = h.store.put(&b, &src).unwrap().object_key;
        h.backend.fail_deletes_of(&ka);

        let report = h.store.delete(&DeletionSelector::version("org1", "mp1", 1).unwrap()).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].paths, vec![a.clone()]);
        assert!(report.failures[0].reason.contains("injected"));
        assert_eq!(report.released, vec![b.clone()]);
        assert_eq!(report.reclaimed, vec![ObjectLocator::new(kb, None)]);

        // The failed path stays stored and readable.
        assert!(h.store.contains(&a).unwrap());
        assert_eq!(read(&h.store, &a).unwrap(), b"X");
    }

    // ---- Test 13: re-putting a shared path never overwrites shared bytes ----
    #[test]
    fn reput_of_shared_key_uses_generation_key() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let old = h.fetcher.source("https://staging.example.org/old.mp4", b"old");
        let new = h.fetcher.source("https://staging.example.org/new.mp4", b"new");
        h.store.put(&a, &old).unwrap();
        h.store.copy(&a, &b).unwrap();

        let row = h.store.put(&a, &new).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA~1.mp4");
        assert_eq!(read(&h.store, &a).unwrap(), b"new");
        assert_eq!(read(&h.store, &b).unwrap(), b"old");

        // Once b is gone the plain key is free again and the generation
        // object is reclaimed on the next put.
        h.store.delete(&DeletionSelector::version("org1", "mp1", 2).unwrap()).unwrap();
        let row = h.store.put(&a, &old).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA.mp4");
        assert_eq!(h.backend.object_count(), 1);
    }

    // ---- Test 14: re-putting a sole-owner path overwrites in place ----
    #[test]
    fn reput_of_unshared_key_overwrites() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let first = h.fetcher.source("https://staging.example.org/first.mp4", b"first");
        let second = h.fetcher.source("https://staging.example.org/second.mp4", b"second");
        h.store.put(&a, &first).unwrap();
        let row = h.store.put(&a, &second).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA.mp4");
        assert_eq!(h.backend.object_count(), 1);
        assert_eq!(read(&h.store, &a).unwrap(), b"second");

        // A new extension names a new key; the old object goes away.
        let third = h.fetcher.source("https://staging.example.org/third.mov", b"third");
        let row = h.store.put(&a, &third).unwrap();
        assert_eq!(row.object_key.as_str(), "org1/mp1/1/elA.mov");
        assert_eq!(h.backend.object_count(), 1);
    }

    // ---- Test 15: versioned backends keep one object per version ----
    #[test]
    fn versioned_backend_equivalence_classes() {
        let h = harness_with(InMemoryBackend::versioned());
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let old = h.fetcher.source("https://staging.example.org/old.mp4", b"old");
        let new = h.fetcher.source("https://staging.example.org/new.mp4", b"new");

        let first = h.store.put(&a, &old).unwrap();
        assert!(first.object_version.is_some());
        h.store.copy(&a, &b).unwrap();

        let second = h.store.put(&a, &new).unwrap();
        assert_eq!(second.object_key, first.object_key);
        assert_ne!(second.object_version, first.object_version);
        assert_eq!(read(&h.store, &a).unwrap(), b"new");
        assert_eq!(read(&h.store, &b).unwrap(), b"old");
        assert_eq!(h.backend.object_count(), 2);

        h.store.delete(&DeletionSelector::version("org1", "mp1", 2).unwrap()).unwrap();
        assert_eq!(h.backend.object_count(), 1);
        assert_eq!(read(&h.store, &a).unwrap(), b"new");

        // An unreferenced old version is reclaimed by the put that replaced it.
        h.store.put(&a, &old).unwrap();
        assert_eq!(h.backend.object_count(), 1);
    }

    // ---- Test 16: hard-link copies on the filesystem backend ----
    #[test]
    fn hard_link_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            FilesystemBackend::new(FilesystemConfig::new(dir.path().join("objects")).with_hard_links(true))
                .unwrap(),
        );
        let fetcher = Arc::new(MemoryFetcher::default());
        let store = ElementStore::new(
            Arc::new(MappingTable::in_memory()),
            backend.clone(),
            fetcher.clone(),
        );
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let src = fetcher.source("https://staging.example.org/fileX.mp4", b"linked");
        store.put(&a, &src).unwrap();

        assert!(store.copy(&a, &b).unwrap());
        let kb = store.object_key(&b).unwrap().unwrap();
        assert_eq!(kb.as_str(), "org1/mp1/2/elA.mp4");
        assert!(backend.object_path(&kb).is_file());

        // The link is its own object: deleting a reclaims only a's file.
        let report = store.delete(&DeletionSelector::version("org1", "mp1", 1).unwrap()).unwrap();
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(read(&store, &b).unwrap(), b"linked");

        // Copying a path onto itself keeps it stored.
        assert!(store.copy(&b, &b).unwrap());
        assert_eq!(read(&store, &b).unwrap(), b"linked");
    }

    // ---- Test 17: without hard links the filesystem shares one file ----
    #[test]
    fn filesystem_mapping_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            FilesystemBackend::new(FilesystemConfig::new(dir.path().join("objects"))).unwrap(),
        );
        let fetcher = Arc::new(MemoryFetcher::default());
        let store = ElementStore::new(
            Arc::new(MappingTable::in_memory()),
            backend.clone(),
            fetcher.clone(),
        );
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let src = fetcher.source("https://staging.example.org/fileX.mp4", b"shared");
        store.put(&a, &src).unwrap();
        store.copy(&a, &b).unwrap();
        assert_eq!(store.object_key(&b).unwrap(), store.object_key(&a).unwrap());
        assert!(!backend.root().join("org1/mp1/2").exists());

        store.delete(&DeletionSelector::all_versions("org1", "mp1").unwrap()).unwrap();
        assert!(!backend.root().join("org1").exists());
        assert_eq!(store.used_space(), Some(0));
    }

    fn remote_store(
        storage: &Arc<MemoryObjectStorage>,
        versioning: bool,
    ) -> (ElementStore, Arc<MemoryFetcher>) {
        let client: Arc<dyn ObjectStorageClient> = storage.clone();
        let mut config = RemoteConfig::new(BucketMap::single("archive"));
        config.versioning = versioning;
        let backend = Arc::new(RemoteBackend::new(client, config).unwrap());
        let fetcher = Arc::new(MemoryFetcher::default());
        let store = ElementStore::new(Arc::new(MappingTable::in_memory()), backend, fetcher.clone())
            .with_restore_days(5);
        (store, fetcher)
    }

    // ---- Test 18: remote backend round trip and reclamation ----
    #[test]
    fn remote_round_trip() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let (store, fetcher) = remote_store(&storage, true);
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let src = fetcher.source("https://staging.example.org/fileX.mp4", b"remote");

        let row = store.put(&a, &src).unwrap();
        assert!(row.object_version.is_some());
        assert!(store.copy(&a, &b).unwrap());
        assert_eq!(storage.puts(), 1);
        assert_eq!(read(&store, &b).unwrap(), b"remote");

        store.delete(&DeletionSelector::all_versions("org1", "mp1").unwrap()).unwrap();
        assert!(!store.backend().exists(&row.object_key, None).unwrap());
        assert_eq!(store.used_space(), None);
    }

    // ---- Test 19: storage classes and restores through the store ----
    #[test]
    fn tiering_through_the_store() {
        let storage = Arc::new(MemoryObjectStorage::new().with_bucket("archive", false));
        let (store, fetcher) = remote_store(&storage, false);
        let video = fetcher
            .source("https://staging.example.org/fileX.mp4", b"frames")
            .with_mime_type("video/mp4".parse().unwrap());
        let text = fetcher.source("https://staging.example.org/notes.txt", b"notes");
        let a = path("mp1", 1, "elA");
        let t = path("mp1", 1, "notes");
        store.put(&a, &video).unwrap();
        store.put(&t, &text).unwrap();

        assert_eq!(store.storage_class(&a).unwrap(), Some(StorageClass::Standard));
        assert_eq!(store.storage_class(&path("mp1", 1, "nope")).unwrap(), None);

        // Only freezable objects may go cold.
        assert_eq!(
            store.modify_storage_class(&t, StorageClass::Glacier).unwrap(),
            Some(StorageClass::Standard)
        );
        assert_eq!(
            store.modify_storage_class(&a, StorageClass::Glacier).unwrap(),
            Some(StorageClass::Glacier)
        );

        // Reading a frozen object starts a restore and fails.
        let err = store.get(&a).err().unwrap();
        assert!(matches!(err, StoreError::Backend(BackendError::Frozen { .. })));
        assert_eq!(storage.restores(), 1);
        assert_eq!(store.restore_status(&a).unwrap(), Some(RestoreStatus::Restoring));
        assert!(store.initiate_restore(&a, None).unwrap());
        assert_eq!(storage.restores(), 1);

        storage.complete_restores(5);
        assert!(matches!(
            store.restore_status(&a).unwrap(),
            Some(RestoreStatus::Restored { .. })
        ));
        assert_eq!(read(&store, &a).unwrap(), b"frames");
        assert!(!store.initiate_restore(&path("mp1", 1, "nope"), Some(1)).unwrap());
    }

    // ---- Test 19b: a storage-class change moves every sharer to the new version ----
    #[test]
    fn storage_class_change_on_versioned_bucket() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let (store, fetcher) = remote_store(&storage, true);
        let video = fetcher
            .source("https://staging.example.org/fileX.mp4", b"frames")
            .with_mime_type("video/mp4".parse().unwrap());
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let before = store.put(&a, &video).unwrap();
        assert!(store.copy(&a, &b).unwrap());
        let key = before.object_key.as_str().to_string();

        assert_eq!(
            store.modify_storage_class(&a, StorageClass::Glacier).unwrap(),
            Some(StorageClass::Glacier)
        );
        let after = store.mappings().find_mapping(&a).unwrap().unwrap();
        assert_ne!(after.object_version, before.object_version);
        assert_eq!(store.mappings().find_mapping(&b).unwrap().unwrap().locator(), after.locator());
        assert_eq!(store.storage_class(&b).unwrap(), Some(StorageClass::Glacier));
        // The superseded version is gone.
        assert_eq!(storage.version_count("archive", &key), 1);

        // A restore reaches the version the paths map to.
        assert!(store.initiate_restore(&b, None).unwrap());
        assert_eq!(store.restore_status(&a).unwrap(), Some(RestoreStatus::Restoring));

        let report = store
            .delete(&DeletionSelector::all_versions("org1", "mp1").unwrap())
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(storage.version_count("archive", &key), 0);
    }

    // ---- Test 19c: a pre-existing unversioned bucket never loses shared bytes ----
    #[test]
    fn existing_unversioned_bucket_keeps_copies() {
        let storage = Arc::new(MemoryObjectStorage::new().with_bucket("archive", false));
        // Versioning is requested but the bucket already exists without it.
        let (store, fetcher) = remote_store(&storage, true);
        let a = path("mp1", 1, "elA");
        let b = path("mp1", 2, "elA");
        let first = store
            .put(&a, &fetcher.source("https://staging.example.org/old.mp4", b"old"))
            .unwrap();
        assert_eq!(first.object_version, None);
        assert!(store.copy(&a, &b).unwrap());

        let second = store
            .put(&a, &fetcher.source("https://staging.example.org/new.mp4", b"new"))
            .unwrap();
        assert_ne!(second.object_key, first.object_key);
        assert_eq!(read(&store, &a).unwrap(), b"new");
        assert_eq!(read(&store, &b).unwrap(), b"old");
        assert!(!storage.is_versioned("archive"));
    }

    // ---- Test 20: backends without tiers refuse tier operations ----
    #[test]
    fn tiering_unsupported() {
        let h = harness();
        let a = path("mp1", 1, "elA");
        let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
        h.store.put(&a, &src).unwrap();
        assert!(matches!(
            h.store.storage_class(&a),
            Err(StoreError::Unsupported { .. })
        ));
        assert!(matches!(
            h.store.initiate_restore(&a, None),
            Err(StoreError::Unsupported { .. })
        ));
    }

    // ---- Test 21: racing copy and delete never strand a mapping ----
    #[test]
    fn concurrent_copy_and_delete() {
        for round in 0..100 {
            let h = harness();
            let store = Arc::new(h.store);
            let a = path("mp1", 1, "elA");
            let b = path("mp2", 1, "elA");
            let src = h.fetcher.source("https://staging.example.org/fileX.mp4", b"X");
            store.put(&a, &src).unwrap();

            let copier = {
                let store = Arc::clone(&store);
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || store.copy(&a, &b).unwrap())
            };
            let report = store.delete(&DeletionSelector::for_path(&a)).unwrap();
            let copied = copier.join().unwrap();
            assert!(report.is_complete(), "round {round}");

            assert_eq!(store.contains(&b).unwrap(), copied, "round {round}");
            if copied {
                assert_eq!(read(&store, &b).unwrap(), b"X", "round {round}");
                assert!(report.reclaimed.is_empty(), "round {round}");
            }
        }
    }

    fn linking_store(dir: &std::path::Path) -> (ElementStore, Arc<MemoryFetcher>) {
        let backend = FilesystemBackend::new(
            FilesystemConfig::new(dir.join("objects")).with_hard_links(true),
        )
        .unwrap();
        let fetcher = Arc::new(MemoryFetcher::default());
        let store = ElementStore::new(
            Arc::new(MappingTable::in_memory()),
            Arc::new(backend),
            fetcher.clone(),
        );
        (store, fetcher)
    }

    // ---- Test 21b: linking over a stored path races a delete of the source ----
    #[test]
    fn concurrent_link_copy_and_delete() {
        for round in 0..50 {
            let dir = tempfile::tempdir().unwrap();
            let (store, fetcher) = linking_store(dir.path());
            let store = Arc::new(store);
            let a = path("mp1", 1, "elA");
            let b = path("mp2", 1, "elA");
            store
                .put(&a, &fetcher.source("https://staging.example.org/a.mp4", b"A"))
                .unwrap();
            store
                .put(&b, &fetcher.source("https://staging.example.org/b.mp4", b"B"))
                .unwrap();

            let copier = {
                let store = Arc::clone(&store);
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || store.copy(&a, &b).unwrap())
            };
            let report = store.delete(&DeletionSelector::for_path(&a)).unwrap();
            let copied = copier.join().unwrap();
            assert!(report.is_complete(), "round {round}");

            assert!(store.contains(&b).unwrap(), "round {round}");
            let data = read(&store, &b).unwrap();
            if copied {
                assert_eq!(data, b"A", "round {round}");
            } else {
                assert_eq!(data, b"B", "round {round}");
            }
        }
    }

    // ---- Test 21c: a path stays readable while it is copied over ----
    #[test]
    fn reads_during_repeated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, fetcher) = linking_store(dir.path());
        let one = path("mp1", 1, "one");
        let two = path("mp1", 1, "two");
        let b = path("mp2", 1, "elA");
        store
            .put(&one, &fetcher.source("https://staging.example.org/1.mp4", b"one"))
            .unwrap();
        store
            .put(&two, &fetcher.source("https://staging.example.org/2.mp4", b"two"))
            .unwrap();
        assert!(store.copy(&one, &b).unwrap());

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100 {
                    let from = if i % 2 == 0 { &two } else { &one };
                    assert!(store.copy(from, &b).unwrap());
                }
            });
            for _ in 0..300 {
                let data = read(&store, &b).unwrap();
                assert!(data == b"one" || data == b"two", "{data:?}");
            }
        });
        assert_eq!(store.object_key(&b).unwrap().unwrap().as_str(), "org1/mp2/1/elA.mp4");
    }

    // ---- Test 22: concurrent puts to different paths do not interfere ----
    #[test]
    fn concurrent_puts() {
        let h = harness();
        let store = Arc::new(h.store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let src = h
                    .fetcher
                    .source(&format!("https://staging.example.org/f{i}.mp4"), format!("{i}").as_bytes());
                thread::spawn(move || {
                    let p = path("mp1", 1, &format!("el{i}"));
                    store.put(&p, &src).unwrap();
                    p
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let p = handle.join().unwrap();
            assert_eq!(read(&store, &p).unwrap(), format!("{i}").as_bytes());
        }
        assert_eq!(h.backend.writes(), 8);
    }
}
