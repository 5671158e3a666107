//! The mapping table: in-memory rows with secondary indexes, optionally
//! backed by a [`Journal`].

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use strata_types::{DeletionSelector, ObjectKey, ObjectLocator, ObjectVersion, StoragePath};
use tracing::{debug, info};

use crate::error::{MappingResult, MappingStoreError};
use crate::journal::{Journal, JournalConfig, MappingOp};
use crate::locks::KeyLocks;
use crate::traits::{MappingStore, MoveFn, ReclaimFn, WriteFn};
use crate::types::{IngestOutcome, PhysicalObjectMapping, ReleaseOutcome};

type PackageId = (String, String);

/// Rows plus indexes over the active subset.
#[derive(Default)]
struct TableState {
    rows: HashMap<StoragePath, PhysicalObjectMapping>,
    by_locator: HashMap<ObjectLocator, BTreeSet<StoragePath>>,
    by_key: HashMap<ObjectKey, BTreeSet<StoragePath>>,
    by_package: HashMap<PackageId, BTreeSet<StoragePath>>,
}

fn package_of(path: &StoragePath) -> PackageId {
    (
        path.organization_id().to_string(),
        path.media_package_id().to_string(),
    )
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<StoragePath>>,
    k: &K,
    path: &StoragePath,
) {
    if let Some(set) = index.get_mut(k) {
        set.remove(path);
        if set.is_empty() {
            index.remove(k);
        }
    }
}

impl TableState {
    fn active(&self, path: &StoragePath) -> Option<&PhysicalObjectMapping> {
        self.rows.get(path).filter(|r| r.is_active())
    }

    fn index(&mut self, row: &PhysicalObjectMapping) {
        let path = &row.storage_path;
        self.by_locator
            .entry(row.locator())
            .or_default()
            .insert(path.clone());
        self.by_key
            .entry(row.object_key.clone())
            .or_default()
            .insert(path.clone());
        self.by_package
            .entry(package_of(path))
            .or_default()
            .insert(path.clone());
    }

    fn unindex(&mut self, row: &PhysicalObjectMapping) {
        let path = &row.storage_path;
        remove_from(&mut self.by_locator, &row.locator(), path);
        remove_from(&mut self.by_key, &row.object_key, path);
        remove_from(&mut self.by_package, &package_of(path), path);
    }

    /// Apply one operation. Returns the row it produced or changed.
    fn apply(&mut self, op: &MappingOp) -> Option<PhysicalObjectMapping> {
        match op {
            MappingOp::Store {
                path,
                key,
                version,
                at,
            } => {
                if let Some(old) = self.active(path).cloned() {
                    self.unindex(&old);
                }
                let row = PhysicalObjectMapping {
                    storage_path: path.clone(),
                    object_key: key.clone(),
                    object_version: version.clone(),
                    created_at: *at,
                    deleted_at: None,
                };
                self.index(&row);
                self.rows.insert(path.clone(), row.clone());
                Some(row)
            }
            MappingOp::MarkDeleted { path, at } => {
                let old = self.active(path).cloned()?;
                self.unindex(&old);
                let row = self.rows.get_mut(path)?;
                row.deleted_at = Some(*at);
                Some(row.clone())
            }
        }
    }

    fn collect<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a StoragePath>,
    ) -> Vec<PhysicalObjectMapping> {
        paths
            .into_iter()
            .filter_map(|p| self.active(p).cloned())
            .collect()
    }

    /// Operations that rebuild the current table, soft-deleted rows included.
    fn snapshot(&self) -> Vec<MappingOp> {
        let mut rows: Vec<&PhysicalObjectMapping> = self.rows.values().collect();
        rows.sort_by(|a, b| a.storage_path.cmp(&b.storage_path));
        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            ops.push(MappingOp::Store {
                path: row.storage_path.clone(),
                key: row.object_key.clone(),
                version: row.object_version.clone(),
                at: row.created_at,
            });
            if let Some(at) = row.deleted_at {
                ops.push(MappingOp::MarkDeleted {
                    path: row.storage_path.clone(),
                    at,
                });
            }
        }
        ops
    }
}

/// The mapping table.
///
/// Created either purely in memory ([`MappingTable::in_memory`]) or on top of
/// a journal file ([`MappingTable::open`]). A durable table appends every
/// mutation to the journal before applying it, so a mutation that fails to
/// reach the journal never becomes visible.
pub struct MappingTable {
    state: RwLock<TableState>,
    locks: KeyLocks,
    journal: Option<Journal>,
}

impl MappingTable {
    /// A table that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            locks: KeyLocks::new(),
            journal: None,
        }
    }

    /// Open a durable table, replaying the journal at `path`.
    pub fn open(path: &Path, config: JournalConfig) -> MappingResult<Self> {
        let (journal, ops) = Journal::open(path, config)?;
        let mut state = TableState::default();
        for op in &ops {
            state.apply(op);
        }
        info!(
            journal = %path.display(),
            rows = state.rows.len(),
            active = state.by_package.values().map(BTreeSet::len).sum::<usize>(),
            "mapping table loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
            locks: KeyLocks::new(),
            journal: Some(journal),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    /// Number of active rows.
    pub fn active_rows(&self) -> MappingResult<usize> {
        Ok(self.read()?.by_package.values().map(BTreeSet::len).sum())
    }

    /// Number of rows, soft-deleted ones included.
    pub fn total_rows(&self) -> MappingResult<usize> {
        Ok(self.read()?.rows.len())
    }

    /// Rewrite the journal as a snapshot of the current rows. No-op for
    /// in-memory tables.
    pub fn compact(&self) -> MappingResult<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let state = self.write()?;
        journal.rewrite(&state.snapshot())
    }

    fn read(&self) -> MappingResult<RwLockReadGuard<'_, TableState>> {
        self.state
            .read()
            .map_err(|_| MappingStoreError::Unavailable("mapping table lock poisoned".into()))
    }

    fn write(&self) -> MappingResult<RwLockWriteGuard<'_, TableState>> {
        self.state
            .write()
            .map_err(|_| MappingStoreError::Unavailable("mapping table lock poisoned".into()))
    }

    fn commit(
        &self,
        state: &mut TableState,
        op: MappingOp,
    ) -> MappingResult<Option<PhysicalObjectMapping>> {
        if let Some(journal) = &self.journal {
            journal.append(&op)?;
        }
        Ok(state.apply(&op))
    }

    /// Upsert a row. The caller holds the key's stripe.
    fn store_locked(
        &self,
        path: &StoragePath,
        key: &ObjectKey,
        version: Option<ObjectVersion>,
    ) -> MappingResult<PhysicalObjectMapping> {
        let op = MappingOp::Store {
            path: path.clone(),
            key: key.clone(),
            version,
            at: Utc::now(),
        };
        let mut state = self.write()?;
        self.commit(&mut state, op)?
            .ok_or_else(|| MappingStoreError::Unavailable("store produced no row".into()))
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for MappingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingTable")
            .field("journal", &self.journal.as_ref().map(Journal::path))
            .finish_non_exhaustive()
    }
}

impl MappingStore for MappingTable {
    fn find_mapping(&self, path: &StoragePath) -> MappingResult<Option<PhysicalObjectMapping>> {
        Ok(self.read()?.active(path).cloned())
    }

    fn find_mappings_by_key(&self, key: &ObjectKey) -> MappingResult<Vec<PhysicalObjectMapping>> {
        let state = self.read()?;
        Ok(state
            .by_key
            .get(key)
            .map(|paths| state.collect(paths))
            .unwrap_or_default())
    }

    fn find_mappings_by_locator(
        &self,
        locator: &ObjectLocator,
    ) -> MappingResult<Vec<PhysicalObjectMapping>> {
        let state = self.read()?;
        Ok(state
            .by_locator
            .get(locator)
            .map(|paths| state.collect(paths))
            .unwrap_or_default())
    }

    fn find_mappings_by_selector(
        &self,
        selector: &DeletionSelector,
    ) -> MappingResult<Vec<PhysicalObjectMapping>> {
        let state = self.read()?;
        let package = (
            selector.organization_id().to_string(),
            selector.media_package_id().to_string(),
        );
        Ok(state
            .by_package
            .get(&package)
            .map(|paths| state.collect(paths.iter().filter(|p| selector.matches(p))))
            .unwrap_or_default())
    }

    fn store_mapping(
        &self,
        path: &StoragePath,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> MappingResult<PhysicalObjectMapping> {
        let _guard = self.locks.lock(key)?;
        self.store_locked(path, key, version.cloned())
    }

    fn mark_deleted(&self, path: &StoragePath) -> MappingResult<bool> {
        let mut state = self.write()?;
        if state.active(path).is_none() {
            return Ok(false);
        }
        let op = MappingOp::MarkDeleted {
            path: path.clone(),
            at: Utc::now(),
        };
        Ok(self.commit(&mut state, op)?.is_some())
    }

    fn reference_count(&self, locator: &ObjectLocator) -> MappingResult<usize> {
        Ok(self.read()?.by_locator.get(locator).map_or(0, BTreeSet::len))
    }

    fn ingest(
        &self,
        path: &StoragePath,
        key: &ObjectKey,
        exclusive: bool,
        write: &mut WriteFn<'_>,
    ) -> MappingResult<IngestOutcome> {
        let _guard = self.locks.lock(key)?;
        if exclusive {
            let holders = self
                .read()?
                .by_key
                .get(key)
                .map_or(0, |paths| paths.iter().filter(|p| *p != path).count());
            if holders > 0 {
                debug!(%key, holders, "object key occupied");
                return Ok(IngestOutcome::Occupied { holders });
            }
        }
        let Some(version) = write() else {
            return Ok(IngestOutcome::Aborted);
        };
        let row = self.store_locked(path, key, version)?;
        Ok(IngestOutcome::Stored(row))
    }

    fn copy_mapping(
        &self,
        from: &StoragePath,
        to: &StoragePath,
    ) -> MappingResult<Option<PhysicalObjectMapping>> {
        loop {
            let Some(source) = self.find_mapping(from)? else {
                return Ok(None);
            };
            let _guard = self.locks.lock(&source.object_key)?;
            let mut state = self.write()?;
            let unchanged = state
                .active(from)
                .map(|current| current.locator() == source.locator());
            match unchanged {
                Some(true) => {
                    let op = MappingOp::Store {
                        path: to.clone(),
                        key: source.object_key,
                        version: source.object_version,
                        at: Utc::now(),
                    };
                    return self.commit(&mut state, op);
                }
                // Re-pointed since the lookup; retry under the new key's stripe.
                Some(false) => continue,
                None => return Ok(None),
            }
        }
    }

    fn relocate(
        &self,
        from: &ObjectLocator,
        relocate: &mut MoveFn<'_>,
    ) -> MappingResult<Option<ObjectLocator>> {
        let _guard = self.locks.lock(&from.key)?;
        if self.reference_count(from)? == 0 {
            return Ok(None);
        }
        let Some(to) = relocate(from) else {
            return Ok(None);
        };
        if to.key != from.key {
            return Err(MappingStoreError::Relocation {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if to == *from {
            return Ok(Some(to));
        }

        let mut state = self.write()?;
        let rows = state
            .by_locator
            .get(from)
            .map(|paths| state.collect(paths))
            .unwrap_or_default();
        for row in &rows {
            let op = MappingOp::Store {
                path: row.storage_path.clone(),
                key: to.key.clone(),
                version: to.version.clone(),
                at: row.created_at,
            };
            self.commit(&mut state, op)?;
        }
        debug!(%from, %to, rows = rows.len(), "rows relocated");
        Ok(Some(to))
    }

    fn release(
        &self,
        locator: &ObjectLocator,
        paths: &[StoragePath],
        reclaim: &mut ReclaimFn<'_>,
    ) -> MappingResult<ReleaseOutcome> {
        let _guard = self.locks.lock(&locator.key)?;
        let (rows, remaining) = {
            let state = self.read()?;
            let Some(active) = state.by_locator.get(locator) else {
                return Ok(ReleaseOutcome::Nothing);
            };
            let rows: BTreeSet<StoragePath> = paths
                .iter()
                .filter(|p| active.contains(*p))
                .cloned()
                .collect();
            let remaining = active.len() - rows.len();
            (rows, remaining)
        };
        if rows.is_empty() {
            return Ok(ReleaseOutcome::Nothing);
        }

        if remaining == 0 && !reclaim(locator) {
            return Ok(ReleaseOutcome::ReclaimFailed {
                rows: rows.into_iter().collect(),
            });
        }

        let mut state = self.write()?;
        let mut released = Vec::with_capacity(rows.len());
        for path in rows {
            // A concurrent put may have re-pointed the path at another key.
            if state.active(&path).map(PhysicalObjectMapping::locator).as_ref() != Some(locator) {
                continue;
            }
            let op = MappingOp::MarkDeleted {
                path: path.clone(),
                at: Utc::now(),
            };
            self.commit(&mut state, op)?;
            released.push(path);
        }

        if remaining == 0 {
            Ok(ReleaseOutcome::Reclaimed { rows: released })
        } else {
            Ok(ReleaseOutcome::Released {
                rows: released,
                remaining,
            })
        }
    }

    fn reclaim_unreferenced(
        &self,
        locator: &ObjectLocator,
        reclaim: &mut ReclaimFn<'_>,
    ) -> MappingResult<bool> {
        let _guard = self.locks.lock(&locator.key)?;
        if self.reference_count(locator)? > 0 {
            return Ok(false);
        }
        debug!(%locator, "reclaiming unreferenced object");
        Ok(reclaim(locator))
    }
}
