//! The [`MappingStore`] trait defining the mapping table interface.

use strata_types::{DeletionSelector, ObjectKey, ObjectLocator, ObjectVersion, StoragePath};

use crate::error::MappingResult;
use crate::types::{IngestOutcome, PhysicalObjectMapping, ReleaseOutcome};

/// Physical write run inside [`MappingStore::ingest`].
///
/// Returns `Some(version)` on success (`Some(None)` for backends without
/// object versions) and `None` on failure. The caller keeps the error.
pub type WriteFn<'a> = dyn FnMut() -> Option<Option<ObjectVersion>> + 'a;

/// Physical reclaim run inside [`MappingStore::release`]. Returns `true` once
/// the object is gone from the backend.
pub type ReclaimFn<'a> = dyn FnMut(&ObjectLocator) -> bool + 'a;

/// Physical move run inside [`MappingStore::relocate`]. Returns where the
/// object lives afterwards, or `None` on failure.
pub type MoveFn<'a> = dyn FnMut(&ObjectLocator) -> Option<ObjectLocator> + 'a;

/// Storage backend for the path-to-object mapping table.
///
/// Implementations must be thread-safe (`Send + Sync`). Lookups only ever
/// return active rows. Single-row operations are atomic; multi-row lookups are
/// point-in-time reads.
pub trait MappingStore: Send + Sync {
    /// Look up the active row for exactly `path`.
    fn find_mapping(&self, path: &StoragePath) -> MappingResult<Option<PhysicalObjectMapping>>;

    /// All active rows sharing an object key, any object version.
    fn find_mappings_by_key(&self, key: &ObjectKey) -> MappingResult<Vec<PhysicalObjectMapping>>;

    /// All active rows referencing one physical object.
    fn find_mappings_by_locator(
        &self,
        locator: &ObjectLocator,
    ) -> MappingResult<Vec<PhysicalObjectMapping>>;

    /// All active rows inside a deletion selector's scope.
    fn find_mappings_by_selector(
        &self,
        selector: &DeletionSelector,
    ) -> MappingResult<Vec<PhysicalObjectMapping>>;

    /// Upsert the row for `path`, replacing any prior (possibly
    /// soft-deleted) row for that exact path.
    fn store_mapping(
        &self,
        path: &StoragePath,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> MappingResult<PhysicalObjectMapping>;

    /// Soft-delete the row for `path`. Returns `false` if there was no active
    /// row.
    fn mark_deleted(&self, path: &StoragePath) -> MappingResult<bool>;

    /// Number of active rows referencing `locator`.
    fn reference_count(&self, locator: &ObjectLocator) -> MappingResult<usize>;

    /// Write an object and record its mapping as one critical section on
    /// `key`.
    ///
    /// With `exclusive` set, the write is refused with
    /// [`IngestOutcome::Occupied`] when paths other than `path` still
    /// reference `key`; the bytes they share are never overwritten.
    fn ingest(
        &self,
        path: &StoragePath,
        key: &ObjectKey,
        exclusive: bool,
        write: &mut WriteFn<'_>,
    ) -> MappingResult<IngestOutcome>;

    /// Point `to` at the object `from` references, atomically with respect
    /// to releases of that object. Returns `None` if `from` has no active row.
    fn copy_mapping(
        &self,
        from: &StoragePath,
        to: &StoragePath,
    ) -> MappingResult<Option<PhysicalObjectMapping>>;

    /// Drop the references `paths` hold on `locator`.
    ///
    /// If no other active row references the object, `reclaim` is called
    /// while the key is locked and the rows are soft-deleted only after it
    /// succeeds. Otherwise the rows are soft-deleted and the object is left
    /// alone.
    fn release(
        &self,
        locator: &ObjectLocator,
        paths: &[StoragePath],
        reclaim: &mut ReclaimFn<'_>,
    ) -> MappingResult<ReleaseOutcome>;

    /// Run `reclaim` on `locator` if no active row references it any more.
    ///
    /// Used after a path was re-pointed away from an object. Returns `true`
    /// if the reclaim ran and succeeded.
    fn reclaim_unreferenced(
        &self,
        locator: &ObjectLocator,
        reclaim: &mut ReclaimFn<'_>,
    ) -> MappingResult<bool>;

    /// Move an object and every active row referencing it.
    ///
    /// `relocate` runs while `from.key` is locked and only if some active row
    /// references `from`; the rows are re-pointed at the locator it returns,
    /// which must share `from`'s key. Returns that locator, or `None` when
    /// nothing referenced `from` or the move failed.
    fn relocate(
        &self,
        from: &ObjectLocator,
        relocate: &mut MoveFn<'_>,
    ) -> MappingResult<Option<ObjectLocator>>;

    /// Returns `true` if `path` has an active row.
    fn contains(&self, path: &StoragePath) -> MappingResult<bool> {
        Ok(self.find_mapping(path)?.is_some())
    }
}
