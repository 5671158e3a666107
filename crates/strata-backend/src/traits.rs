//! The [`BackendDriver`] and [`TieredStorage`] traits.

use std::io::Read;

use strata_types::{MimeType, ObjectKey, ObjectVersion};

use crate::error::BackendResult;
use crate::tier::{ClassChange, RestoreStatus, StorageClass};

/// Physical byte storage addressed by object key.
///
/// Implementations must be thread-safe (`Send + Sync`); every call blocks on
/// disk or network I/O. `version` arguments are only meaningful where the
/// driver reports [`versions_objects`](BackendDriver::versions_objects);
/// elsewhere they are ignored.
pub trait BackendDriver: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &str;

    /// Store the bytes read from `data` under `key`, replacing any current
    /// object with that key. Returns the version the backend assigned, if it
    /// versions objects.
    fn write(
        &self,
        key: &ObjectKey,
        data: &mut dyn Read,
        mime_type: Option<&MimeType>,
    ) -> BackendResult<Option<ObjectVersion>>;

    /// Open the object for reading. `None` if it does not exist.
    fn read(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>>;

    fn exists(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool>;

    /// Remove the object. Returns `false` if it was already absent.
    fn delete(&self, key: &ObjectKey, version: Option<&ObjectVersion>) -> BackendResult<bool>;

    /// Make `to` a physical alias of `from` without copying bytes. Returns
    /// `false` when the driver does not link; callers then share `from`'s
    /// object through the mapping table alone.
    fn link(&self, _from: &ObjectKey, _to: &ObjectKey) -> BackendResult<bool> {
        Ok(false)
    }

    /// Whether a `write` to `key` keeps the objects already stored under it
    /// as separate versions. Drivers that cannot tell for sure answer
    /// `false`.
    fn versions_objects(&self, _key: &ObjectKey) -> BackendResult<bool> {
        Ok(false)
    }

    /// Bytes used by stored objects, if the driver can tell.
    fn used_space(&self) -> Option<u64> {
        None
    }

    /// Bytes still available for new objects, if the driver can tell.
    fn usable_space(&self) -> Option<u64> {
        None
    }

    /// Total capacity, if the driver can tell.
    fn total_space(&self) -> Option<u64> {
        None
    }

    /// Storage-class operations, for drivers with tiered storage.
    fn tiering(&self) -> Option<&dyn TieredStorage> {
        None
    }
}

/// Storage-class management for drivers backed by tiered object storage.
///
/// Operations address one object version (`None` for the current object)
/// and return `None` (or `false`) when there is no such object.
pub trait TieredStorage: Send + Sync {
    fn storage_class(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<StorageClass>>;

    /// Move the object to `target`.
    ///
    /// The returned [`ClassChange`] names the class the object ends up in
    /// (the current one when the move is not allowed) and the version now
    /// holding it. When that version differs from `version`, the old one is
    /// left in place for the caller to remove once nothing refers to it.
    fn modify_storage_class(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
        target: &StorageClass,
    ) -> BackendResult<Option<ClassChange>>;

    fn restore_status(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<RestoreStatus>>;

    /// Ask for a readable copy of a frozen object for `days` days. A no-op
    /// when a restore is already running.
    fn initiate_restore(
        &self,
        key: &ObjectKey,
        version: Option<&ObjectVersion>,
        days: u32,
    ) -> BackendResult<bool>;
}
