//! Row and outcome types of the mapping store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_types::{ObjectKey, ObjectLocator, ObjectVersion, StoragePath};

/// One row of the mapping table.
///
/// A row is active while `deleted_at` is `None`. Soft-deleted rows are kept
/// until the same storage path is stored again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalObjectMapping {
    pub storage_path: StoragePath,
    pub object_key: ObjectKey,
    pub object_version: Option<ObjectVersion>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PhysicalObjectMapping {
    /// The physical object this row references.
    pub fn locator(&self) -> ObjectLocator {
        ObjectLocator::new(self.object_key.clone(), self.object_version.clone())
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Result of releasing a group of rows that share one physical object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// These were the last references: the object was reclaimed and every
    /// row soft-deleted.
    Reclaimed { rows: Vec<StoragePath> },
    /// Other references survive; only these rows were soft-deleted.
    Released {
        rows: Vec<StoragePath>,
        remaining: usize,
    },
    /// The physical reclaim failed; no row was touched.
    ReclaimFailed { rows: Vec<StoragePath> },
    /// None of the requested rows still referenced the object.
    Nothing,
}

impl ReleaseOutcome {
    /// Rows soft-deleted by this release.
    pub fn released_rows(&self) -> &[StoragePath] {
        match self {
            Self::Reclaimed { rows } | Self::Released { rows, .. } => rows,
            Self::ReclaimFailed { .. } | Self::Nothing => &[],
        }
    }
}

/// Result of an ingest attempt on one object key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The write succeeded and the mapping row is active.
    Stored(PhysicalObjectMapping),
    /// The key is referenced by other paths and an exclusive ingest was
    /// requested; nothing was written.
    Occupied { holders: usize },
    /// The write callback failed; no mapping was created or changed.
    Aborted,
}
