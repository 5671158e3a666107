//! Mapping store for strata.
//!
//! The mapping store is a transactional table from [`StoragePath`] to the
//! physical object that holds its bytes. It is the single source of truth
//! for reference counting: every active row pointing at the same
//! [`ObjectLocator`] is one reference to that physical object.
//!
//! # Architecture
//!
//! - Rows are soft-deleted: `deleted_at` is set, the row is kept for audit
//!   and only replaced when the same path is stored again.
//! - Reference counts are the number of active rows per locator and are
//!   maintained together with the rows, never recomputed from scans.
//! - Operations that create, move or drop references to an object key
//!   (`ingest`, `store_mapping`, `copy_mapping`, `relocate`, `release`)
//!   serialize on a per-key lock
//!   stripe. `release` runs the physical reclaim inside that critical
//!   section, so a copy can never link to bytes that are being deleted.
//!
//! # Modules
//!
//! - [`error`]: [`MappingStoreError`]
//! - [`types`]: [`PhysicalObjectMapping`], [`ReleaseOutcome`], [`IngestOutcome`]
//! - [`traits`]: the [`MappingStore`] trait
//! - [`table`]: [`MappingTable`], in-memory or journal-backed
//! - [`journal`]: the write-ahead journal behind durable tables
//!
//! [`StoragePath`]: strata_types::StoragePath
//! [`ObjectLocator`]: strata_types::ObjectLocator

pub mod error;
pub mod journal;
mod locks;
pub mod table;
pub mod traits;
pub mod types;

pub use error::{MappingResult, MappingStoreError};
pub use journal::{JournalConfig, SyncMode};
pub use table::MappingTable;
pub use traits::{MappingStore, MoveFn, ReclaimFn, WriteFn};
pub use types::{IngestOutcome, PhysicalObjectMapping, ReleaseOutcome};
