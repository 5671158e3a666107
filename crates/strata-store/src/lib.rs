//! Element store for strata.
//!
//! The element store is the entry point callers use: it stores, reads,
//! copies and deletes elements by [`StoragePath`](strata_types::StoragePath),
//! sharing physical objects between copies and removing an object only once
//! nothing references it.
//!
//! # Architecture
//!
//! ```text
//! callers ──► ElementStore ──► MappingStore  (references, soft deletes)
//!                  │
//!                  └─────────► BackendDriver (bytes: filesystem or remote)
//! ```
//!
//! # Modules
//!
//! - [`store`]: [`ElementStore`] and [`DeletionReport`]
//! - [`config`]: [`StoreConfig`], TOML configuration
//! - [`fetch`]: [`SourceFetcher`], opening ingest sources
//! - [`error`]: [`StoreError`]

pub mod config;
pub mod error;
pub mod fetch;
pub mod store;

pub use config::{BackendConfig, MappingConfig, RemoteSettings, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use fetch::{SourceFetcher, UriFetcher};
pub use store::{DeletionFailure, DeletionReport, ElementStore, DEFAULT_RESTORE_DAYS};
