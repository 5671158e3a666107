//! Foundation types for strata, the versioned element store.
//!
//! Every other strata crate depends on `strata-types`. The types here are
//! plain values: they carry no storage state and perform no I/O.
//!
//! # Key Types
//!
//! - [`StoragePath`]: identity of one stored element version
//!   (organization, media package, version, element)
//! - [`DeletionSelector`]: scope of a delete: one version or all versions of
//!   a media package
//! - [`Source`]: where the bytes of a new element are fetched from
//! - [`ObjectKey`] / [`ObjectVersion`] / [`ObjectLocator`]: names of
//!   physical objects inside a backend

pub mod error;
pub mod names;
pub mod object;
pub mod path;
pub mod selector;
pub mod source;

pub use error::TypeError;
pub use names::{validate_extension, validate_segment};
pub use object::{ObjectKey, ObjectLocator, ObjectVersion};
pub use path::{StoragePath, Version};
pub use selector::DeletionSelector;
pub use source::{MimeType, Source};
