//! Storage classes and cold-tier restore state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_types::ObjectVersion;

use crate::error::BackendError;

/// Storage class of a remote object, named as the object-storage service
/// names them.
///
/// Classes the service reports but this crate does not know are kept as
/// [`StorageClass::Other`]; they are never treated as frozen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    GlacierIr,
    Glacier,
    DeepArchive,
    Other(String),
}

impl StorageClass {
    /// Every class a storage-class change may target.
    pub const KNOWN: [StorageClass; 8] = [
        Self::Standard,
        Self::ReducedRedundancy,
        Self::StandardIa,
        Self::OnezoneIa,
        Self::IntelligentTiering,
        Self::GlacierIr,
        Self::Glacier,
        Self::DeepArchive,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Standard => "STANDARD",
            Self::ReducedRedundancy => "REDUCED_REDUNDANCY",
            Self::StandardIa => "STANDARD_IA",
            Self::OnezoneIa => "ONEZONE_IA",
            Self::IntelligentTiering => "INTELLIGENT_TIERING",
            Self::GlacierIr => "GLACIER_IR",
            Self::Glacier => "GLACIER",
            Self::DeepArchive => "DEEP_ARCHIVE",
            Self::Other(name) => name.as_str(),
        }
    }

    /// The class a service response names. Unknown names are kept verbatim.
    pub fn from_service(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| Self::Other(name.trim().to_string()))
    }

    /// Classes whose objects must be restored before they can be read.
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Glacier | Self::DeepArchive)
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the known classes only, case-insensitively and with `-` for `_`.
impl FromStr for StorageClass {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::KNOWN
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| BackendError::Config(format!("unknown storage class {s:?}")))
    }
}

impl From<String> for StorageClass {
    fn from(name: String) -> Self {
        Self::from_service(&name)
    }
}

impl From<StorageClass> for String {
    fn from(class: StorageClass) -> Self {
        class.as_str().to_string()
    }
}

/// Where an object ended up after a storage-class change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassChange {
    /// The class the object is in now; the old class when the move was
    /// refused.
    pub class: StorageClass,
    /// The object version holding the bytes now. Differs from the version
    /// that was moved when the service rewrote the object as a new version.
    pub version: Option<ObjectVersion>,
}

/// Restore state of an object in a frozen storage class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreStatus {
    /// No restore has been requested, or the last one has expired.
    None,
    /// A restore is in progress.
    Restoring,
    /// A restored copy is readable until `expires`.
    Restored { expires: DateTime<Utc> },
}

impl RestoreStatus {
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }

    /// Parse the service's `x-amz-restore` header value, e.g.
    /// `ongoing-request="false", expiry-date="Sun, 23 Dec 2012 00:00:00 GMT"`.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::None;
        };
        if value.contains("ongoing-request=\"true\"") {
            return Self::Restoring;
        }
        let expires = value
            .split_once("expiry-date=\"")
            .and_then(|(_, rest)| rest.split('"').next())
            .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
            .map(|d| d.with_timezone(&Utc));
        match expires {
            Some(expires) => Self::Restored { expires },
            None => Self::None,
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Restoring => f.write_str("restoring"),
            Self::Restored { expires } => write!(f, "restored until {}", expires.to_rfc3339()),
        }
    }
}
