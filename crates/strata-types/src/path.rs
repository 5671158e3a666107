use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::names::{validate_extension, validate_segment};

/// Version number of a media package snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| TypeError::InvalidVersion(s.to_string()))
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identity of one stored element: `{organization, media package, version, element}`.
///
/// Two paths are equal iff all four identity fields match. The optional
/// extension hint is carried along for key derivation but takes no part in
/// equality, hashing or ordering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoragePath {
    organization_id: String,
    media_package_id: String,
    version: Version,
    element_id: String,
    #[serde(default)]
    extension: Option<String>,
}

impl StoragePath {
    /// Build a validated storage path.
    pub fn new(
        organization_id: impl Into<String>,
        media_package_id: impl Into<String>,
        version: impl Into<Version>,
        element_id: impl Into<String>,
    ) -> Result<Self, TypeError> {
        let organization_id = organization_id.into();
        let media_package_id = media_package_id.into();
        let element_id = element_id.into();
        validate_segment("organization", &organization_id)?;
        validate_segment("media package", &media_package_id)?;
        validate_segment("element", &element_id)?;
        Ok(Self {
            organization_id,
            media_package_id,
            version: version.into(),
            element_id,
            extension: None,
        })
    }

    /// Attach a file-extension hint (without the leading dot).
    pub fn with_extension(mut self, ext: impl Into<String>) -> Result<Self, TypeError> {
        let ext = ext.into();
        validate_extension(&ext)?;
        self.extension = Some(ext);
        Ok(self)
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn media_package_id(&self) -> &str {
        &self.media_package_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// The same element in another version of its media package.
    pub fn at_version(&self, version: impl Into<Version>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }

    fn identity(&self) -> (&str, &str, Version, &str) {
        (
            &self.organization_id,
            &self.media_package_id,
            self.version,
            &self.element_id,
        )
    }
}

impl PartialEq for StoragePath {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for StoragePath {}

impl Hash for StoragePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for StoragePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoragePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.organization_id, self.media_package_id, self.version, self.element_id
        )
    }
}

impl FromStr for StoragePath {
    type Err = TypeError;

    /// Parse `org/mediapackage/version/element`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [org, mp, version, element] => Self::new(*org, *mp, version.parse::<Version>()?, *element),
            _ => Err(TypeError::InvalidIdentifier {
                field: "storage path",
                value: s.to_string(),
                reason: "expected org/mediapackage/version/element".into(),
            }),
        }
    }
}
