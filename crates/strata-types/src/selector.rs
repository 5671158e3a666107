use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::names::validate_segment;
use crate::path::{StoragePath, Version};

/// Scope of a delete: one version of a media package, or all of its versions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionSelector {
    organization_id: String,
    media_package_id: String,
    version: Option<Version>,
}

impl DeletionSelector {
    /// Select a single version of a media package.
    pub fn version(
        organization_id: impl Into<String>,
        media_package_id: impl Into<String>,
        version: impl Into<Version>,
    ) -> Result<Self, TypeError> {
        Self::build(organization_id.into(), media_package_id.into(), Some(version.into()))
    }

    /// Select every version of a media package.
    pub fn all_versions(
        organization_id: impl Into<String>,
        media_package_id: impl Into<String>,
    ) -> Result<Self, TypeError> {
        Self::build(organization_id.into(), media_package_id.into(), None)
    }

    fn build(
        organization_id: String,
        media_package_id: String,
        version: Option<Version>,
    ) -> Result<Self, TypeError> {
        validate_segment("organization", &organization_id)?;
        validate_segment("media package", &media_package_id)?;
        Ok(Self {
            organization_id,
            media_package_id,
            version,
        })
    }

    /// The selector covering exactly the version `path` lives in.
    pub fn for_path(path: &StoragePath) -> Self {
        Self {
            organization_id: path.organization_id().to_string(),
            media_package_id: path.media_package_id().to_string(),
            version: Some(path.version()),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn media_package_id(&self) -> &str {
        &self.media_package_id
    }

    /// `None` means all versions.
    pub fn selected_version(&self) -> Option<Version> {
        self.version
    }

    /// Returns `true` if `path` falls inside this selector's scope.
    pub fn matches(&self, path: &StoragePath) -> bool {
        path.organization_id() == self.organization_id
            && path.media_package_id() == self.media_package_id
            && self.version.map_or(true, |v| v == path.version())
    }
}

impl fmt::Display for DeletionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}/{}/{}", self.organization_id, self.media_package_id, v),
            None => write!(f, "{}/{}/*", self.organization_id, self.media_package_id),
        }
    }
}

impl FromStr for DeletionSelector {
    type Err = TypeError;

    /// Parse `org/mediapackage/version`, or `org/mediapackage[/*]` for every
    /// version.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [org, mp] | [org, mp, "*"] => Self::all_versions(*org, *mp),
            [org, mp, version] => Self::version(*org, *mp, version.parse::<Version>()?),
            _ => Err(TypeError::InvalidIdentifier {
                field: "deletion selector",
                value: s.to_string(),
                reason: "expected org/mediapackage[/version]".into(),
            }),
        }
    }
}
