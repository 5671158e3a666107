use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::names::{validate_extension, validate_segment};
use crate::path::StoragePath;

/// Structural name of a physical object: `org/mediapackage/version/element[.ext]`.
///
/// Keys are derived from a [`StoragePath`], never from content. Several
/// storage paths may refer to the same key after a copy. A generation key
/// (`element~n[.ext]`) is used when a re-put must not overwrite bytes that
/// other paths still share.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Derive the key for `path`, using `extension` when given.
    pub fn derive(path: &StoragePath, extension: Option<&str>) -> Self {
        Self::derive_generation(path, extension, 0)
    }

    /// Derive the `generation`-th key for `path`. Generation 0 is the plain
    /// structural key.
    pub fn derive_generation(path: &StoragePath, extension: Option<&str>, generation: u32) -> Self {
        let mut key = format!(
            "{}/{}/{}/{}",
            path.organization_id(),
            path.media_package_id(),
            path.version(),
            path.element_id()
        );
        if generation > 0 {
            key.push_str(&format!("~{generation}"));
        }
        if let Some(ext) = extension {
            key.push('.');
            key.push_str(ext);
        }
        Self(key)
    }

    /// Parse and validate a key read back from storage or user input.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason: String| TypeError::InvalidObjectKey {
            key: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.split('/').collect();
        let [org, mp, version, file] = parts.as_slice() else {
            return Err(invalid("expected org/mediapackage/version/element[.ext]".into()));
        };
        validate_segment("organization", org).map_err(|e| invalid(e.to_string()))?;
        validate_segment("media package", mp).map_err(|e| invalid(e.to_string()))?;
        version
            .parse::<u64>()
            .map_err(|_| invalid(format!("version segment {version:?} is not a number")))?;

        let (element, generation) = match file.split_once('~') {
            Some((element, rest)) => (element, Some(rest)),
            None => (*file, None),
        };
        let element = match generation {
            // The extension, if any, follows the generation number.
            Some(rest) => {
                let (number, ext) = match rest.split_once('.') {
                    Some((n, ext)) => (n, Some(ext)),
                    None => (rest, None),
                };
                number
                    .parse::<u32>()
                    .map_err(|_| invalid(format!("bad generation {number:?}")))?;
                if let Some(ext) = ext {
                    validate_extension(ext).map_err(|e| invalid(e.to_string()))?;
                }
                element
            }
            None => element,
        };
        if element.is_empty() || element.starts_with('.') || element.contains(['\\', '\0']) {
            return Err(invalid(format!("bad element segment {file:?}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The organization segment, used to choose a bucket.
    pub fn organization_id(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// Text after the last `.` of the file segment, when it is a valid
    /// extension. Element ids may contain dots, so this is a naming hint only.
    pub fn extension(&self) -> Option<&str> {
        let file = self.0.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        validate_extension(ext).ok().map(|()| ext)
    }

    /// The `/`-separated segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

/// Opaque, backend-assigned version token of a physical object.
///
/// Only backends that version objects internally (remote object storage
/// with bucket versioning) hand these out.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical object: a key plus, for versioning backends, a version.
///
/// All active mappings that share a locator form one reference-counting
/// equivalence class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub key: ObjectKey,
    pub version: Option<ObjectVersion>,
}

impl ObjectLocator {
    pub fn new(key: ObjectKey, version: Option<ObjectVersion>) -> Self {
        Self { key, version }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.key, v),
            None => write!(f, "{}", self.key),
        }
    }
}
