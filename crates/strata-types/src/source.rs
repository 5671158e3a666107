use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TypeError;
use crate::names::validate_extension;

/// A `type/subtype` media type, e.g. `video/mp4`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MimeType {
    kind: String,
    subtype: String,
}

impl MimeType {
    pub fn new(kind: impl Into<String>, subtype: impl Into<String>) -> Result<Self, TypeError> {
        let kind = kind.into().to_ascii_lowercase();
        let subtype = subtype.into().to_ascii_lowercase();
        let token = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
        };
        if !token(&kind) || !token(&subtype) {
            return Err(TypeError::InvalidMimeType(format!("{kind}/{subtype}")));
        }
        Ok(Self { kind, subtype })
    }

    /// The top-level type (`video` in `video/mp4`).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Returns `true` for audio, image and video content.
    pub fn is_media(&self) -> bool {
        matches!(self.kind.as_str(), "audio" | "image" | "video")
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)
    }
}

impl FromStr for MimeType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameters such as `; charset=utf-8` are not part of the identity.
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.split_once('/') {
            Some((kind, subtype)) => Self::new(kind, subtype),
            None => Err(TypeError::InvalidMimeType(s.to_string())),
        }
    }
}

impl TryFrom<String> for MimeType {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MimeType> for String {
    fn from(m: MimeType) -> Self {
        m.to_string()
    }
}

/// Where the bytes of a new element come from.
///
/// A `Source` is consumed once by `put`. The extension hint is derived from
/// the last segment of the URI path unless set explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    uri: Url,
    extension: Option<String>,
    mime_type: Option<MimeType>,
}

impl Source {
    /// Create a source for a URI, deriving the extension hint from its path.
    pub fn new(uri: Url) -> Self {
        let extension = extension_of(uri.path());
        Self {
            uri,
            extension,
            mime_type: None,
        }
    }

    /// Parse a URI, or treat `input` as a filesystem path when it has no scheme.
    pub fn parse(input: &str) -> Result<Self, TypeError> {
        match Url::parse(input) {
            Ok(uri) if uri.scheme().len() > 1 => Ok(Self::new(uri)),
            // Single-letter schemes are Windows drive letters, not URIs.
            _ => Self::from_path(Path::new(input)),
        }
    }

    /// A `file://` source for a local path. Relative paths are resolved
    /// against the current directory.
    pub fn from_path(path: &Path) -> Result<Self, TypeError> {
        let invalid = |reason: String| TypeError::InvalidUri {
            uri: path.display().to_string(),
            reason,
        };
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| invalid(e.to_string()))?
                .join(path)
        };
        let uri = Url::from_file_path(&absolute)
            .map_err(|()| invalid("not representable as a file uri".into()))?;
        Ok(Self::new(uri))
    }

    /// Override the extension hint.
    pub fn with_extension(mut self, ext: impl Into<String>) -> Result<Self, TypeError> {
        let ext = ext.into();
        validate_extension(&ext)?;
        self.extension = Some(ext);
        Ok(self)
    }

    /// Drop the extension hint; objects are then named without one.
    pub fn without_extension(mut self) -> Self {
        self.extension = None;
        self
    }

    pub fn with_mime_type(mut self, mime: MimeType) -> Self {
        self.mime_type = Some(mime);
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn mime_type(&self) -> Option<&MimeType> {
        self.mime_type.as_ref()
    }
}

/// Extension of the last path segment, if it is a valid extension hint.
fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || validate_extension(ext).is_err() {
        return None;
    }
    Some(ext.to_string())
}
