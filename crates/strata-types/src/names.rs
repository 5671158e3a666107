//! Identifier validation for path segments and file extensions.
//!
//! Organization, media package and element identifiers become directory and
//! file names in the filesystem backend and key segments in remote object
//! storage, so they are restricted to names that are safe in both:
//!
//! - Must be non-empty and at most 255 bytes
//! - Must not contain `/`, `\`, `~`, NUL, or any whitespace/control character
//! - Must not be `.` or `..`, and must not start with `.`
//!
//! `~` is reserved: the element store uses it to mark generation keys.

use crate::error::TypeError;

/// Maximum length of a single identifier, matching common filesystem limits.
pub const MAX_SEGMENT_LEN: usize = 255;

/// Characters that are forbidden anywhere in an identifier.
const FORBIDDEN_CHARS: &[char] = &['/', '\\', '~', '\0'];

/// Validate an identifier used as one segment of a storage path.
///
/// `field` names the identifier in the returned error.
///
/// # Examples
///
/// ```
/// use strata_types::names::validate_segment;
///
/// assert!(validate_segment("organization", "mh_default_org").is_ok());
/// assert!(validate_segment("element", "3f0a-catalog").is_ok());
/// assert!(validate_segment("element", "").is_err());
/// assert!(validate_segment("element", "../etc").is_err());
/// ```
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), TypeError> {
    let fail = |reason: &str| TypeError::InvalidIdentifier {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(fail("must not be empty"));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(fail("must be at most 255 bytes"));
    }
    if let Some(ch) = value.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(fail(&format!("contains forbidden character {ch:?}")));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(fail("must not contain whitespace or control characters"));
    }
    if value.starts_with('.') {
        return Err(fail("must not start with '.'"));
    }
    Ok(())
}

/// Validate a file-extension hint (without the leading dot).
///
/// Extensions are ASCII alphanumerics plus `-` and `_`, at most 32 bytes.
pub fn validate_extension(ext: &str) -> Result<(), TypeError> {
    let valid = !ext.is_empty()
        && ext.len() <= 32
        && ext
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TypeError::InvalidExtension(ext.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_typical_identifiers() {
        assert!(validate_segment("organization", "mh_default_org").is_ok());
        assert!(validate_segment("mediapackage", "10e2e5e3-4d8a-4c6f-9b7e-1c2f2a1d8e44").is_ok());
        assert!(validate_segment("element", "track-1.presenter").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_segment("element", "").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_segment("element", "..").is_err());
        assert!(validate_segment("element", ".").is_err());
        assert!(validate_segment("element", ".hidden").is_err());
        assert!(validate_segment("element", "a/b").is_err());
        assert!(validate_segment("element", "a\\b").is_err());
    }

    #[test]
    fn rejects_reserved_tilde() {
        let err = validate_segment("element", "track~1").unwrap_err();
        assert!(matches!(err, TypeError::InvalidIdentifier { field: "element", .. }));
    }

    #[test]
    fn rejects_whitespace() {
        assert!(validate_segment("element", "has space").is_err());
        assert!(validate_segment("element", "tab\there").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let long = "a".repeat(MAX_SEGMENT_LEN + 1);
        assert!(validate_segment("element", &long).is_err());
        assert!(validate_segment("element", &long[1..]).is_ok());
    }

    #[test]
    fn extensions() {
        assert!(validate_extension("mp4").is_ok());
        assert!(validate_extension("tar_gz").is_ok());
        assert!(validate_extension("").is_err());
        assert!(validate_extension("a.b").is_err());
        assert!(validate_extension("a/b").is_err());
    }

    proptest! {
        #[test]
        fn valid_segments_never_contain_separators(s in "\\PC{0,40}") {
            if validate_segment("element", &s).is_ok() {
                prop_assert!(!s.contains('/'));
                prop_assert!(!s.contains('\\'));
                prop_assert!(!s.starts_with('.'));
                prop_assert!(!s.is_empty());
            }
        }
    }
}
