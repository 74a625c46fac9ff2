//! Validated array locations.

use std::path::PathBuf;

use derive_more::Display;
use thiserror::Error;

/// An opaque validated location string.
///
/// Two URIs compare equal iff their canonical string forms are equal. Which
/// schemes are actually reachable is decided by the [`Vfs`](crate::vfs::Vfs);
/// a [`Uri`] only guarantees the string is well formed.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub struct Uri(String);

/// An invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI {0}")]
pub struct UriError(String);

impl Uri {
    /// Create a new [`Uri`] from `uri`.
    ///
    /// A trailing `/` is stripped so that equal locations have equal
    /// canonical forms.
    ///
    /// # Errors
    /// Returns [`UriError`] if `uri` is empty, contains a NUL byte, or has an
    /// empty path after its scheme.
    pub fn new(uri: impl Into<String>) -> Result<Self, UriError> {
        let mut uri = uri.into();
        while uri.len() > 1 && uri.ends_with('/') && !uri.ends_with("://") {
            uri.pop();
        }
        if Self::validate(&uri) {
            Ok(Self(uri))
        } else {
            Err(UriError(uri))
        }
    }

    fn validate(uri: &str) -> bool {
        if uri.is_empty() || uri.contains('\0') {
            return false;
        }
        match uri.split_once("://") {
            Some((scheme, path)) => !scheme.is_empty() && !path.is_empty(),
            None => true,
        }
    }

    /// Extracts a string slice of the canonical form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URI scheme, or `"file"` for bare paths.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map_or("file", |(scheme, _)| scheme)
    }

    /// The path portion after the scheme separator.
    #[must_use]
    pub fn path(&self) -> &str {
        self.0.split_once("://").map_or(self.0.as_str(), |(_, path)| path)
    }

    /// Append a path component.
    #[must_use]
    pub fn join(&self, name: &str) -> Uri {
        Uri(format!("{}/{name}", self.0))
    }

    /// The last path component.
    #[must_use]
    pub fn last_path_part(&self) -> &str {
        self.path().trim_end_matches('/').rsplit('/').next().unwrap_or_default()
    }

    /// The canonical form with a trailing separator, for directory listings.
    #[must_use]
    pub fn with_trailing_slash(&self) -> String {
        format!("{}/", self.0)
    }

    /// Map a `file` URI to a filesystem path.
    #[must_use]
    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(self.0.strip_prefix("file://").unwrap_or(&self.0))
    }
}

impl TryFrom<&str> for Uri {
    type Error = UriError;

    fn try_from(uri: &str) -> Result<Self, Self::Error> {
        Self::new(uri)
    }
}

impl From<UriError> for crate::error::StorageError {
    fn from(err: UriError) -> Self {
        Self::InvalidUri(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_canonical() {
        assert!(Uri::new("").is_err());
        assert!(Uri::new("mem://").is_err());
        assert_eq!(Uri::new("/tmp/a/").unwrap(), Uri::new("/tmp/a").unwrap());
        assert_eq!(Uri::new("/tmp/a").unwrap().to_string(), "/tmp/a");
    }

    #[test]
    fn uri_scheme_and_path() {
        let bare = Uri::new("/tmp/arrays/a").unwrap();
        assert_eq!(bare.scheme(), "file");
        assert_eq!(bare.path(), "/tmp/arrays/a");
        assert_eq!(bare.last_path_part(), "a");

        let mem = Uri::new("mem://arrays/b").unwrap();
        assert_eq!(mem.scheme(), "mem");
        assert_eq!(mem.path(), "arrays/b");
        assert_eq!(mem.last_path_part(), "b");
    }

    #[test]
    fn uri_join() {
        let uri = Uri::new("mem://arrays/a").unwrap();
        assert_eq!(uri.join("__lockfile").as_str(), "mem://arrays/a/__lockfile");
        assert_eq!(uri.join("__lockfile").last_path_part(), "__lockfile");
    }

    #[test]
    fn uri_to_path() {
        assert_eq!(
            Uri::new("file:///tmp/a").unwrap().to_path(),
            PathBuf::from("/tmp/a")
        );
        assert_eq!(Uri::new("/tmp/a").unwrap().to_path(), PathBuf::from("/tmp/a"));
    }
}
