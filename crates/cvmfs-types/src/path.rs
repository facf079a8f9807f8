//! Repository paths.
//!
//! A repository path is a byte string starting with `/`; the repository
//! root is the empty path. Comparison is bytewise. The MD5 of the full
//! path string is the lookup key inside a catalog.

use serde::{Deserialize, Serialize};

use crate::hash::Md5Digest;
use crate::{Result, TypesError};

/// Longest accepted repository path in bytes.
pub const MAX_PATH_LEN: usize = 256;

/// An absolute path inside the repository. The root is the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct RepoPath(Vec<u8>);

impl RepoPath {
    /// The repository root (empty path).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse an absolute path. Accepts the empty string and "/" as root.
    pub fn new(path: &str) -> Result<Self> {
        if path.is_empty() || path == "/" {
            return Ok(Self::root());
        }
        if !path.starts_with('/') {
            return Err(TypesError::RelativePath(path.to_string()));
        }
        if path.len() > MAX_PATH_LEN {
            return Err(TypesError::PathTooLong(path.len(), MAX_PATH_LEN));
        }
        let trimmed = path.strip_suffix('/').unwrap_or(path);
        Ok(Self(trimmed.as_bytes().to_vec()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Paths come out of UTF-8 catalogs or out of `new`; both are valid.
        std::str::from_utf8(&self.0).unwrap_or("<non-utf8 path>")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// MD5 over the full path string, the catalog lookup key.
    pub fn md5(&self) -> Md5Digest {
        Md5Digest::from_path_bytes(&self.0)
    }

    /// Append one component. The name must not contain '/'.
    pub fn join(&self, name: &str) -> Result<Self> {
        let total = self.0.len() + 1 + name.len();
        if total > MAX_PATH_LEN {
            return Err(TypesError::PathTooLong(total, MAX_PATH_LEN));
        }
        let mut raw = self.0.clone();
        raw.push(b'/');
        raw.extend_from_slice(name.as_bytes());
        Ok(Self(raw))
    }

    /// The parent path; the root's parent is the root.
    pub fn parent(&self) -> Self {
        match self.0.iter().rposition(|b| *b == b'/') {
            Some(idx) => Self(self.0[..idx].to_vec()),
            None => Self::root(),
        }
    }

    /// The final component, empty for the root.
    pub fn file_name(&self) -> &str {
        match self.0.iter().rposition(|b| *b == b'/') {
            Some(idx) => std::str::from_utf8(&self.0[idx + 1..]).unwrap_or(""),
            None => "",
        }
    }

    /// True if `self` equals `prefix` or descends from it.
    pub fn starts_with(&self, prefix: &RepoPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0.starts_with(&prefix.0)
            && (self.0.len() == prefix.0.len() || self.0.get(prefix.0.len()) == Some(&b'/'))
    }

    /// The path relative to `prefix` (still absolute, e.g. "/sub/dir").
    /// Returns `None` if `self` does not descend from `prefix`.
    pub fn suffix(&self, prefix: &RepoPath) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self(self.0[prefix.0.len()..].to_vec()))
    }
}

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(self.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_empty() {
        assert!(RepoPath::root().is_root());
        assert!(RepoPath::new("/").unwrap().is_root());
        assert!(RepoPath::new("").unwrap().is_root());
    }

    #[test]
    fn test_relative_rejected() {
        assert!(RepoPath::new("etc/passwd").is_err());
    }

    #[test]
    fn test_join_and_split() {
        let base = RepoPath::new("/software").unwrap();
        let full = base.join("v1").unwrap();
        assert_eq!(full.as_str(), "/software/v1");
        assert_eq!(full.file_name(), "v1");
        assert_eq!(full.parent(), base);
        assert_eq!(base.parent(), RepoPath::root());
    }

    #[test]
    fn test_starts_with_component_boundary() {
        let a = RepoPath::new("/software").unwrap();
        let b = RepoPath::new("/software/v1").unwrap();
        let c = RepoPath::new("/software2").unwrap();
        assert!(b.starts_with(&a));
        assert!(!c.starts_with(&a));
        assert!(b.starts_with(&RepoPath::root()));
    }

    #[test]
    fn test_suffix() {
        let a = RepoPath::new("/software").unwrap();
        let b = RepoPath::new("/software/v1/bin").unwrap();
        assert_eq!(b.suffix(&a).unwrap().as_str(), "/v1/bin");
        assert!(a.suffix(&b).is_none());
    }

    #[test]
    fn test_too_long_rejected() {
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(RepoPath::new(&long).is_err());
    }
}
