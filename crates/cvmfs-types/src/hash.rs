//! Content digests and path hashes.
//!
//! Every immutable artifact (catalog, file, chunk) is addressed by the SHA-1
//! digest of its compressed representation. Paths are keyed inside catalogs
//! by the MD5 of the full path string, split into two signed 64-bit columns.

use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::{Result, TypesError};

/// Width of a content digest in bytes (SHA-1)
pub const DIGEST_SIZE: usize = 20;

/// A 20-byte SHA-1 content digest addressing one immutable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ContentDigest(pub [u8; DIGEST_SIZE]);

impl ContentDigest {
    /// The null digest, used for entries without content (directories,
    /// symlinks).
    pub fn null() -> Self {
        Self([0u8; DIGEST_SIZE])
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Compute the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|_| TypesError::MalformedDigest(s.to_string()))?;
        let arr: [u8; DIGEST_SIZE] = raw
            .try_into()
            .map_err(|_| TypesError::MalformedDigest(s.to_string()))?;
        Ok(Self(arr))
    }

    /// The repository data path of this object: `ab/cdef...<suffix>`.
    ///
    /// The first two hex characters shard the object into one of 256
    /// directories; the suffix distinguishes object types on the server
    /// ("C" for catalogs, "H" for history databases, "" for data).
    pub fn make_object_path(&self, suffix: &str) -> String {
        let hex = self.to_hex();
        format!("{}/{}{}", &hex[..2], &hex[2..], suffix)
    }

    /// The relative cache path of this object inside a sharded cache
    /// directory (`ab/cdef...`).
    pub fn cache_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental SHA-1 over streamed data, used to verify downloads while
/// they are written into a cache transaction.
pub struct Sha1Context {
    inner: Sha1,
}

impl Sha1Context {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.inner.finalize().into())
    }
}

impl Default for Sha1Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A 16-byte MD5 hash of a full repository path, the catalog lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Md5Digest(pub [u8; 16]);

impl Md5Digest {
    pub fn from_path_bytes(path: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(path);
        Self(hasher.finalize().into())
    }

    /// Split into the two signed little-endian 64-bit halves stored in the
    /// catalog columns `md5path_1` and `md5path_2`.
    pub fn to_columns(&self) -> (i64, i64) {
        let hi = i64::from_le_bytes(self.0[0..8].try_into().unwrap());
        let lo = i64::from_le_bytes(self.0[8..16].try_into().unwrap());
        (hi, lo)
    }

    pub fn from_columns(hi: i64, lo: i64) -> Self {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&hi.to_le_bytes());
        raw[8..16].copy_from_slice(&lo.to_le_bytes());
        Self(raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}
