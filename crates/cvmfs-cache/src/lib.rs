//! # cvmfs-cache
//!
//! Local content caches for the CernVM-FS client.
//!
//! The cache is content-addressed: an object lives under the first two hex
//! characters of its digest (`ab/cdef...`). Inserts are transactional
//! (temp file in `txn/`, atomic rename on commit), so readers never see a
//! partial object. Two backends can be stacked by the
//! [`TieredCacheManager`], and a bounded-LRU [`QuotaManager`] keeps the
//! upper cache below its configured size. The [`Fetcher`] ties cache and
//! network together: open from cache, or download, verify, decompress and
//! insert.

pub mod backend;
pub mod fetch;
pub mod posix;
pub mod quota;
pub mod tiered;

pub use backend::{BlessedObject, CacheBackend, CacheTxn, QuotaObserver};
pub use fetch::{compress_bytes, hash_compressed_file, Fetcher};
pub use posix::PosixCacheManager;
pub use quota::QuotaManager;
pub use tiered::TieredCacheManager;

use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Object not in cache: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LRU database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Download failed: {0}")]
    Download(#[from] cvmfs_download::DownloadError),

    #[error("Digest mismatch for {object}: expected {expected}, got {actual}")]
    DigestMismatch {
        object: String,
        expected: String,
        actual: String,
    },

    #[error("Cache is full: {0}")]
    NoSpace(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
