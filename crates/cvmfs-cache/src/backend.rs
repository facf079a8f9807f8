//! The cache backend contract.
//!
//! A backend stores immutable, content-addressed objects. Reads hand out
//! plain [`File`] handles (the open-file engine keeps them in its handle
//! tables); writes go through a transaction object that becomes visible
//! only on commit.

use std::fs::File;

use cvmfs_types::ContentDigest;

use crate::Result;

/// An object to be opened or inserted: the digest plus bookkeeping the
/// quota manager wants (a human-readable description, typically the
/// repository path, and whether the entry must survive eviction).
#[derive(Debug, Clone)]
pub struct BlessedObject {
    pub digest: ContentDigest,
    pub description: String,
    pub pinned: bool,
}

impl BlessedObject {
    pub fn new(digest: ContentDigest, description: impl Into<String>) -> Self {
        Self {
            digest,
            description: description.into(),
            pinned: false,
        }
    }

    pub fn pinned(digest: ContentDigest, description: impl Into<String>) -> Self {
        Self {
            digest,
            description: description.into(),
            pinned: true,
        }
    }
}

/// Events a cache backend reports to its quota keeper.
///
/// The original client wired these with hand-rolled function-pointer
/// tables; an explicit observer trait carries the same three events.
pub trait QuotaObserver: Send + Sync {
    /// A new object of `size` bytes became visible in the cache.
    fn on_insert(&self, object: &BlessedObject, size: u64);

    /// An existing object was served from the cache.
    fn on_touch(&self, digest: &ContentDigest);
}

/// A pending insert. Data written here is invisible until [`commit`]
/// returns; `abort` (or drop) leaves no trace.
///
/// [`commit`]: CacheTxn::commit
pub trait CacheTxn: Send {
    fn write(&mut self, buf: &[u8]) -> Result<u64>;

    /// Discard everything written so far but keep the transaction open.
    fn reset(&mut self) -> Result<()>;

    /// Open a read handle onto the partially written data. Used by the
    /// read-through path to hand out the object while the commit is still
    /// pending.
    fn open_ro(&self) -> Result<File>;

    /// Make the object visible under its digest.
    fn commit(self: Box<Self>) -> Result<()>;

    fn abort(self: Box<Self>) -> Result<()>;

    fn size_hint(&self) -> u64;
}

/// A content-addressed object store.
pub trait CacheBackend: Send + Sync {
    /// Open an object for reading. `CacheError::NotFound` when absent.
    fn open(&self, object: &BlessedObject) -> Result<File>;

    /// Begin inserting an object of (decompressed) size `size`.
    fn start_txn(&self, object: &BlessedObject, size: u64) -> Result<Box<dyn CacheTxn>>;

    /// True if inserts are rejected (e.g. a shared read-only lower layer).
    fn is_read_only(&self) -> bool {
        false
    }

    /// The local filesystem path of a resident object, if the backend
    /// stores objects as plain files. SQLite catalogs are opened in place
    /// through this.
    fn object_path(&self, object: &BlessedObject) -> Option<std::path::PathBuf> {
        let _ = object;
        None
    }

    /// Opaque state snapshot for process hand-over.
    fn save_state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn restore_state(&self, _state: &serde_json::Value) {}

    fn describe(&self) -> String;
}
