//! Two-layer cache composition.
//!
//! The upper layer is the fast, quota-managed local cache; the lower layer
//! is typically a shared or pre-seeded store. Reads fall through to the
//! lower layer and promote objects into the upper layer; writes mirror to
//! both unless the lower layer is read-only.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use tracing::warn;

use crate::backend::{BlessedObject, CacheBackend, CacheTxn};
use crate::{CacheError, Result};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Composes an upper and a lower [`CacheBackend`].
pub struct TieredCacheManager {
    upper: Arc<dyn CacheBackend>,
    lower: Arc<dyn CacheBackend>,
}

impl TieredCacheManager {
    pub fn new(upper: Arc<dyn CacheBackend>, lower: Arc<dyn CacheBackend>) -> Self {
        Self { upper, lower }
    }

    /// Copy a lower-layer hit into the upper layer and return a handle to
    /// the promoted object. Any failure along the way falls back to the
    /// error the upper layer reported in the first place.
    fn promote(&self, object: &BlessedObject, mut lower_file: File) -> Result<File> {
        let size = lower_file.metadata()?.len();
        let mut txn = self.upper.start_txn(object, size)?;
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            lower_file.read_exact(&mut buf[..want])?;
            txn.write(&buf[..want])?;
            remaining -= want as u64;
        }
        let promoted = txn.open_ro()?;
        txn.commit()?;
        Ok(promoted)
    }
}

impl CacheBackend for TieredCacheManager {
    fn open(&self, object: &BlessedObject) -> Result<File> {
        let upper_err = match self.upper.open(object) {
            Ok(file) => return Ok(file),
            // Only a clean miss falls through; I/O errors do not.
            Err(e @ CacheError::NotFound(_)) => e,
            Err(e) => return Err(e),
        };

        let lower_file = match self.lower.open(object) {
            Ok(file) => file,
            Err(_) => return Err(upper_err),
        };

        match self.promote(object, lower_file) {
            Ok(file) => Ok(file),
            Err(e) => {
                warn!(digest = %object.digest, error = %e,
                      "promotion into upper cache failed");
                Err(upper_err)
            }
        }
    }

    fn start_txn(&self, object: &BlessedObject, size: u64) -> Result<Box<dyn CacheTxn>> {
        let upper_txn = self.upper.start_txn(object, size)?;
        let lower_txn = if self.lower.is_read_only() {
            None
        } else {
            match self.lower.start_txn(object, size) {
                Ok(txn) => Some(txn),
                Err(e) => {
                    let _ = upper_txn.abort();
                    return Err(e);
                }
            }
        };
        Ok(Box::new(TieredTxn {
            upper: upper_txn,
            lower: lower_txn,
        }))
    }

    fn object_path(&self, object: &BlessedObject) -> Option<std::path::PathBuf> {
        self.upper
            .object_path(object)
            .or_else(|| self.lower.object_path(object))
    }

    fn save_state(&self) -> serde_json::Value {
        serde_json::json!({
            "upper": self.upper.save_state(),
            "lower": self.lower.save_state(),
        })
    }

    fn restore_state(&self, state: &serde_json::Value) {
        self.upper.restore_state(&state["upper"]);
        self.lower.restore_state(&state["lower"]);
    }

    fn describe(&self) -> String {
        format!(
            "tiered cache\n  - upper layer: {}\n  - lower layer: {}",
            self.upper.describe(),
            self.lower.describe()
        )
    }
}

struct TieredTxn {
    upper: Box<dyn CacheTxn>,
    lower: Option<Box<dyn CacheTxn>>,
}

impl CacheTxn for TieredTxn {
    fn write(&mut self, buf: &[u8]) -> Result<u64> {
        let nbytes = self.upper.write(buf)?;
        if let Some(lower) = &mut self.lower {
            lower.write(buf)?;
        }
        Ok(nbytes)
    }

    fn reset(&mut self) -> Result<()> {
        self.upper.reset()?;
        if let Some(lower) = &mut self.lower {
            lower.reset()?;
        }
        Ok(())
    }

    fn open_ro(&self) -> Result<File> {
        self.upper.open_ro()
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let result = self.upper.commit();
        if let Some(lower) = self.lower {
            let lower_result = if result.is_ok() {
                lower.commit()
            } else {
                lower.abort()
            };
            // The upper layer may already have handed out the object via
            // open_ro, so its commit decides the transaction.
            if let Err(e) = lower_result {
                warn!(error = %e, "commit failed in lower cache but succeeded in upper cache");
            }
        }
        result
    }

    fn abort(self: Box<Self>) -> Result<()> {
        let result = self.upper.abort();
        if let Some(lower) = self.lower {
            let _ = lower.abort();
        }
        result
    }

    fn size_hint(&self) -> u64 {
        self.upper.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixCacheManager;
    use cvmfs_types::ContentDigest;
    use tempfile::TempDir;

    fn insert(cache: &dyn CacheBackend, object: &BlessedObject, data: &[u8]) {
        let mut txn = cache.start_txn(object, data.len() as u64).unwrap();
        txn.write(data).unwrap();
        txn.commit().unwrap();
    }

    fn read_all(mut file: File) -> Vec<u8> {
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        content
    }

    #[test]
    fn test_lower_hit_promotes_into_upper() {
        let upper_dir = TempDir::new().unwrap();
        let lower_dir = TempDir::new().unwrap();
        let upper = Arc::new(PosixCacheManager::create(upper_dir.path()).unwrap());
        let lower = Arc::new(PosixCacheManager::create(lower_dir.path()).unwrap());

        let object = BlessedObject::new(ContentDigest::from_bytes(b"shared"), "/f");
        insert(lower.as_ref(), &object, b"shared");

        let tiered = TieredCacheManager::new(upper.clone(), lower.clone());
        assert_eq!(read_all(tiered.open(&object).unwrap()), b"shared");

        // Now resident in the upper layer on its own.
        assert_eq!(read_all(upper.open(&object).unwrap()), b"shared");
    }

    #[test]
    fn test_double_miss_reports_upper_error() {
        let upper_dir = TempDir::new().unwrap();
        let lower_dir = TempDir::new().unwrap();
        let tiered = TieredCacheManager::new(
            Arc::new(PosixCacheManager::create(upper_dir.path()).unwrap()),
            Arc::new(PosixCacheManager::create(lower_dir.path()).unwrap()),
        );
        let object = BlessedObject::new(ContentDigest::from_bytes(b"nope"), "/f");
        assert!(matches!(tiered.open(&object), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn test_write_mirrors_to_both_layers() {
        let upper_dir = TempDir::new().unwrap();
        let lower_dir = TempDir::new().unwrap();
        let upper = Arc::new(PosixCacheManager::create(upper_dir.path()).unwrap());
        let lower = Arc::new(PosixCacheManager::create(lower_dir.path()).unwrap());
        let tiered = TieredCacheManager::new(upper.clone(), lower.clone());

        let object = BlessedObject::new(ContentDigest::from_bytes(b"both"), "/f");
        insert(&tiered, &object, b"both");

        assert_eq!(read_all(upper.open(&object).unwrap()), b"both");
        assert_eq!(read_all(lower.open(&object).unwrap()), b"both");
    }

    #[test]
    fn test_read_only_lower_is_skipped_on_write() {
        let upper_dir = TempDir::new().unwrap();
        let lower_dir = TempDir::new().unwrap();
        let upper = Arc::new(PosixCacheManager::create(upper_dir.path()).unwrap());
        let _seed = PosixCacheManager::create(lower_dir.path()).unwrap();
        let lower = Arc::new(PosixCacheManager::open_read_only(lower_dir.path()).unwrap());
        let tiered = TieredCacheManager::new(upper.clone(), lower.clone());

        let object = BlessedObject::new(ContentDigest::from_bytes(b"upper-only"), "/f");
        insert(&tiered, &object, b"upper-only");

        assert_eq!(read_all(upper.open(&object).unwrap()), b"upper-only");
        assert!(matches!(lower.open(&object), Err(CacheError::NotFound(_))));
    }
}
