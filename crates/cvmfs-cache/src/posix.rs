//! The POSIX cache backend.
//!
//! Layout inside the cache root:
//!
//! ```text
//! <root>/
//! ├── 00/ .. ff/        # digest-sharded object files
//! ├── txn/              # staging area for pending inserts
//! └── .cvmfscache       # sentinel marking a managed cache directory
//! ```
//!
//! Inserts write to a unique temp file under `txn/` and `rename(2)` into
//! the shard on commit. A rename race with a concurrent insert of the same
//! digest is harmless: both files carry identical content.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::{BlessedObject, CacheBackend, CacheTxn, QuotaObserver};
use crate::{CacheError, Result};

/// Name of the sentinel file marking a managed cache directory.
pub const CACHE_SENTINEL: &str = ".cvmfscache";

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Content-addressed object store over a local directory.
pub struct PosixCacheManager {
    root: PathBuf,
    read_only: bool,
    quota: Option<Arc<dyn QuotaObserver>>,
}

impl PosixCacheManager {
    /// Create the shard directories, the staging area and the sentinel,
    /// then open the cache.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        for shard in 0..=0xffu32 {
            fs::create_dir_all(root.join(format!("{shard:02x}")))?;
        }
        fs::create_dir_all(root.join("txn"))?;
        let sentinel = root.join(CACHE_SENTINEL);
        if !sentinel.exists() {
            File::create(&sentinel)?;
        }
        Ok(Self {
            root,
            read_only: false,
            quota: None,
        })
    }

    /// Open an existing cache directory without touching it, e.g. a shared
    /// lower layer maintained by another process.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join(CACHE_SENTINEL).exists() {
            return Err(CacheError::NotFound(format!(
                "{} is not a cache directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            read_only: true,
            quota: None,
        })
    }

    pub fn set_quota_observer(&mut self, observer: Arc<dyn QuotaObserver>) {
        self.quota = Some(observer);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_path(&self, object: &BlessedObject) -> PathBuf {
        self.root.join(object.digest.cache_path())
    }
}

impl CacheBackend for PosixCacheManager {
    fn open(&self, object: &BlessedObject) -> Result<File> {
        let path = self.local_path(object);
        match File::open(&path) {
            Ok(file) => {
                if let Some(quota) = &self.quota {
                    quota.on_touch(&object.digest);
                }
                Ok(file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CacheError::NotFound(object.digest.to_hex()))
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn start_txn(&self, object: &BlessedObject, size: u64) -> Result<Box<dyn CacheTxn>> {
        if self.read_only {
            return Err(CacheError::Io(std::io::Error::from_raw_os_error(
                libc::EROFS,
            )));
        }
        let txn_id = TXN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .root
            .join("txn")
            .join(format!("fetch{}.{}", std::process::id(), txn_id));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        debug!(digest = %object.digest, tmp = %tmp_path.display(), "cache transaction started");
        Ok(Box::new(PosixTxn {
            object: object.clone(),
            tmp_path,
            final_path: self.local_path(object),
            file,
            expected_size: size,
            written: 0,
            quota: self.quota.clone(),
        }))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn object_path(&self, object: &BlessedObject) -> Option<PathBuf> {
        let path = self.local_path(object);
        path.exists().then_some(path)
    }

    fn describe(&self) -> String {
        format!("posix cache at {}", self.root.display())
    }
}

struct PosixTxn {
    object: BlessedObject,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    expected_size: u64,
    written: u64,
    quota: Option<Arc<dyn QuotaObserver>>,
}

impl CacheTxn for PosixTxn {
    fn write(&mut self, buf: &[u8]) -> Result<u64> {
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.written = 0;
        Ok(())
    }

    fn open_ro(&self) -> Result<File> {
        Ok(File::open(&self.tmp_path)?)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        if let Err(e) = fs::rename(&self.tmp_path, &self.final_path) {
            let _ = fs::remove_file(&self.tmp_path);
            // Lost rename race against a concurrent insert of the same
            // object: the content is identical, the insert stands.
            if !self.final_path.exists() {
                return Err(CacheError::Io(e));
            }
        }
        if let Some(quota) = &self.quota {
            quota.on_insert(&self.object, self.written);
        }
        debug!(digest = %self.object.digest, size = self.written, "cache object committed");
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        fs::remove_file(&self.tmp_path)?;
        Ok(())
    }

    fn size_hint(&self) -> u64 {
        self.expected_size
    }
}
