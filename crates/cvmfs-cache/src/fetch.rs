//! The fetcher: digest in, verified local file handle out.
//!
//! Cache hit: hand out the cached file. Miss: download the compressed
//! object, hash the wire bytes while inflating them into a cache
//! transaction, verify the digest, commit, hand out the new file. On a
//! digest mismatch nothing becomes observable in the cache.

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use tracing::{debug, warn};

use cvmfs_download::Downloader;
use cvmfs_types::{ContentDigest, FileChunk, Sha1Context};

use crate::backend::{BlessedObject, CacheBackend, CacheTxn};
use crate::{CacheError, Result};

/// Ties the cache and the download manager together.
pub struct Fetcher {
    cache: Arc<dyn CacheBackend>,
    download: Arc<dyn Downloader>,
    num_downloads: AtomicU64,
}

impl Fetcher {
    pub fn new(cache: Arc<dyn CacheBackend>, download: Arc<dyn Downloader>) -> Self {
        Self {
            cache,
            download,
            num_downloads: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    /// Number of objects fetched over the network so far.
    pub fn num_downloads(&self) -> u64 {
        self.num_downloads.load(Ordering::Relaxed)
    }

    /// Fetch a regular data object (file content or chunk).
    pub fn fetch(&self, object: &BlessedObject, size_hint: u64) -> Result<File> {
        self.fetch_object(object, size_hint, "")
    }

    /// Fetch a file chunk; the description names the owning file.
    pub fn fetch_chunk(&self, chunk: &FileChunk, file_path: &str) -> Result<File> {
        let object = BlessedObject::new(chunk.digest, format!("Part of {file_path}"));
        self.fetch_object(&object, chunk.size, "")
    }

    /// Fetch a catalog database (server-side object suffix "C").
    pub fn fetch_catalog(&self, object: &BlessedObject) -> Result<File> {
        self.fetch_object(object, 0, "C")
    }

    fn fetch_object(&self, object: &BlessedObject, size_hint: u64, suffix: &str) -> Result<File> {
        match self.cache.open(object) {
            Ok(file) => return Ok(file),
            Err(CacheError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let url_path = format!("data/{}", object.digest.make_object_path(suffix));
        debug!(digest = %object.digest, path = %object.description, "cache miss, downloading");

        let mut txn = self.cache.start_txn(object, size_hint)?;
        let fetched = {
            let mut sink = VerifyingSink::new(txn.as_mut());
            match self.download.fetch_into(&url_path, &mut sink) {
                Ok(_) => sink.finish(),
                Err(e) => Err(CacheError::Download(e)),
            }
        };
        let actual = match fetched {
            Ok(actual) => actual,
            Err(e) => {
                let _ = txn.abort();
                return Err(e);
            }
        };

        if actual != object.digest {
            let _ = txn.abort();
            warn!(expected = %object.digest, actual = %actual,
                  "digest mismatch on fetched object");
            return Err(CacheError::DigestMismatch {
                object: object.description.clone(),
                expected: object.digest.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let file = txn.open_ro()?;
        txn.commit()?;
        self.num_downloads.fetch_add(1, Ordering::Relaxed);
        Ok(file)
    }
}

/// Hashes the compressed wire bytes while inflating them into a cache
/// transaction.
struct VerifyingSink<'a> {
    sha1: Sha1Context,
    decoder: ZlibDecoder<TxnWriter<'a>>,
}

impl<'a> VerifyingSink<'a> {
    fn new(txn: &'a mut dyn CacheTxn) -> Self {
        Self {
            sha1: Sha1Context::new(),
            decoder: ZlibDecoder::new(TxnWriter(txn)),
        }
    }

    fn finish(self) -> Result<ContentDigest> {
        self.decoder.finish().map_err(CacheError::Io)?;
        Ok(self.sha1.finalize())
    }
}

impl Write for VerifyingSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sha1.update(buf);
        self.decoder.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.decoder.flush()
    }
}

struct TxnWriter<'a>(&'a mut dyn CacheTxn);

impl Write for TxnWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .write(buf)
            .map(|n| n as usize)
            .map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compress a local file with zlib and return the digest of the
/// compression output. This reproduces the digest the publisher recorded,
/// so it can be compared against the catalog entry (`user.lhash`).
pub fn hash_compressed_file(mut file: File) -> Result<ContentDigest> {
    let mut encoder = ZlibEncoder::new(Sha1Sink(Sha1Context::new()), Compression::default());
    io::copy(&mut file, &mut encoder)?;
    let sink = encoder.finish()?;
    Ok(sink.0.finalize())
}

/// Compress a byte slice with zlib, as the publisher does before storing.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

struct Sha1Sink(Sha1Context);

impl Write for Sha1Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixCacheManager;
    use cvmfs_download::DirDownloader;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    /// Compress `plain`, store it in the origin directory under the digest
    /// of the compressed bytes, and return that digest.
    fn publish(origin: &std::path::Path, plain: &[u8]) -> ContentDigest {
        let compressed = compress_bytes(plain).unwrap();
        let digest = ContentDigest::from_bytes(&compressed);
        let path = origin.join(format!("data/{}", digest.make_object_path("")));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, compressed).unwrap();
        digest
    }

    fn make_fetcher(cache_dir: &TempDir, origin_dir: &TempDir) -> Fetcher {
        let cache = Arc::new(PosixCacheManager::create(cache_dir.path()).unwrap());
        let download = Arc::new(DirDownloader::new(origin_dir.path()));
        Fetcher::new(cache, download)
    }

    #[test]
    fn test_miss_downloads_verifies_and_caches() {
        let cache_dir = TempDir::new().unwrap();
        let origin_dir = TempDir::new().unwrap();
        let digest = publish(origin_dir.path(), b"file content");
        let fetcher = make_fetcher(&cache_dir, &origin_dir);

        let object = BlessedObject::new(digest, "/f");
        let mut file = fetcher.fetch(&object, 12).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"file content");
        assert_eq!(fetcher.num_downloads(), 1);

        // Second fetch is a pure cache hit.
        let _ = fetcher.fetch(&object, 12).unwrap();
        assert_eq!(fetcher.num_downloads(), 1);
    }

    #[test]
    fn test_digest_mismatch_commits_nothing() {
        let cache_dir = TempDir::new().unwrap();
        let origin_dir = TempDir::new().unwrap();
        let digest = publish(origin_dir.path(), b"original");
        let fetcher = make_fetcher(&cache_dir, &origin_dir);

        // Corrupt the published object: same name, different bytes.
        let path = origin_dir
            .path()
            .join(format!("data/{}", digest.make_object_path("")));
        fs::write(&path, compress_bytes(b"tampered").unwrap()).unwrap();

        let object = BlessedObject::new(digest, "/f");
        assert!(matches!(
            fetcher.fetch(&object, 8),
            Err(CacheError::DigestMismatch { .. })
        ));
        assert!(!cache_dir.path().join(digest.cache_path()).exists());
        assert_eq!(fetcher.num_downloads(), 0);
    }

    #[test]
    fn test_missing_object_propagates_not_found() {
        let cache_dir = TempDir::new().unwrap();
        let origin_dir = TempDir::new().unwrap();
        let fetcher = make_fetcher(&cache_dir, &origin_dir);
        let object = BlessedObject::new(ContentDigest::from_bytes(b"absent"), "/f");
        assert!(matches!(
            fetcher.fetch(&object, 0),
            Err(CacheError::Download(_))
        ));
    }

    #[test]
    fn test_lhash_reproduces_published_digest() {
        let cache_dir = TempDir::new().unwrap();
        let origin_dir = TempDir::new().unwrap();
        let digest = publish(origin_dir.path(), b"hash me");
        let fetcher = make_fetcher(&cache_dir, &origin_dir);

        let object = BlessedObject::new(digest, "/f");
        let file = fetcher.fetch(&object, 7).unwrap();
        assert_eq!(hash_compressed_file(file).unwrap(), digest);
    }
}
