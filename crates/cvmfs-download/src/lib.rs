//! # cvmfs-download
//!
//! HTTP transport for the CernVM-FS client.
//!
//! The rest of the client only sees the [`Downloader`] trait: fetch a
//! repository-relative object path into a writer. The production
//! implementation is [`HttpDownloader`], which adds host and proxy chains
//! with failover, dual timeouts (proxied vs. direct), bounded retries and
//! exponential backoff. Tests substitute [`DirDownloader`], which serves
//! objects from a local directory.

mod http;

pub use http::{DownloadStats, HttpDownloader, HttpDownloaderConfig};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching an object
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("All hosts failed after {0} attempts")]
    Exhausted(u32),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Fetches repository-relative object paths into a writer.
///
/// `rel_path` is the path below the repository base URL, e.g.
/// `data/ab/cdef...C` for a catalog or `.cvmfspublished` for the manifest.
pub trait Downloader: Send + Sync {
    fn fetch_into(&self, rel_path: &str, sink: &mut dyn Write) -> Result<u64>;

    /// Fetch a small object fully into memory.
    fn fetch_bytes(&self, rel_path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.fetch_into(rel_path, &mut buf)?;
        Ok(buf)
    }
}

/// Serves objects from a local directory tree, mirroring the layout of an
/// HTTP origin. Used by tests and by pre-seeded offline setups.
#[derive(Debug, Clone)]
pub struct DirDownloader {
    root: PathBuf,
}

impl DirDownloader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Downloader for DirDownloader {
    fn fetch_into(&self, rel_path: &str, sink: &mut dyn Write) -> Result<u64> {
        let path = self.root.join(rel_path);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DownloadError::NotFound(rel_path.to_string())
            } else {
                DownloadError::Io(e)
            }
        })?;
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }
}
