//! # cvmfs-catalog
//!
//! Catalog databases and the catalog tree of the CernVM-FS client.
//!
//! Repository metadata lives in immutable SQLite databases ("catalogs"),
//! addressed by content digest and organized as a tree: each catalog may
//! reference nested catalogs that serve subtrees below their mountpoints.
//! The [`CatalogManager`] grows this tree lazily as lookups descend into
//! it and swaps the whole tree atomically when the repository publishes a
//! new revision.

pub mod catalog;
pub mod inode;
pub mod manifest;
pub mod mgr;
mod sql;
pub mod testing;

pub use catalog::Catalog;
pub use inode::{InodeGenerationAnnotation, InodeRange, INODE_OFFSET};
pub use manifest::Manifest;
pub use mgr::{CatalogManager, LoadResult, LookupMode, LookupResult};

use thiserror::Error;

/// Errors that can occur during catalog operations
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] cvmfs_cache::CacheError),

    #[error("Download error: {0}")]
    Download(#[from] cvmfs_download::DownloadError),

    #[error("Malformed manifest: {0}")]
    BadManifest(String),

    #[error("Repository name mismatch: expected {expected}, manifest says {actual}")]
    WrongRepository { expected: String, actual: String },

    #[error("Malformed path: {0}")]
    BadPath(#[from] cvmfs_types::TypesError),

    #[error("Catalog not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, CatalogError>;
