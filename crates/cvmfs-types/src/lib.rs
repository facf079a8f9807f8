//! # cvmfs-types
//!
//! Shared primitive types for the CernVM-FS client.
//!
//! Everything a repository is made of passes through here: content digests
//! (SHA-1, the address of every immutable artifact), MD5 path hashes (the
//! lookup key inside a catalog), repository paths, directory entries and
//! chunk lists.

pub mod chunk;
pub mod dirent;
pub mod hash;
pub mod path;

pub use chunk::{FileChunk, FileChunkList};
pub use dirent::{DirectoryEntry, DirentKind, OwnerMap, StatInfo};
pub use hash::{ContentDigest, Md5Digest, Sha1Context};
pub use path::RepoPath;

use thiserror::Error;

/// Errors that can occur while handling repository primitives
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Malformed hex digest: {0}")]
    MalformedDigest(String),

    #[error("Path too long: {0} bytes (maximum {1})")]
    PathTooLong(usize, usize),

    #[error("Path must be absolute: {0}")]
    RelativePath(String),
}

pub type Result<T> = std::result::Result<T, TypesError>;
