//! Directory entries.
//!
//! The catalog stores one row per path; at read time it is materialized
//! into a [`DirectoryEntry`] carrying the runtime inode and remapped
//! ownership.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::hash::ContentDigest;

/// Inode value before assignment.
pub const INVALID_INODE: u64 = 0;

/// What kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirentKind {
    Regular,
    Directory,
    Symlink,
    /// Sentinel for negative metadata cache entries ("path does not exist").
    Negative,
}

/// A materialized catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: DirentKind,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Content digest of the (compressed) file data; null for directories
    /// and symlinks.
    pub checksum: ContentDigest,
    pub symlink_target: String,
    /// Content is stored as an ordered list of independently addressed
    /// chunks instead of one object.
    pub is_chunked: bool,
    /// Nonzero groups hardlinked entries inside one catalog.
    pub hardlink_group: u64,
    /// This entry is the root entry of a nested catalog (as seen from
    /// inside the nested catalog).
    pub is_nested_root: bool,
    /// This entry is a mountpoint of a nested catalog (as seen from the
    /// parent catalog).
    pub is_nested_mountpoint: bool,
    /// Runtime inode, assigned by the owning catalog at read time.
    pub inode: u64,
}

impl DirectoryEntry {
    /// The sentinel stored in the md5 metadata cache for paths that do not
    /// exist.
    pub fn negative() -> Self {
        Self {
            name: String::new(),
            kind: DirentKind::Negative,
            size: 0,
            mtime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            checksum: ContentDigest::null(),
            symlink_target: String::new(),
            is_chunked: false,
            hardlink_group: 0,
            is_nested_root: false,
            is_nested_mountpoint: false,
            inode: INVALID_INODE,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.kind == DirentKind::Negative
    }

    pub fn is_regular(&self) -> bool {
        self.kind == DirentKind::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.kind == DirentKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == DirentKind::Symlink
    }

    /// The kernel-facing attributes for this entry.
    pub fn stat_info(&self) -> StatInfo {
        let type_bits = match self.kind {
            DirentKind::Regular => libc::S_IFREG,
            DirentKind::Directory => libc::S_IFDIR,
            DirentKind::Symlink => libc::S_IFLNK,
            DirentKind::Negative => 0,
        };
        StatInfo {
            ino: self.inode,
            size: if self.is_symlink() {
                self.symlink_target.len() as u64
            } else {
                self.size
            },
            mode: type_bits as u32 | (self.mode & 0o7777),
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            mtime: self.mtime,
            kind: self.kind,
        }
    }
}

/// The subset of `struct stat` the client reports to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatInfo {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub kind: DirentKind,
}

/// Static uid/gid remap applied when entries are materialized from a
/// catalog. Identities not present in the map pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct OwnerMap {
    map: HashMap<u32, u32>,
}

impl OwnerMap {
    pub fn new(map: HashMap<u32, u32>) -> Self {
        Self { map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn map(&self, id: u32) -> u32 {
        *self.map.get(&id).unwrap_or(&id)
    }
}
