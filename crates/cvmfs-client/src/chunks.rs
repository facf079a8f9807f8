//! Chunked-file bookkeeping.
//!
//! Opening a chunked file registers its chunk list and hands out a
//! handle; the per-chunk file descriptor is opened lazily by `read`.
//! Operations on one handle are serialized by a striped lock selected by
//! hashing the handle id; different handles proceed concurrently.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard};

use cvmfs_types::{FileChunkList, RepoPath};

/// Number of stripes in the handle lock table.
const NUM_HANDLE_LOCKS: usize = 128;

/// The currently open chunk of one handle.
#[derive(Default)]
pub struct ChunkFd {
    pub chunk_idx: Option<usize>,
    pub file: Option<File>,
}

struct ChunkTablesInner {
    /// Chunk list and path per inode, shared by all handles of the inode.
    inode_to_chunks: HashMap<u64, (Arc<FileChunkList>, RepoPath)>,
    /// Open handles per inode.
    inode_to_refs: HashMap<u64, u32>,
    /// Per-handle open chunk fd.
    handle_to_fd: HashMap<u64, ChunkFd>,
    next_handle: u64,
}

/// All chunked-file state of the engine.
pub struct ChunkTables {
    inner: Mutex<ChunkTablesInner>,
    handle_locks: Vec<Mutex<()>>,
}

impl Default for ChunkTables {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTables {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChunkTablesInner {
                inode_to_chunks: HashMap::new(),
                inode_to_refs: HashMap::new(),
                handle_to_fd: HashMap::new(),
                next_handle: 2,
            }),
            handle_locks: (0..NUM_HANDLE_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Serialize operations on one handle; concurrent reads on different
    /// handles map to different stripes.
    pub fn lock_handle(&self, handle: u64) -> MutexGuard<'_, ()> {
        self.handle_locks[(handle as usize) % NUM_HANDLE_LOCKS]
            .lock()
            .unwrap()
    }

    /// Register an open of a chunked file. The chunk list is stored on
    /// first open and shared by subsequent ones. Returns the new handle.
    pub fn open(&self, inode: u64, chunks: Arc<FileChunkList>, path: RepoPath) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner
            .inode_to_chunks
            .entry(inode)
            .or_insert((chunks, path));
        *inner.inode_to_refs.entry(inode).or_insert(0) += 1;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handle_to_fd.insert(handle, ChunkFd::default());
        handle
    }

    /// Whether the chunk list of `inode` is already registered.
    pub fn has_chunks(&self, inode: u64) -> bool {
        self.inner.lock().unwrap().inode_to_chunks.contains_key(&inode)
    }

    pub fn chunks_of(&self, inode: u64) -> Option<(Arc<FileChunkList>, RepoPath)> {
        let inner = self.inner.lock().unwrap();
        inner.inode_to_chunks.get(&inode).cloned()
    }

    /// Move the per-handle fd out for a read (the caller holds the
    /// handle lock).
    pub fn take_fd(&self, handle: u64) -> Option<ChunkFd> {
        let mut inner = self.inner.lock().unwrap();
        let fd = inner.handle_to_fd.get_mut(&handle)?;
        Some(std::mem::take(fd))
    }

    pub fn put_fd(&self, handle: u64, fd: ChunkFd) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.handle_to_fd.get_mut(&handle) {
            *slot = fd;
        }
    }

    /// Release a handle. Returns the dropped chunk fd; when the inode's
    /// last handle goes away, the chunk list is freed as well.
    pub fn release(&self, inode: u64, handle: u64) -> Option<ChunkFd> {
        let mut inner = self.inner.lock().unwrap();
        let fd = inner.handle_to_fd.remove(&handle);
        if let Some(refs) = inner.inode_to_refs.get_mut(&inode) {
            *refs -= 1;
            if *refs == 0 {
                inner.inode_to_refs.remove(&inode);
                inner.inode_to_chunks.remove(&inode);
            }
        }
        fd
    }

    pub fn num_handles(&self) -> usize {
        self.inner.lock().unwrap().handle_to_fd.len()
    }

    /// Snapshot for hand-over: chunk lists and handles survive, open fds
    /// do not (they are reopened lazily from the cache).
    pub fn save(&self) -> SavedChunkTables {
        let inner = self.inner.lock().unwrap();
        SavedChunkTables {
            files: inner
                .inode_to_chunks
                .iter()
                .map(|(&inode, (chunks, path))| SavedChunkedFile {
                    inode,
                    chunks: (**chunks).clone(),
                    path: path.to_string(),
                    references: inner.inode_to_refs.get(&inode).copied().unwrap_or(0),
                })
                .collect(),
            handles: inner.handle_to_fd.keys().copied().collect(),
            next_handle: inner.next_handle,
        }
    }

    pub fn restore(&self, saved: &SavedChunkTables) {
        let mut inner = self.inner.lock().unwrap();
        inner.inode_to_chunks.clear();
        inner.inode_to_refs.clear();
        inner.handle_to_fd.clear();
        for file in &saved.files {
            let Ok(path) = RepoPath::new(&file.path) else {
                continue;
            };
            inner
                .inode_to_chunks
                .insert(file.inode, (Arc::new(file.chunks.clone()), path));
            inner.inode_to_refs.insert(file.inode, file.references);
        }
        for &handle in &saved.handles {
            inner.handle_to_fd.insert(handle, ChunkFd::default());
        }
        inner.next_handle = saved.next_handle;
    }
}

/// Serialized chunk tables for hand-over.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SavedChunkTables {
    pub files: Vec<SavedChunkedFile>,
    pub handles: Vec<u64>,
    pub next_handle: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SavedChunkedFile {
    pub inode: u64,
    pub chunks: FileChunkList,
    pub path: String,
    pub references: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvmfs_types::FileChunk;

    fn chunk_list() -> Arc<FileChunkList> {
        Arc::new(FileChunkList::new(vec![FileChunk {
            offset: 0,
            size: 100,
            digest: cvmfs_types::ContentDigest::from_bytes(b"c"),
        }]))
    }

    fn path(s: &str) -> RepoPath {
        RepoPath::new(s).unwrap()
    }

    #[test]
    fn test_open_read_release_lifecycle() {
        let tables = ChunkTables::new();
        let h1 = tables.open(300, chunk_list(), path("/f"));
        let h2 = tables.open(300, chunk_list(), path("/f"));
        assert_ne!(h1, h2);
        assert!(tables.has_chunks(300));
        assert_eq!(tables.num_handles(), 2);

        tables.release(300, h1);
        assert!(tables.has_chunks(300));
        tables.release(300, h2);
        assert!(!tables.has_chunks(300));
        assert_eq!(tables.num_handles(), 0);
    }

    #[test]
    fn test_take_put_fd() {
        let tables = ChunkTables::new();
        let handle = tables.open(300, chunk_list(), path("/f"));
        let mut fd = tables.take_fd(handle).unwrap();
        assert!(fd.file.is_none());
        fd.chunk_idx = Some(3);
        tables.put_fd(handle, fd);
        assert_eq!(tables.take_fd(handle).unwrap().chunk_idx, Some(3));
    }

    #[test]
    fn test_save_restore_drops_fds_keeps_handles() {
        let tables = ChunkTables::new();
        let handle = tables.open(300, chunk_list(), path("/f"));
        let mut fd = tables.take_fd(handle).unwrap();
        fd.chunk_idx = Some(0);
        tables.put_fd(handle, fd);

        let saved = tables.save();
        let restored = ChunkTables::new();
        restored.restore(&saved);

        assert!(restored.has_chunks(300));
        let fd = restored.take_fd(handle).unwrap();
        assert!(fd.file.is_none());
        assert!(fd.chunk_idx.is_none());

        // Handle numbering continues where the predecessor stopped.
        let next = restored.open(301, chunk_list(), path("/g"));
        assert!(next > handle);
    }
}
