//! File chunks.
//!
//! Large files are stored as an ordered list of independently addressed
//! chunks. Offsets are strictly increasing and cover `[0, file_size)`
//! contiguously.

use serde::{Deserialize, Serialize};

use crate::hash::ContentDigest;

/// One piece of a chunked file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub offset: u64,
    pub size: u64,
    pub digest: ContentDigest,
}

/// The ordered chunk list of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChunkList {
    chunks: Vec<FileChunk>,
}

impl FileChunkList {
    pub fn new(chunks: Vec<FileChunk>) -> Self {
        debug_assert!(chunks.windows(2).all(|w| w[0].offset < w[1].offset));
        Self { chunks }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn get(&self, idx: usize) -> Option<&FileChunk> {
        self.chunks.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileChunk> {
        self.chunks.iter()
    }

    /// Index of the chunk containing byte `offset`, by binary search.
    /// Returns `None` only for an empty list; an offset beyond the last
    /// chunk maps to the last chunk (the read loop then hits EOF there).
    pub fn chunk_index_for_offset(&self, offset: u64) -> Option<usize> {
        if self.chunks.is_empty() {
            return None;
        }
        match self.chunks.binary_search_by(|c| c.offset.cmp(&offset)) {
            Ok(idx) => Some(idx),
            Err(0) => Some(0),
            Err(idx) => Some(idx - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, size: u64) -> FileChunk {
        FileChunk {
            offset,
            size,
            digest: ContentDigest::from_bytes(&offset.to_le_bytes()),
        }
    }

    fn three_chunks() -> FileChunkList {
        FileChunkList::new(vec![
            chunk(0, 1 << 20),
            chunk(1 << 20, 1 << 20),
            chunk(2 << 20, 512),
        ])
    }

    #[test]
    fn test_search_exact_offsets() {
        let list = three_chunks();
        assert_eq!(list.chunk_index_for_offset(0), Some(0));
        assert_eq!(list.chunk_index_for_offset(1 << 20), Some(1));
        assert_eq!(list.chunk_index_for_offset(2 << 20), Some(2));
    }

    #[test]
    fn test_search_interior_offsets() {
        let list = three_chunks();
        assert_eq!(list.chunk_index_for_offset(1), Some(0));
        assert_eq!(list.chunk_index_for_offset((1 << 20) - 1), Some(0));
        assert_eq!(list.chunk_index_for_offset((1 << 20) + 1), Some(1));
        // Beyond the end: last chunk, read loop hits EOF there.
        assert_eq!(list.chunk_index_for_offset(u64::MAX), Some(2));
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(FileChunkList::default().chunk_index_for_offset(0), None);
    }
}
