//! Directory listing handles.
//!
//! `opendir` materializes the full listing once; `readdir` slices the
//! stored records by offset until `releasedir` frees them. Handles are
//! monotonically assigned and survive process hand-over.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use cvmfs_types::DirentKind;

/// One materialized directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    pub name: String,
    pub inode: u64,
    pub kind: DirentKind,
}

struct DirHandlesInner {
    handles: HashMap<u64, Vec<ListingRecord>>,
    next_handle: u64,
}

/// The engine's open-directory table.
pub struct DirectoryHandles {
    inner: Mutex<DirHandlesInner>,
}

impl Default for DirectoryHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryHandles {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DirHandlesInner {
                handles: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    pub fn insert(&self, listing: Vec<ListingRecord>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, listing);
        handle
    }

    /// The records at and after `offset` (an index into the listing).
    /// `None` for an unknown handle.
    pub fn slice(&self, handle: u64, offset: usize) -> Option<Vec<(usize, ListingRecord)>> {
        let inner = self.inner.lock().unwrap();
        let listing = inner.handles.get(&handle)?;
        Some(
            listing
                .iter()
                .enumerate()
                .skip(offset)
                .map(|(idx, record)| (idx, record.clone()))
                .collect(),
        )
    }

    pub fn release(&self, handle: u64) -> bool {
        self.inner.lock().unwrap().handles.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save(&self) -> SavedDirHandles {
        let inner = self.inner.lock().unwrap();
        SavedDirHandles {
            handles: inner
                .handles
                .iter()
                .map(|(&handle, listing)| (handle, listing.clone()))
                .collect(),
            next_handle: inner.next_handle,
        }
    }

    pub fn restore(&self, saved: &SavedDirHandles) {
        let mut inner = self.inner.lock().unwrap();
        inner.handles = saved.handles.iter().cloned().collect();
        // Guard against a predecessor that assigned handles beyond its
        // recorded counter.
        let max_used = saved.handles.iter().map(|(h, _)| *h).max().unwrap_or(0);
        inner.next_handle = saved.next_handle.max(max_used + 1);
    }
}

/// Serialized open-directory table for hand-over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedDirHandles {
    pub handles: Vec<(u64, Vec<ListingRecord>)>,
    pub next_handle: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, inode: u64) -> ListingRecord {
        ListingRecord {
            name: name.to_string(),
            inode,
            kind: DirentKind::Regular,
        }
    }

    #[test]
    fn test_insert_slice_release() {
        let handles = DirectoryHandles::new();
        let handle = handles.insert(vec![record("a", 1), record("b", 2), record("c", 3)]);

        let all = handles.slice(handle, 0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].1.name, "a");

        let tail = handles.slice(handle, 2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 2);
        assert_eq!(tail[0].1.name, "c");

        assert!(handles.slice(handle, 5).unwrap().is_empty());
        assert!(handles.release(handle));
        assert!(handles.slice(handle, 0).is_none());
        assert!(!handles.release(handle));
    }

    #[test]
    fn test_save_restore_keeps_handles_and_counter() {
        let handles = DirectoryHandles::new();
        let h1 = handles.insert(vec![record("x", 1)]);
        let saved = handles.save();

        let restored = DirectoryHandles::new();
        restored.restore(&saved);
        assert_eq!(restored.slice(h1, 0).unwrap().len(), 1);
        let h2 = restored.insert(vec![]);
        assert!(h2 > h1);
    }
}
