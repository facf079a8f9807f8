//! The inode tracker.
//!
//! A reference-counted bidirectional map between kernel-visible inodes
//! and repository paths. Every successful lookup increments the count
//! (`vfs_get`), every kernel `forget` decrements it (`vfs_put`); entries
//! disappear at zero. The tracker is what keeps inode numbers stable
//! across catalog reloads: a path looked up again after a revision swap
//! reuses its live inode as long as the kernel still holds it.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use cvmfs_types::RepoPath;

/// Current version of the serialized tracker state.
pub const TRACKER_STATE_VERSION: u32 = 3;

#[derive(Default)]
struct TrackerInner {
    by_inode: HashMap<u64, (RepoPath, u32)>,
    by_path: HashMap<RepoPath, u64>,
}

/// Bidirectional refcounted inode ↔ path map.
#[derive(Default)]
pub struct InodeTracker {
    inner: Mutex<TrackerInner>,
}

impl InodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one kernel reference for `inode` at `path`.
    pub fn vfs_get(&self, inode: u64, path: &RepoPath) {
        let mut inner = self.inner.lock().unwrap();
        match inner.by_inode.get_mut(&inode) {
            Some((_, refs)) => *refs += 1,
            None => {
                inner.by_inode.insert(inode, (path.clone(), 1));
                inner.by_path.insert(path.clone(), inode);
            }
        }
    }

    /// Drop `by` kernel references. Returns `true` if the entry reached
    /// zero and was removed (the caller then invalidates its metadata
    /// cache entries for this inode).
    pub fn vfs_put(&self, inode: u64, by: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some((path, refs)) = inner.by_inode.get_mut(&inode) else {
            return false;
        };
        if *refs > by {
            *refs -= by;
            return false;
        }
        let path = path.clone();
        inner.by_inode.remove(&inode);
        // Only remove the reverse entry if it still points at us; a
        // fresher inode may have taken the path after a reload.
        if inner.by_path.get(&path) == Some(&inode) {
            inner.by_path.remove(&path);
        }
        true
    }

    pub fn find_path(&self, inode: u64) -> Option<RepoPath> {
        let inner = self.inner.lock().unwrap();
        inner.by_inode.get(&inode).map(|(path, _)| path.clone())
    }

    pub fn find_inode(&self, path: &RepoPath) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for process hand-over.
    pub fn save(&self) -> SavedTracker {
        let inner = self.inner.lock().unwrap();
        SavedTracker {
            version: TRACKER_STATE_VERSION,
            entries: inner
                .by_inode
                .iter()
                .map(|(&inode, (path, refs))| SavedTrackerEntry {
                    inode,
                    path: path.to_string(),
                    references: *refs,
                })
                .collect(),
        }
    }

    /// Restore a snapshot, migrating older representations.
    pub fn restore(&self, saved: &SavedTracker) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_inode.clear();
        inner.by_path.clear();
        for entry in &saved.entries {
            let Ok(path) = RepoPath::new(&entry.path) else {
                continue;
            };
            // Version 2 predates per-entry reference counts; such entries
            // restore with a single reference.
            let refs = if saved.version < 3 {
                1
            } else {
                entry.references
            };
            inner.by_inode.insert(entry.inode, (path.clone(), refs));
            inner.by_path.insert(path, entry.inode);
        }
    }
}

/// Serialized tracker state, tagged for migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTracker {
    pub version: u32,
    pub entries: Vec<SavedTrackerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTrackerEntry {
    pub inode: u64,
    pub path: String,
    #[serde(default = "default_references")]
    pub references: u32,
}

fn default_references() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RepoPath {
        RepoPath::new(s).unwrap()
    }

    #[test]
    fn test_get_put_lifecycle() {
        let tracker = InodeTracker::new();
        tracker.vfs_get(300, &path("/a"));
        tracker.vfs_get(300, &path("/a"));
        assert_eq!(tracker.find_path(300), Some(path("/a")));
        assert_eq!(tracker.find_inode(&path("/a")), Some(300));

        assert!(!tracker.vfs_put(300, 1));
        assert!(tracker.vfs_put(300, 1));
        assert_eq!(tracker.find_path(300), None);
        assert_eq!(tracker.find_inode(&path("/a")), None);
    }

    #[test]
    fn test_put_more_than_held_removes() {
        let tracker = InodeTracker::new();
        tracker.vfs_get(300, &path("/a"));
        assert!(tracker.vfs_put(300, 10));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_put_unknown_inode_is_noop() {
        let tracker = InodeTracker::new();
        assert!(!tracker.vfs_put(999, 1));
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let tracker = InodeTracker::new();
        tracker.vfs_get(300, &path("/a"));
        tracker.vfs_get(300, &path("/a"));
        tracker.vfs_get(301, &path("/b"));

        let saved = tracker.save();
        let restored = InodeTracker::new();
        restored.restore(&saved);

        assert_eq!(restored.find_inode(&path("/a")), Some(300));
        // Reference counts survive: one put must not drop the entry.
        assert!(!restored.vfs_put(300, 1));
        assert!(restored.vfs_put(300, 1));
    }

    #[test]
    fn test_restore_migrates_v2_counts() {
        let saved = SavedTracker {
            version: 2,
            entries: vec![SavedTrackerEntry {
                inode: 300,
                path: "/a".to_string(),
                references: 99,
            }],
        };
        let tracker = InodeTracker::new();
        tracker.restore(&saved);
        // v2 entries restore with one reference regardless of payload.
        assert!(tracker.vfs_put(300, 1));
    }
}
