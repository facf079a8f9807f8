//! Graceful process hand-over.
//!
//! Before replacement, the engine enters maintenance mode, waits out one
//! kernel cache timeout and serializes its logical state: directory
//! handles, inode tracker, chunk tables, inode generation info and the
//! open-files counter. The successor restores the snapshot, bumps the
//! incarnation and continues serving the same kernel-visible handles.
//! Versioned tags let a newer client migrate an older snapshot.

use serde::{Deserialize, Serialize};

use crate::chunks::SavedChunkTables;
use crate::dirhandles::SavedDirHandles;
use crate::engine::Engine;
use crate::tracker::SavedTracker;

/// Version of the hand-over container format.
pub const STATE_VERSION: u32 = 2;

/// Inode generation bookkeeping carried across incarnations so reissued
/// inodes never collide with stale kernel-held ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InodeGenerationInfo {
    pub version: u32,
    pub initial_revision: u64,
    pub incarnation: u32,
    pub inode_generation: u64,
}

/// The complete serialized engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedState {
    pub version: u32,
    pub open_dirs: SavedDirHandles,
    pub inode_tracker: SavedTracker,
    pub chunk_tables: SavedChunkTables,
    pub inode_generation: InodeGenerationInfo,
    pub open_files_counter: u32,
}

impl Engine {
    /// Serialize the logical state. The caller has already entered
    /// maintenance mode and drained the kernel caches.
    pub fn save_state(&self) -> SavedState {
        let mut generation_info = *self.incarnation.lock().unwrap();
        // Fold the issued inode ranges into the generation so the
        // successor's annotation clears everything we ever handed out.
        generation_info.inode_generation += self.catalog_mgr().inode_gauge();

        SavedState {
            version: STATE_VERSION,
            open_dirs: self.dir_handles.save(),
            inode_tracker: self.tracker.save(),
            chunk_tables: self.chunk_tables.save(),
            inode_generation: generation_info,
            open_files_counter: self.open_files_count(),
        }
    }

    /// Restore a predecessor's snapshot into this engine. Called before
    /// the kernel adapter starts delivering requests.
    pub fn restore_state(&self, saved: &SavedState) {
        self.dir_handles.restore(&saved.open_dirs);
        self.set_open_dirs_count(saved.open_dirs.handles.len() as u32);
        self.tracker.restore(&saved.inode_tracker);
        self.chunk_tables.restore(&saved.chunk_tables);
        self.set_open_files_count(saved.open_files_counter);

        let mut generation_info = self.incarnation.lock().unwrap();
        *generation_info = saved.inode_generation;
        generation_info.incarnation += 1;
        self.annotation()
            .inc_generation(generation_info.inode_generation);
    }

    /// Serialize to a JSON blob (what the loader stashes between
    /// incarnations).
    pub fn save_state_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.save_state())
    }

    pub fn restore_state_json(&self, raw: &str) -> serde_json::Result<()> {
        let saved: SavedState = serde_json::from_str(raw)?;
        self.restore_state(&saved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_info_roundtrip() {
        let info = InodeGenerationInfo {
            version: STATE_VERSION,
            initial_revision: 7,
            incarnation: 2,
            inode_generation: 1234,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: InodeGenerationInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.incarnation, 2);
        assert_eq!(back.inode_generation, 1234);
    }
}
