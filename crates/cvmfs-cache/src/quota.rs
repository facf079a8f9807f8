//! Bounded-LRU accounting for the upper cache.
//!
//! The quota manager owns a small SQLite database (`cachedb`) inside the
//! cache root, one row per resident object: digest, size, last-access
//! sequence number, description and pin flag. When the total size crosses
//! the capacity, unpinned rows are evicted in ascending access order until
//! the total drops to half the capacity.
//!
//! A corrupt database, or a `running.<fqrn>` sentinel left behind by a
//! crashed predecessor, triggers an automatic rebuild: the database is
//! discarded and repopulated by scanning the shard directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use cvmfs_types::ContentDigest;

use crate::backend::{BlessedObject, QuotaObserver};
use crate::{CacheError, Result};

/// File name of the LRU database inside the cache root.
pub const LRU_DB_NAME: &str = "cachedb";

const SCHEMA_VERSION: &str = "1.0";

/// Capacity sentinel for an unrestricted but still tracked cache.
pub const CAPACITY_UNRESTRICTED: u64 = u64::MAX;

/// One row of the LRU database.
#[derive(Debug, Clone)]
pub struct LruEntry {
    pub digest: ContentDigest,
    pub size: u64,
    pub acseq: i64,
    pub description: String,
    pub pinned: bool,
}

struct QuotaState {
    conn: Connection,
    gauge: u64,
    pinned_gauge: u64,
    next_seq: i64,
}

/// LRU bookkeeping over the upper cache directory.
///
/// `capacity == 0` disables management entirely (bypass mode): every
/// operation becomes a no-op and `size()` reports 0.
pub struct QuotaManager {
    cache_root: PathBuf,
    capacity: u64,
    state: Mutex<Option<QuotaState>>,
}

impl QuotaManager {
    /// Open or create the LRU database. `rebuild` forces the directory
    /// scan (set when the previous process did not shut down cleanly).
    pub fn new(cache_root: impl Into<PathBuf>, capacity: u64, rebuild: bool) -> Result<Self> {
        let cache_root = cache_root.into();
        if capacity == 0 {
            debug!("quota manager bypassed (capacity 0)");
            return Ok(Self {
                cache_root,
                capacity,
                state: Mutex::new(None),
            });
        }

        let db_path = cache_root.join(LRU_DB_NAME);
        let conn = match Self::try_open(&db_path) {
            Ok(conn) if !rebuild => conn,
            Ok(conn) => {
                drop(conn);
                Self::rebuild_db(&cache_root, &db_path)?
            }
            Err(e) => {
                warn!(error = %e, "LRU database unusable, starting automatic rebuild");
                Self::rebuild_db(&cache_root, &db_path)?
            }
        };

        let (gauge, pinned_gauge, next_seq) = Self::load_gauges(&conn)?;
        Ok(Self {
            cache_root,
            capacity,
            state: Mutex::new(Some(QuotaState {
                conn,
                gauge,
                pinned_gauge,
                next_seq,
            })),
        })
    }

    /// Open and sanity-check an existing database. Any schema or
    /// integrity failure is reported as an error so the caller rebuilds.
    fn try_open(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        let ok: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if ok != "ok" {
            return Err(CacheError::NotFound(format!(
                "integrity check failed: {ok}"
            )));
        }
        Self::init_schema(&conn)?;
        // Exercise the column-bound statements once; a bad schema from an
        // older client shows up here instead of at first use.
        conn.prepare("SELECT sha1, size, acseq, path, pinned FROM cache_catalog LIMIT 1")?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_catalog \
               (sha1 TEXT PRIMARY KEY, size INTEGER, acseq INTEGER, \
                path TEXT, pinned INTEGER); \
             CREATE INDEX IF NOT EXISTS idx_acseq ON cache_catalog (acseq); \
             CREATE TABLE IF NOT EXISTS properties (key TEXT PRIMARY KEY, value TEXT);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO properties (key, value) VALUES ('schema', ?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Discard the database and repopulate it from the resident files.
    fn rebuild_db(cache_root: &Path, db_path: &Path) -> Result<Connection> {
        info!("automatic rebuild of LRU database");
        let _ = fs::remove_file(db_path);
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;

        let mut seq = 0i64;
        for shard in 0..=0xffu32 {
            let shard_dir = cache_root.join(format!("{shard:02x}"));
            let entries = match fs::read_dir(&shard_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let meta = match entry.metadata() {
                    Ok(meta) if meta.is_file() => meta,
                    _ => continue,
                };
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let hex = format!("{shard:02x}{name}");
                let Ok(digest) = ContentDigest::from_hex(&hex) else {
                    continue;
                };
                conn.execute(
                    "INSERT OR REPLACE INTO cache_catalog \
                       (sha1, size, acseq, path, pinned) VALUES (?1, ?2, ?3, ?4, 0)",
                    params![digest.to_hex(), meta.len() as i64, seq, "unknown (automatic rebuild)"],
                )?;
                seq += 1;
            }
        }
        info!(entries = seq, "LRU database rebuilt from cache directory");
        Ok(conn)
    }

    fn load_gauges(conn: &Connection) -> Result<(u64, u64, i64)> {
        let gauge: i64 = conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM cache_catalog", [], |r| {
                r.get(0)
            })?;
        let pinned: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM cache_catalog WHERE pinned = 1",
            [],
            |r| r.get(0),
        )?;
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(acseq), 0) + 1 FROM cache_catalog",
            [],
            |r| r.get(0),
        )?;
        Ok((gauge as u64, pinned as u64, next_seq))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn size(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        guard.as_ref().map(|s| s.gauge).unwrap_or(0)
    }

    pub fn pinned_size(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        guard.as_ref().map(|s| s.pinned_gauge).unwrap_or(0)
    }

    /// Record (or refresh) an object. Crossing the capacity triggers a
    /// cleanup down to half of it.
    pub fn insert(&self, digest: &ContentDigest, size: u64, description: &str, pinned: bool) {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else { return };
        let seq = state.next_seq;
        state.next_seq += 1;
        let prev: Option<(i64, i64)> = state
            .conn
            .query_row(
                "SELECT size, pinned FROM cache_catalog WHERE sha1 = ?1",
                params![digest.to_hex()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .unwrap_or(None);
        let result = state.conn.execute(
            "INSERT OR REPLACE INTO cache_catalog (sha1, size, acseq, path, pinned) \
               VALUES (?1, ?2, ?3, ?4, ?5)",
            params![digest.to_hex(), size as i64, seq, description, pinned as i64],
        );
        if let Err(e) = result {
            warn!(error = %e, "failed to record cache object in LRU database");
            return;
        }
        if let Some((old_size, old_pinned)) = prev {
            state.gauge = state.gauge.saturating_sub(old_size as u64);
            if old_pinned != 0 {
                state.pinned_gauge = state.pinned_gauge.saturating_sub(old_size as u64);
            }
        }
        state.gauge += size;
        if pinned {
            state.pinned_gauge += size;
        }

        if self.capacity != CAPACITY_UNRESTRICTED && state.gauge > self.capacity {
            let target = self.capacity / 2;
            if let Err(e) = Self::evict_to(&self.cache_root, state, target) {
                warn!(error = %e, "cache cleanup failed");
            }
        }
    }

    /// Refresh the access sequence of an object.
    pub fn touch(&self, digest: &ContentDigest) {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else { return };
        let seq = state.next_seq;
        state.next_seq += 1;
        let _ = state.conn.execute(
            "UPDATE cache_catalog SET acseq = ?1 WHERE sha1 = ?2",
            params![seq, digest.to_hex()],
        );
    }

    /// Drop an object from accounting and from disk.
    pub fn remove(&self, digest: &ContentDigest) {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else { return };
        let prev: Option<(i64, i64)> = state
            .conn
            .query_row(
                "SELECT size, pinned FROM cache_catalog WHERE sha1 = ?1",
                params![digest.to_hex()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .unwrap_or(None);
        let Some((size, pinned)) = prev else { return };
        let _ = state.conn.execute(
            "DELETE FROM cache_catalog WHERE sha1 = ?1",
            params![digest.to_hex()],
        );
        let _ = fs::remove_file(self.cache_root.join(digest.cache_path()));
        state.gauge = state.gauge.saturating_sub(size as u64);
        if pinned != 0 {
            state.pinned_gauge = state.pinned_gauge.saturating_sub(size as u64);
        }
    }

    /// Exempt an object from eviction. Fails if the pinned set alone
    /// would exceed the capacity.
    pub fn pin(&self, digest: &ContentDigest, size: u64) -> bool {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return true;
        };
        if self.capacity != CAPACITY_UNRESTRICTED && state.pinned_gauge + size > self.capacity {
            return false;
        }
        let updated = state
            .conn
            .execute(
                "UPDATE cache_catalog SET pinned = 1 WHERE sha1 = ?1 AND pinned = 0",
                params![digest.to_hex()],
            )
            .unwrap_or(0);
        if updated > 0 {
            state.pinned_gauge += size;
        }
        true
    }

    pub fn unpin(&self, digest: &ContentDigest) {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else { return };
        let prev: Option<i64> = state
            .conn
            .query_row(
                "SELECT size FROM cache_catalog WHERE sha1 = ?1 AND pinned = 1",
                params![digest.to_hex()],
                |r| r.get(0),
            )
            .optional()
            .unwrap_or(None);
        let Some(size) = prev else { return };
        let _ = state.conn.execute(
            "UPDATE cache_catalog SET pinned = 0 WHERE sha1 = ?1",
            params![digest.to_hex()],
        );
        state.pinned_gauge = state.pinned_gauge.saturating_sub(size as u64);
    }

    /// Evict least-recently-used unpinned objects until the total size is
    /// at most `target`.
    pub fn cleanup(&self, target: u64) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        Self::evict_to(&self.cache_root, state, target)
    }

    fn evict_to(cache_root: &Path, state: &mut QuotaState, target: u64) -> Result<()> {
        if state.gauge <= target {
            return Ok(());
        }
        debug!(
            size = state.gauge,
            target, "evicting least-recently-used cache objects"
        );
        let victims: Vec<(String, i64)> = {
            let mut stmt = state.conn.prepare(
                "SELECT sha1, size FROM cache_catalog WHERE pinned = 0 ORDER BY acseq ASC",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        for (hex, size) in victims {
            if state.gauge <= target {
                break;
            }
            if let Ok(digest) = ContentDigest::from_hex(&hex) {
                let _ = fs::remove_file(cache_root.join(digest.cache_path()));
            }
            state
                .conn
                .execute("DELETE FROM cache_catalog WHERE sha1 = ?1", params![hex])?;
            state.gauge = state.gauge.saturating_sub(size as u64);
        }
        if state.gauge > target {
            return Err(CacheError::NoSpace(format!(
                "pinned entries keep cache above target ({} > {})",
                state.gauge, target
            )));
        }
        Ok(())
    }

    /// All tracked entries, most recently used last.
    pub fn list(&self) -> Vec<LruEntry> {
        let guard = self.state.lock().unwrap();
        let Some(state) = guard.as_ref() else {
            return Vec::new();
        };
        let Ok(mut stmt) = state.conn.prepare(
            "SELECT sha1, size, acseq, path, pinned FROM cache_catalog ORDER BY acseq ASC",
        ) else {
            return Vec::new();
        };
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        });
        let Ok(rows) = rows else { return Vec::new() };
        rows.filter_map(|r| r.ok())
            .filter_map(|(hex, size, acseq, path, pinned)| {
                Some(LruEntry {
                    digest: ContentDigest::from_hex(&hex).ok()?,
                    size: size as u64,
                    acseq,
                    description: path,
                    pinned: pinned != 0,
                })
            })
            .collect()
    }
}

impl QuotaObserver for QuotaManager {
    fn on_insert(&self, object: &BlessedObject, size: u64) {
        self.insert(&object.digest, size, &object.description, object.pinned);
    }

    fn on_touch(&self, digest: &ContentDigest) {
        self.touch(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn digest(n: u8) -> ContentDigest {
        ContentDigest::from_bytes(&[n])
    }

    fn seed_cache_file(root: &Path, digest: &ContentDigest, size: usize) {
        let path = root.join(digest.cache_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; size]).unwrap();
    }

    #[test]
    fn test_insert_and_size() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
        quota.insert(&digest(1), 100, "/a", false);
        quota.insert(&digest(2), 200, "/b", false);
        assert_eq!(quota.size(), 300);
    }

    #[test]
    fn test_eviction_in_access_order() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
        for n in 1..=4 {
            seed_cache_file(dir.path(), &digest(n), 100);
            quota.insert(&digest(n), 100, "/f", false);
        }
        // Touch the oldest so it survives the cleanup.
        quota.touch(&digest(1));
        quota.cleanup(200).unwrap();
        assert_eq!(quota.size(), 200);
        let remaining: Vec<_> = quota.list().iter().map(|e| e.digest).collect();
        assert!(remaining.contains(&digest(1)));
        assert!(remaining.contains(&digest(4)));
        assert!(!dir.path().join(digest(2).cache_path()).exists());
    }

    #[test]
    fn test_pinned_entries_survive_cleanup() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
        for n in 1..=3 {
            seed_cache_file(dir.path(), &digest(n), 100);
            quota.insert(&digest(n), 100, "/f", false);
        }
        assert!(quota.pin(&digest(1), 100));
        quota.cleanup(100).unwrap();
        let remaining: Vec<_> = quota.list().iter().map(|e| e.digest).collect();
        assert_eq!(remaining, vec![digest(1)]);
        assert_eq!(quota.pinned_size(), 100);
    }

    #[test]
    fn test_insert_past_capacity_triggers_cleanup() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 250, false).unwrap();
        for n in 1..=3 {
            seed_cache_file(dir.path(), &digest(n), 100);
            quota.insert(&digest(n), 100, "/f", false);
        }
        // High watermark crossed at the third insert; target is 125.
        assert!(quota.size() <= 125);
    }

    #[test]
    fn test_corrupt_db_rebuilds_from_directory() {
        let dir = TempDir::new().unwrap();
        seed_cache_file(dir.path(), &digest(7), 42);
        fs::write(dir.path().join(LRU_DB_NAME), b"this is not sqlite").unwrap();

        let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
        assert_eq!(quota.size(), 42);
        let entries = quota.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, digest(7));
        assert!(!entries[0].pinned);
    }

    #[test]
    fn test_forced_rebuild_after_crash() {
        let dir = TempDir::new().unwrap();
        {
            let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
            quota.insert(&digest(1), 999, "/stale", false);
        }
        seed_cache_file(dir.path(), &digest(2), 10);
        let quota = QuotaManager::new(dir.path(), 1000, true).unwrap();
        // Rebuild only sees what is actually on disk.
        assert_eq!(quota.size(), 10);
    }

    #[test]
    fn test_bypass_mode() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 0, false).unwrap();
        quota.insert(&digest(1), 100, "/a", false);
        assert_eq!(quota.size(), 0);
        assert_eq!(quota.capacity(), 0);
        assert!(!dir.path().join(LRU_DB_NAME).exists());
    }

    #[test]
    fn test_remove_unlinks_file() {
        let dir = TempDir::new().unwrap();
        let quota = QuotaManager::new(dir.path(), 1000, false).unwrap();
        seed_cache_file(dir.path(), &digest(3), 50);
        quota.insert(&digest(3), 50, "/f", false);
        quota.remove(&digest(3));
        assert_eq!(quota.size(), 0);
        assert!(!dir.path().join(digest(3).cache_path()).exists());
    }
}
