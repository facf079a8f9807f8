//! A single attached catalog database.
//!
//! Catalogs are immutable SQLite files opened read-only from the cache.
//! Statement execution is serialized by a mutex around the connection.
//! Attached catalogs form a tree: the parent owns its children, the child
//! keeps a non-owning handle to its parent for the mountpoint transition
//! fix-up.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use cvmfs_types::{
    ContentDigest, DirectoryEntry, FileChunk, FileChunkList, Md5Digest, OwnerMap, RepoPath,
};

use crate::inode::{InodeGenerationAnnotation, InodeRange};
use crate::sql;
use crate::{CatalogError, Result};

/// TTL reported when a catalog carries no TTL property, seconds.
pub const DEFAULT_TTL: u64 = 3600;

/// Aggregated entry counts of one catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub regular: u64,
    pub dir: u64,
    pub symlink: u64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        self.regular + self.dir + self.symlink
    }
}

/// One attached catalog database.
pub struct Catalog {
    conn: Mutex<Connection>,
    mountpoint: RepoPath,
    digest: ContentDigest,
    parent: Option<Weak<Catalog>>,
    children: Mutex<HashMap<RepoPath, Arc<Catalog>>>,
    inode_range: OnceLock<InodeRange>,
    annotation: Option<Arc<InodeGenerationAnnotation>>,
    uid_map: Arc<OwnerMap>,
    gid_map: Arc<OwnerMap>,
    /// Canonical inode per hardlink group, fixed by first materialization.
    hardlink_groups: Mutex<HashMap<u64, u64>>,
    max_row_id: u64,
    counters: Counters,
    schema_version: f64,
}

impl Catalog {
    /// Open a catalog database file (read-only) and attach it below
    /// `parent`. The inode range is assigned separately by the manager
    /// before the catalog is published to the tree.
    pub fn open(
        db_path: &Path,
        mountpoint: RepoPath,
        digest: ContentDigest,
        parent: Option<&Arc<Catalog>>,
        annotation: Option<Arc<InodeGenerationAnnotation>>,
        uid_map: Arc<OwnerMap>,
        gid_map: Arc<OwnerMap>,
    ) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let max_row_id: i64 = conn.query_row(sql::SQL_MAX_ROW_ID, [], |r| r.get(0))?;
        let schema_version = Self::read_property(&conn, "schema")?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0);
        let counters = Self::read_counters(&conn, schema_version)?;
        debug!(mountpoint = %mountpoint, digest = %digest, max_row_id,
               "attached catalog");
        Ok(Self {
            conn: Mutex::new(conn),
            mountpoint,
            digest,
            parent: parent.map(Arc::downgrade),
            children: Mutex::new(HashMap::new()),
            inode_range: OnceLock::new(),
            annotation,
            uid_map,
            gid_map,
            hardlink_groups: Mutex::new(HashMap::new()),
            max_row_id: max_row_id as u64,
            counters,
            schema_version,
        })
    }

    fn read_property(conn: &Connection, key: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(sql::SQL_PROPERTY, params![key], |r| r.get::<_, String>(0))
            .optional()?)
    }

    fn read_counters(conn: &Connection, schema_version: f64) -> Result<Counters> {
        if schema_version >= sql::FIRST_SCHEMA_WITH_COUNTERS {
            let read = |key: &str| -> Result<u64> {
                Ok(Self::read_property(conn, key)?
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0))
            };
            let counters = Counters {
                regular: read("counter_regular")?,
                dir: read("counter_dir")?,
                symlink: read("counter_symlink")?,
            };
            if counters.total() > 0 {
                return Ok(counters);
            }
        }
        // Legacy schema: derive the counters by aggregation.
        let count_flag = |flag: i64| -> Result<u64> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM catalog WHERE (flags & ?1) != 0",
                params![flag],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        };
        Ok(Counters {
            regular: count_flag(sql::flags::FILE)?,
            dir: count_flag(sql::flags::DIR)?,
            symlink: count_flag(sql::flags::LINK)?,
        })
    }

    pub fn mountpoint(&self) -> &RepoPath {
        &self.mountpoint
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn max_row_id(&self) -> u64 {
        self.max_row_id
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn schema_version(&self) -> f64 {
        self.schema_version
    }

    /// Assigned once by the manager right after `open`, before the catalog
    /// becomes reachable through the tree.
    pub fn set_inode_range(&self, range: InodeRange) {
        let _ = self.inode_range.set(range);
    }

    pub fn inode_range(&self) -> InodeRange {
        self.inode_range.get().copied().unwrap_or_default()
    }

    /// The runtime inode of a row. The first materialized member of a
    /// hardlink group fixes the inode for the whole group.
    pub fn inode_for_row(&self, row_id: u64, hardlink_group: u64) -> u64 {
        let mut inode = row_id + self.inode_range().offset;
        if hardlink_group > 0 {
            let mut groups = self.hardlink_groups.lock().unwrap();
            inode = *groups.entry(hardlink_group).or_insert(inode);
        }
        match &self.annotation {
            Some(annotation) => annotation.annotate(inode),
            None => inode,
        }
    }

    /// Whether an annotated inode belongs to this catalog's range.
    pub fn owns_inode(&self, inode: u64) -> bool {
        let raw = match &self.annotation {
            Some(annotation) => annotation.strip(inode),
            None => inode,
        };
        self.inode_range().contains(raw)
    }

    /// Look up an entry by path. `path` is needed alongside its MD5 for
    /// the mountpoint transition fix-up.
    pub fn lookup_md5(&self, md5: &Md5Digest) -> Result<Option<DirectoryEntry>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            let (hi, lo) = md5.to_columns();
            conn.query_row(sql::SQL_LOOKUP_MD5, params![hi, lo], |row| {
                sql::decode_dirent(row, &self.uid_map, &self.gid_map)
            })
            .optional()?
        };
        let Some(row) = row else { return Ok(None) };
        let mut dirent = row.dirent;
        dirent.inode = self.inode_for_row(row.row_id, dirent.hardlink_group);
        self.fix_transition_point(md5, &mut dirent)?;
        Ok(Some(dirent))
    }

    /// List the children of the directory at `path`.
    pub fn listing(&self, path: &RepoPath) -> Result<Vec<DirectoryEntry>> {
        let rows = {
            let conn = self.conn.lock().unwrap();
            let (hi, lo) = path.md5().to_columns();
            let mut stmt = conn.prepare_cached(sql::SQL_LISTING)?;
            let rows = stmt.query_map(params![hi, lo], |row| {
                sql::decode_dirent(row, &self.uid_map, &self.gid_map)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut listing = Vec::with_capacity(rows.len());
        for row in rows {
            let mut dirent = row.dirent;
            dirent.inode = self.inode_for_row(row.row_id, dirent.hardlink_group);
            if dirent.is_nested_root {
                let md5 = path.join(&dirent.name)?.md5();
                self.fix_transition_point(&md5, &mut dirent)?;
            }
            listing.push(dirent);
        }
        Ok(listing)
    }

    /// The chunk list of a chunked regular file.
    pub fn chunk_list(&self, md5: &Md5Digest) -> Result<FileChunkList> {
        let conn = self.conn.lock().unwrap();
        let (hi, lo) = md5.to_columns();
        let mut stmt = conn.prepare_cached(sql::SQL_CHUNKS)?;
        let rows = stmt.query_map(params![hi, lo], sql::decode_chunk)?;
        let chunks: Vec<FileChunk> = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(FileChunkList::new(chunks))
    }

    /// The digest of the nested catalog mounted at `mountpoint`, if any.
    pub fn find_nested(&self, mountpoint: &RepoPath) -> Result<Option<ContentDigest>> {
        let conn = self.conn.lock().unwrap();
        let hex: Option<String> = conn
            .query_row(sql::SQL_NESTED_LOOKUP, params![mountpoint.as_str()], |r| {
                r.get(0)
            })
            .optional()?;
        match hex {
            Some(hex) => Ok(Some(ContentDigest::from_hex(&hex).map_err(|_| {
                CatalogError::BadManifest(format!("bad nested catalog digest {hex}"))
            })?)),
            None => Ok(None),
        }
    }

    /// All nested catalog references of this catalog.
    pub fn list_nested(&self) -> Result<Vec<(RepoPath, ContentDigest)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(sql::SQL_NESTED_LISTING)?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (path, hex) = row?;
            let digest = ContentDigest::from_hex(&hex).map_err(|_| {
                CatalogError::BadManifest(format!("bad nested catalog digest {hex}"))
            })?;
            result.push((RepoPath::new(&path)?, digest));
        }
        Ok(result)
    }

    /// The deepest nested-catalog mountpoint that is a prefix of `path`,
    /// from this catalog's own nested table.
    pub fn find_nested_for_path(&self, path: &RepoPath) -> Result<Option<(RepoPath, ContentDigest)>> {
        let mut best: Option<(RepoPath, ContentDigest)> = None;
        for (mountpoint, digest) in self.list_nested()? {
            if path.starts_with(&mountpoint)
                && best
                    .as_ref()
                    .map(|(b, _)| mountpoint.len() > b.len())
                    .unwrap_or(true)
            {
                best = Some((mountpoint, digest));
            }
        }
        Ok(best)
    }

    pub fn ttl(&self) -> u64 {
        let conn = self.conn.lock().unwrap();
        Self::read_property(&conn, "TTL")
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL)
    }

    pub fn revision(&self) -> u64 {
        let conn = self.conn.lock().unwrap();
        Self::read_property(&conn, "revision")
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn previous_revision(&self) -> Option<ContentDigest> {
        let conn = self.conn.lock().unwrap();
        Self::read_property(&conn, "previous_revision")
            .ok()
            .flatten()
            .and_then(|hex| ContentDigest::from_hex(&hex).ok())
    }

    pub fn root_prefix(&self) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        Self::read_property(&conn, "root_prefix").ok().flatten()
    }

    // Tree plumbing, called by the manager under its tree lock.

    pub fn add_child(&self, child: Arc<Catalog>) {
        self.children
            .lock()
            .unwrap()
            .insert(child.mountpoint.clone(), child);
    }

    pub fn find_child(&self, mountpoint: &RepoPath) -> Option<Arc<Catalog>> {
        self.children.lock().unwrap().get(mountpoint).cloned()
    }

    /// The deepest loaded catalog (including `self`) serving `path`.
    pub fn find_subtree(self: &Arc<Self>, path: &RepoPath) -> Arc<Catalog> {
        let mut current = Arc::clone(self);
        loop {
            let next = {
                let children = current.children.lock().unwrap();
                children
                    .values()
                    .find(|child| path.starts_with(child.mountpoint()))
                    .cloned()
            };
            match next {
                Some(child) => current = child,
                None => return current,
            }
        }
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Catalog>> {
        self.children.lock().unwrap().values().cloned().collect()
    }

    /// Detach the whole subtree below this catalog, top-down. Children
    /// hold only weak parent references, so clearing the maps releases
    /// every catalog of the old revision.
    pub fn detach_subtree(&self) {
        let children: Vec<Arc<Catalog>> = {
            let mut map = self.children.lock().unwrap();
            map.drain().map(|(_, child)| child).collect()
        };
        for child in children {
            child.detach_subtree();
        }
    }

    /// Number of catalogs in this subtree, including `self`.
    pub fn count_subtree(&self) -> usize {
        1 + self
            .children_snapshot()
            .iter()
            .map(|child| child.count_subtree())
            .sum::<usize>()
    }

    /// Sum of owned inode-range sizes in this subtree.
    pub fn loaded_inodes(&self) -> u64 {
        self.inode_range().size
            + self
                .children_snapshot()
                .iter()
                .map(|child| child.loaded_inodes())
                .sum::<u64>()
    }

    /// At a mountpoint transition the entry recorded in the child catalog
    /// must report the inode the parent catalog assigned, so lookups and
    /// stats agree regardless of which catalog served the entry.
    fn fix_transition_point(&self, md5: &Md5Digest, dirent: &mut DirectoryEntry) -> Result<()> {
        if !dirent.is_nested_root {
            return Ok(());
        }
        let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) else {
            return Ok(());
        };
        if let Some(parent_dirent) = parent.lookup_md5(md5)? {
            dirent.inode = parent_dirent.inode;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("mountpoint", &self.mountpoint)
            .field("digest", &self.digest.to_hex())
            .field("max_row_id", &self.max_row_id)
            .finish_non_exhaustive()
    }
}
