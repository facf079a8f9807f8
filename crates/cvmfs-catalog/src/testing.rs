//! Repository fixtures for tests.
//!
//! [`CatalogBuilder`] assembles a catalog SQLite database entry by entry;
//! [`RepoPublisher`] compresses objects and catalogs into an origin
//! directory laid out like an HTTP server, ready to be served through a
//! `DirDownloader`.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use cvmfs_cache::compress_bytes;
use cvmfs_types::{ContentDigest, FileChunk, RepoPath};

use crate::manifest::{Manifest, MANIFEST_NAME};
use crate::sql::flags;

struct EntrySpec {
    path: String,
    entry_flags: i64,
    size: u64,
    mode: u32,
    mtime: i64,
    hash: Option<ContentDigest>,
    symlink: Option<String>,
    hardlink: u64,
}

/// Builds one catalog database.
pub struct CatalogBuilder {
    root_path: String,
    revision: u64,
    ttl: u64,
    previous: Option<ContentDigest>,
    entries: Vec<EntrySpec>,
    nested: Vec<(String, ContentDigest)>,
    chunks: Vec<(String, Vec<FileChunk>)>,
}

impl CatalogBuilder {
    /// A catalog serving the subtree at `root_path` ("" for the root
    /// catalog). The root entry is inserted automatically as row 1.
    pub fn new(root_path: &str) -> Self {
        Self {
            root_path: root_path.to_string(),
            revision: 1,
            ttl: 900,
            previous: None,
            entries: Vec::new(),
            nested: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn previous_revision(mut self, digest: ContentDigest) -> Self {
        self.previous = Some(digest);
        self
    }

    pub fn add_dir(mut self, path: &str) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::DIR,
            size: 0,
            mode: 0o755,
            mtime: 1700000000,
            hash: None,
            symlink: None,
            hardlink: 0,
        });
        self
    }

    /// A directory entry that mounts a nested catalog.
    pub fn add_mountpoint(mut self, path: &str, catalog_digest: ContentDigest) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::DIR | flags::NESTED_MOUNTPOINT,
            size: 0,
            mode: 0o755,
            mtime: 1700000000,
            hash: None,
            symlink: None,
            hardlink: 0,
        });
        self.nested.push((path.to_string(), catalog_digest));
        self
    }

    pub fn add_file(mut self, path: &str, digest: ContentDigest, size: u64) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::FILE,
            size,
            mode: 0o644,
            mtime: 1700000000,
            hash: Some(digest),
            symlink: None,
            hardlink: 0,
        });
        self
    }

    pub fn add_hardlink(mut self, path: &str, digest: ContentDigest, size: u64, group: u64) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::FILE,
            size,
            mode: 0o644,
            mtime: 1700000000,
            hash: Some(digest),
            symlink: None,
            hardlink: group,
        });
        self
    }

    pub fn add_symlink(mut self, path: &str, target: &str) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::LINK,
            size: 0,
            mode: 0o777,
            mtime: 1700000000,
            hash: None,
            symlink: Some(target.to_string()),
            hardlink: 0,
        });
        self
    }

    /// A chunked regular file; `digest` is the whole-file digest recorded
    /// in the entry, the chunk digests live in the chunks table.
    pub fn add_chunked_file(
        mut self,
        path: &str,
        digest: ContentDigest,
        size: u64,
        chunks: Vec<FileChunk>,
    ) -> Self {
        self.entries.push(EntrySpec {
            path: path.to_string(),
            entry_flags: flags::FILE | flags::CHUNKED,
            size,
            mode: 0o644,
            mtime: 1700000000,
            hash: Some(digest),
            symlink: None,
            hardlink: 0,
        });
        self.chunks.push((path.to_string(), chunks));
        self
    }

    /// Write the catalog database to `db_path`.
    pub fn build_db(&self, db_path: &Path) {
        let conn = Connection::open(db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE catalog (md5path_1 INTEGER, md5path_2 INTEGER, \
               parent_1 INTEGER, parent_2 INTEGER, hardlink INTEGER, hash BLOB, \
               size INTEGER, mode INTEGER, mtime INTEGER, flags INTEGER, \
               name TEXT, symlink TEXT, uid INTEGER, gid INTEGER, \
               CONSTRAINT pk_catalog PRIMARY KEY (md5path_1, md5path_2)); \
             CREATE INDEX idx_catalog_parent ON catalog (parent_1, parent_2); \
             CREATE TABLE chunks (md5path_1 INTEGER, md5path_2 INTEGER, \
               offset INTEGER, size INTEGER, hash BLOB, \
               CONSTRAINT pk_chunks PRIMARY KEY (md5path_1, md5path_2, offset)); \
             CREATE TABLE nested_catalogs (path TEXT, sha1 TEXT, \
               CONSTRAINT pk_nested_catalogs PRIMARY KEY (path)); \
             CREATE TABLE properties (key TEXT, value TEXT, \
               CONSTRAINT pk_properties PRIMARY KEY (key));",
        )
        .unwrap();

        // Root entry first so the root catalog's root directory lands on
        // row id 1.
        let nested_root_flag = if self.root_path.is_empty() {
            0
        } else {
            flags::NESTED_ROOT
        };
        let mut counters = (0u64, 1u64, 0u64); // regular, dir, symlink
        Self::insert_entry(
            &conn,
            &EntrySpec {
                path: self.root_path.clone(),
                entry_flags: flags::DIR | nested_root_flag,
                size: 0,
                mode: 0o755,
                mtime: 1700000000,
                hash: None,
                symlink: None,
                hardlink: 0,
            },
        );

        for entry in &self.entries {
            Self::insert_entry(&conn, entry);
            if entry.entry_flags & flags::DIR != 0 {
                counters.1 += 1;
            } else if entry.entry_flags & flags::LINK != 0 {
                counters.2 += 1;
            } else {
                counters.0 += 1;
            }
        }

        for (path, chunks) in &self.chunks {
            let md5 = RepoPath::new(path).unwrap().md5();
            let (hi, lo) = md5.to_columns();
            for chunk in chunks {
                conn.execute(
                    "INSERT INTO chunks VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        hi,
                        lo,
                        chunk.offset as i64,
                        chunk.size as i64,
                        chunk.digest.0.to_vec()
                    ],
                )
                .unwrap();
            }
        }

        for (path, digest) in &self.nested {
            conn.execute(
                "INSERT INTO nested_catalogs VALUES (?1, ?2)",
                params![path, digest.to_hex()],
            )
            .unwrap();
        }

        let mut set_property = |key: &str, value: String| {
            conn.execute(
                "INSERT OR REPLACE INTO properties VALUES (?1, ?2)",
                params![key, value],
            )
            .unwrap();
        };
        set_property("schema", "2.5".to_string());
        set_property("schema_revision", "1".to_string());
        set_property("revision", self.revision.to_string());
        set_property("TTL", self.ttl.to_string());
        set_property("root_prefix", self.root_path.clone());
        if let Some(previous) = &self.previous {
            set_property("previous_revision", previous.to_hex());
        }
        set_property("counter_regular", counters.0.to_string());
        set_property("counter_dir", counters.1.to_string());
        set_property("counter_symlink", counters.2.to_string());
    }

    fn insert_entry(conn: &Connection, entry: &EntrySpec) {
        let path = RepoPath::new(&entry.path).unwrap();
        let (md5_hi, md5_lo) = path.md5().to_columns();
        let (parent_hi, parent_lo) = if path.is_root() {
            (0, 0)
        } else {
            path.parent().md5().to_columns()
        };
        conn.execute(
            "INSERT INTO catalog (md5path_1, md5path_2, parent_1, parent_2, hardlink, \
               hash, size, mode, mtime, flags, name, symlink, uid, gid) \
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0)",
            params![
                md5_hi,
                md5_lo,
                parent_hi,
                parent_lo,
                entry.hardlink as i64,
                entry.hash.map(|h| h.0.to_vec()),
                entry.size as i64,
                entry.mode as i64,
                entry.mtime,
                entry.entry_flags,
                path.file_name(),
                entry.symlink,
            ],
        )
        .unwrap();
    }
}

/// Publishes objects and catalogs into an origin directory served by a
/// `DirDownloader`.
pub struct RepoPublisher {
    origin: PathBuf,
    fqrn: String,
}

impl RepoPublisher {
    pub fn new(origin: impl Into<PathBuf>, fqrn: &str) -> Self {
        let origin = origin.into();
        fs::create_dir_all(origin.join("data")).unwrap();
        Self {
            origin,
            fqrn: fqrn.to_string(),
        }
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    fn store(&self, compressed: &[u8], suffix: &str) -> ContentDigest {
        let digest = ContentDigest::from_bytes(compressed);
        let path = self
            .origin
            .join("data")
            .join(digest.make_object_path(suffix));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, compressed).unwrap();
        digest
    }

    /// Compress and store a data object; returns its digest.
    pub fn publish_object(&self, plain: &[u8]) -> ContentDigest {
        self.store(&compress_bytes(plain).unwrap(), "")
    }

    /// Split `plain` into fixed-size pieces, publish each as an object
    /// and return the chunk list.
    pub fn publish_chunked(&self, plain: &[u8], chunk_size: usize) -> Vec<FileChunk> {
        plain
            .chunks(chunk_size)
            .enumerate()
            .map(|(idx, piece)| FileChunk {
                offset: (idx * chunk_size) as u64,
                size: piece.len() as u64,
                digest: self.publish_object(piece),
            })
            .collect()
    }

    /// Build, compress and store a catalog; returns its digest.
    pub fn publish_catalog(&self, builder: &CatalogBuilder) -> ContentDigest {
        let db_path = self.origin.join(format!(
            "tmp_catalog_{}",
            std::process::id() as u64 ^ self.origin.as_os_str().len() as u64
        ));
        let _ = fs::remove_file(&db_path);
        builder.build_db(&db_path);
        let raw = fs::read(&db_path).unwrap();
        fs::remove_file(&db_path).unwrap();
        self.store(&compress_bytes(&raw).unwrap(), "C")
    }

    /// Write the manifest pointing at `root_catalog`.
    pub fn publish_manifest(&self, root_catalog: ContentDigest, revision: u64, ttl: u64) {
        let manifest = Manifest {
            catalog_digest: root_catalog,
            root_path_md5: RepoPath::root().md5().to_hex(),
            revision,
            ttl,
            timestamp: 1700000000,
            repository_name: self.fqrn.clone(),
            history_digest: None,
        };
        fs::write(self.origin.join(MANIFEST_NAME), manifest.serialize()).unwrap();
    }
}
