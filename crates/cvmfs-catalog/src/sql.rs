//! Catalog schema constants and row decoding.
//!
//! The `catalog` table keys rows by the MD5 of the full path, split into
//! two signed 64-bit columns. A flags bitfield encodes the entry kind and
//! the nested-catalog markers; chunk lists live in a separate `chunks`
//! table keyed the same way.

use rusqlite::Row;

use cvmfs_types::{ContentDigest, DirectoryEntry, DirentKind, FileChunk, OwnerMap};

/// Flags bitfield values of the `catalog.flags` column.
pub mod flags {
    pub const DIR: i64 = 1;
    pub const NESTED_MOUNTPOINT: i64 = 2;
    pub const FILE: i64 = 4;
    pub const LINK: i64 = 8;
    pub const NESTED_ROOT: i64 = 32;
    pub const CHUNKED: i64 = 64;
}

pub const SQL_LOOKUP_MD5: &str = "SELECT hash, hardlink, size, mode, mtime, flags, name, symlink, \
     uid, gid, rowid FROM catalog WHERE md5path_1 = ?1 AND md5path_2 = ?2";

pub const SQL_LISTING: &str = "SELECT hash, hardlink, size, mode, mtime, flags, name, symlink, \
     uid, gid, rowid FROM catalog WHERE parent_1 = ?1 AND parent_2 = ?2 ORDER BY name";

pub const SQL_CHUNKS: &str = "SELECT offset, size, hash FROM chunks \
     WHERE md5path_1 = ?1 AND md5path_2 = ?2 ORDER BY offset";

pub const SQL_NESTED_LOOKUP: &str = "SELECT sha1 FROM nested_catalogs WHERE path = ?1";

pub const SQL_NESTED_LISTING: &str = "SELECT path, sha1 FROM nested_catalogs";

pub const SQL_MAX_ROW_ID: &str = "SELECT COALESCE(MAX(rowid), 0) FROM catalog";

pub const SQL_PROPERTY: &str = "SELECT value FROM properties WHERE key = ?1";

/// Statements below this schema version have no stored counters; totals
/// are derived by aggregation instead.
pub const FIRST_SCHEMA_WITH_COUNTERS: f64 = 2.1;

/// A decoded `catalog` row: the entry plus its row id (the basis of the
/// entry's inode).
pub struct DirentRow {
    pub dirent: DirectoryEntry,
    pub row_id: u64,
}

/// Decode one row of a lookup/listing statement.
pub fn decode_dirent(
    row: &Row<'_>,
    uid_map: &OwnerMap,
    gid_map: &OwnerMap,
) -> rusqlite::Result<DirentRow> {
    let hash_blob: Option<Vec<u8>> = row.get(0)?;
    let hardlink: i64 = row.get(1)?;
    let size: i64 = row.get(2)?;
    let mode: i64 = row.get(3)?;
    let mtime: i64 = row.get(4)?;
    let entry_flags: i64 = row.get(5)?;
    let name: String = row.get(6)?;
    let symlink: Option<String> = row.get(7)?;
    let uid: i64 = row.get(8)?;
    let gid: i64 = row.get(9)?;
    let row_id: i64 = row.get(10)?;

    let kind = if entry_flags & flags::DIR != 0 {
        DirentKind::Directory
    } else if entry_flags & flags::LINK != 0 {
        DirentKind::Symlink
    } else {
        DirentKind::Regular
    };

    let checksum = hash_blob
        .as_deref()
        .filter(|blob| blob.len() == cvmfs_types::hash::DIGEST_SIZE)
        .map(|blob| {
            let mut raw = [0u8; cvmfs_types::hash::DIGEST_SIZE];
            raw.copy_from_slice(blob);
            ContentDigest(raw)
        })
        .unwrap_or_else(ContentDigest::null);

    let dirent = DirectoryEntry {
        name,
        kind,
        size: size as u64,
        mtime,
        mode: mode as u32,
        uid: uid_map.map(uid as u32),
        gid: gid_map.map(gid as u32),
        checksum,
        symlink_target: symlink.unwrap_or_default(),
        is_chunked: entry_flags & flags::CHUNKED != 0,
        hardlink_group: hardlink as u64,
        is_nested_root: entry_flags & flags::NESTED_ROOT != 0,
        is_nested_mountpoint: entry_flags & flags::NESTED_MOUNTPOINT != 0,
        inode: cvmfs_types::dirent::INVALID_INODE,
    };
    Ok(DirentRow {
        dirent,
        row_id: row_id as u64,
    })
}

/// Decode one row of the chunks statement.
pub fn decode_chunk(row: &Row<'_>) -> rusqlite::Result<FileChunk> {
    let offset: i64 = row.get(0)?;
    let size: i64 = row.get(1)?;
    let hash_blob: Vec<u8> = row.get(2)?;
    let mut raw = [0u8; cvmfs_types::hash::DIGEST_SIZE];
    if hash_blob.len() == raw.len() {
        raw.copy_from_slice(&hash_blob);
    }
    Ok(FileChunk {
        offset: offset as u64,
        size: size as u64,
        digest: ContentDigest(raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{params, Connection};

    #[test]
    fn test_decode_regular_file_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE catalog (md5path_1 INTEGER, md5path_2 INTEGER, \
               parent_1 INTEGER, parent_2 INTEGER, hardlink INTEGER, hash BLOB, \
               size INTEGER, mode INTEGER, mtime INTEGER, flags INTEGER, \
               name TEXT, symlink TEXT, uid INTEGER, gid INTEGER);",
        )
        .unwrap();
        let digest = ContentDigest::from_bytes(b"x");
        conn.execute(
            "INSERT INTO catalog VALUES (1, 2, 0, 0, 0, ?1, 100, 420, 1700000000, ?2, \
               'file.txt', NULL, 0, 0)",
            params![digest.0.to_vec(), flags::FILE | flags::CHUNKED],
        )
        .unwrap();

        let no_map = OwnerMap::default();
        let row = conn
            .query_row(SQL_LOOKUP_MD5, params![1i64, 2i64], |row| {
                decode_dirent(row, &no_map, &no_map)
            })
            .unwrap();
        assert_eq!(row.dirent.name, "file.txt");
        assert!(row.dirent.is_regular());
        assert!(row.dirent.is_chunked);
        assert_eq!(row.dirent.checksum, digest);
        assert_eq!(row.row_id, 1);
    }
}
