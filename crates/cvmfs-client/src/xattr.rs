//! Virtual extended attributes.
//!
//! A fixed set of `user.*` names exposes runtime state of the mount:
//! process, revision, cache and transfer statistics. Regular files with a
//! content digest additionally report `user.hash` (the catalog-recorded
//! digest) and `user.lhash` (recomputed from the cached artifact).

use std::sync::atomic::Ordering;
use std::time::SystemTime;

use cvmfs_cache::{hash_compressed_file, BlessedObject};

use crate::engine::{Engine, Errno, FsResult, XattrReply};

/// Attributes present on every entry.
const BASE_ATTRIBUTES: &[&str] = &[
    "user.pid",
    "user.version",
    "user.revision",
    "user.root_hash",
    "user.expires",
    "user.maxfd",
    "user.usedfd",
    "user.nioerr",
    "user.host",
    "user.proxy",
    "user.uptime",
    "user.nclg",
    "user.nopen",
    "user.ndownload",
    "user.timeout",
    "user.timeout_direct",
    "user.rx",
    "user.speed",
    "user.fqrn",
    "user.ndiropen",
    "user.useddirp",
];

/// Additional attributes of entries carrying a content digest.
const HASH_ATTRIBUTES: &[&str] = &["user.hash", "user.lhash"];

fn size_probe(value: Vec<u8>, size: usize) -> FsResult<XattrReply> {
    if size == 0 {
        Ok(XattrReply::Size(value.len()))
    } else if size >= value.len() {
        Ok(XattrReply::Data(value))
    } else {
        Err(Errno(libc::ERANGE))
    }
}

impl Engine {
    pub fn getxattr(&self, inode: u64, name: &str, size: usize) -> FsResult<XattrReply> {
        let dirent = {
            let _fence = self.fence.enter();
            let inode = self.catalog_mgr().mangle_inode(inode);
            self.dirent_for_inode(inode)
                .ok_or(Errno(libc::ENOENT))?
        };

        let value: String = match name {
            "user.pid" => std::process::id().to_string(),
            "user.version" => env!("CARGO_PKG_VERSION").to_string(),
            "user.fqrn" => self.options().fqrn.clone(),
            "user.revision" => self.catalog_mgr().revision().to_string(),
            "user.root_hash" => self
                .catalog_mgr()
                .root_hash()
                .map(|digest| digest.to_hex())
                .unwrap_or_default(),
            "user.expires" => match self.catalogs_valid_until() {
                None => "never (fixed root catalog)".to_string(),
                Some(until) => {
                    let remaining = until
                        .duration_since(SystemTime::now())
                        .map(|d| d.as_secs() / 60)
                        .unwrap_or(0);
                    remaining.to_string()
                }
            },
            "user.maxfd" => self.max_usable_fds().to_string(),
            "user.usedfd" => self.open_files_count().to_string(),
            "user.useddirp" => self.open_dirs_count().to_string(),
            "user.nioerr" => self.counters.num_io_error.load(Ordering::Relaxed).to_string(),
            "user.nclg" => self.catalog_mgr().num_catalogs().to_string(),
            "user.nopen" => self.counters.num_open.load(Ordering::Relaxed).to_string(),
            "user.ndiropen" => self.counters.num_dir_open.load(Ordering::Relaxed).to_string(),
            "user.ndownload" => self.fetcher().num_downloads().to_string(),
            "user.uptime" => (self.boot_time.elapsed().as_secs() / 60).to_string(),
            "user.host" => match self.transport() {
                Some(transport) => transport
                    .active_host()
                    .unwrap_or_else(|| "internal error: no hosts defined".to_string()),
                None => "internal error: no hosts defined".to_string(),
            },
            "user.proxy" => match self.transport() {
                Some(transport) => transport.active_proxy(),
                None => "DIRECT".to_string(),
            },
            "user.timeout" => match self.transport() {
                Some(transport) => transport.timeouts().0.to_string(),
                None => "0".to_string(),
            },
            "user.timeout_direct" => match self.transport() {
                Some(transport) => transport.timeouts().1.to_string(),
                None => "0".to_string(),
            },
            "user.rx" => match self.transport() {
                Some(transport) => transport.stats().transferred_kb().to_string(),
                None => "0".to_string(),
            },
            "user.speed" => match self.transport().and_then(|t| t.stats().speed_kbps()) {
                Some(speed) => speed.to_string(),
                None => "n/a".to_string(),
            },
            "user.hash" => {
                if dirent.checksum.is_null() {
                    return Err(Errno(libc::ENODATA));
                }
                format!("{} (SHA-1)", dirent.checksum.to_hex())
            }
            "user.lhash" => {
                if dirent.checksum.is_null() {
                    return Err(Errno(libc::ENODATA));
                }
                let object = BlessedObject::new(dirent.checksum, "lhash probe");
                match self.fetcher().cache().open(&object) {
                    Ok(file) => match hash_compressed_file(file) {
                        Ok(digest) => format!("{} (SHA-1)", digest.to_hex()),
                        Err(_) => return Err(Errno(libc::EIO)),
                    },
                    Err(_) => "Not in cache".to_string(),
                }
            }
            _ => return Err(Errno(libc::ENODATA)),
        };

        size_probe(value.into_bytes(), size)
    }

    pub fn listxattr(&self, inode: u64, size: usize) -> FsResult<XattrReply> {
        let dirent = {
            let _fence = self.fence.enter();
            let inode = self.catalog_mgr().mangle_inode(inode);
            self.dirent_for_inode(inode)
                .ok_or(Errno(libc::ENOENT))?
        };

        let mut list = Vec::new();
        for attr in BASE_ATTRIBUTES {
            list.extend_from_slice(attr.as_bytes());
            list.push(0);
        }
        if !dirent.checksum.is_null() {
            for attr in HASH_ATTRIBUTES {
                list.extend_from_slice(attr.as_bytes());
                list.push(0);
            }
        }
        size_probe(list, size)
    }
}
