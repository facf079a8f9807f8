//! End-to-end engine tests: a published repository served from a local
//! origin directory, driven through the filesystem front-end.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cvmfs_cache::{CacheBackend, Fetcher, PosixCacheManager, QuotaManager};
use cvmfs_catalog::testing::{CatalogBuilder, RepoPublisher};
use cvmfs_catalog::{CatalogManager, InodeGenerationAnnotation};
use cvmfs_client::engine::{EngineOptions, XattrReply};
use cvmfs_client::Engine;
use cvmfs_download::DirDownloader;
use cvmfs_types::DirentKind;

const FQRN: &str = "demo.example.org";

struct Fixture {
    _origin_dir: TempDir,
    cache_dir: TempDir,
    publisher: RepoPublisher,
}

impl Fixture {
    fn new() -> Self {
        let origin_dir = TempDir::new().unwrap();
        let publisher = RepoPublisher::new(origin_dir.path(), FQRN);
        Self {
            _origin_dir: origin_dir,
            cache_dir: TempDir::new().unwrap(),
            publisher,
        }
    }

    fn engine(&self) -> Arc<Engine> {
        self.engine_with(EngineOptions {
            fqrn: FQRN.to_string(),
            kcache_timeout: 0.0,
            max_ttl: 0,
            max_open_files: 100_000,
            memcache_size: 16 * 1024 * 1024,
            fixed_catalog: false,
        })
    }

    fn engine_with(&self, options: EngineOptions) -> Arc<Engine> {
        let quota = Arc::new(
            QuotaManager::new(self.cache_dir.path(), 1 << 30, false).unwrap(),
        );
        let mut cache = PosixCacheManager::create(self.cache_dir.path()).unwrap();
        cache.set_quota_observer(quota.clone());
        let cache: Arc<dyn CacheBackend> = Arc::new(cache);
        let download = Arc::new(DirDownloader::new(self.publisher.origin()));
        let fetcher = Arc::new(Fetcher::new(cache, download.clone()));

        let annotation = Arc::new(InodeGenerationAnnotation::new());
        let mut catalog_mgr = CatalogManager::new(FQRN, fetcher.clone(), download);
        catalog_mgr.set_inode_annotation(annotation.clone());
        catalog_mgr.init().unwrap();

        Arc::new(Engine::new(
            options,
            Arc::new(catalog_mgr),
            fetcher,
            quota,
            annotation,
            None,
        ))
    }
}

fn publish_basic(publisher: &RepoPublisher, content: &[u8]) {
    let digest = publisher.publish_object(content);
    let root = publisher.publish_catalog(
        &CatalogBuilder::new("")
            .revision(1)
            .ttl(900)
            .add_dir("/a")
            .add_file("/a/b", digest, content.len() as u64)
            .add_symlink("/a/link", "b"),
    );
    publisher.publish_manifest(root, 1, 900);
}

fn lookup_ino(engine: &Engine, parent: u64, name: &str) -> u64 {
    engine.lookup(parent, name).unwrap().attr.ino
}

/// Walk an absolute path from the root, like the kernel would.
fn resolve(engine: &Engine, path: &str) -> u64 {
    let mut ino = 1; // FUSE root id, mangled by the engine
    for component in path.split('/').filter(|c| !c.is_empty()) {
        ino = lookup_ino(engine, ino, component);
    }
    ino
}

#[test]
fn test_cold_open_downloads_exactly_once() {
    let fx = Fixture::new();
    let content = vec![42u8; 1 << 20];
    publish_basic(&fx.publisher, &content);
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/b");
    let baseline = engine_num_downloads(&engine); // the root catalog fetch

    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    let data = engine.read(ino, open.handle, 0, content.len()).unwrap();
    assert_eq!(data, content);
    engine.release(ino, open.handle).unwrap();

    // Exactly one data object fetched over the network.
    assert_eq!(engine_num_downloads(&engine), baseline + 1);

    // The second open is a pure cache hit.
    let open2 = engine.open(ino, libc::O_RDONLY).unwrap();
    let data2 = engine.read(ino, open2.handle, 0, content.len()).unwrap();
    assert_eq!(data2, content);
    engine.release(ino, open2.handle).unwrap();
    assert_eq!(engine_num_downloads(&engine), baseline + 1);
}

/// The `user.ndownload` xattr: objects fetched over the network so far
/// (catalogs included).
fn engine_num_downloads(engine: &Engine) -> u64 {
    match engine.getxattr(1, "user.ndownload", 64).unwrap() {
        XattrReply::Data(raw) => String::from_utf8(raw).unwrap().parse().unwrap(),
        XattrReply::Size(_) => unreachable!(),
    }
}

#[test]
fn test_lookup_getattr_agree() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/b");
    let attr = engine.getattr(ino).unwrap().attr;
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.size, 7);
    assert_eq!(attr.kind, DirentKind::Regular);
}

#[test]
fn test_missing_path_is_enoent_and_negative_cached() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let parent = resolve(&engine, "/a");
    assert_eq!(engine.lookup(parent, "nope").unwrap_err().0, libc::ENOENT);
    // Second lookup is served by the negative entry; still ENOENT.
    assert_eq!(engine.lookup(parent, "nope").unwrap_err().0, libc::ENOENT);
}

#[test]
fn test_readlink() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/link");
    assert_eq!(engine.readlink(ino).unwrap(), "b");

    let file_ino = resolve(&engine, "/a/b");
    assert_eq!(engine.readlink(file_ino).unwrap_err().0, libc::EINVAL);
}

#[test]
fn test_open_rejects_o_excl() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/b");
    assert_eq!(
        engine.open(ino, libc::O_RDONLY | libc::O_EXCL).unwrap_err().0,
        libc::EEXIST
    );
}

#[test]
fn test_readdir_matches_lookups() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let dir_ino = resolve(&engine, "/a");
    let handle = engine.opendir(dir_ino).unwrap();
    let records = engine.readdir(handle, 0).unwrap();

    let names: Vec<&str> = records
        .iter()
        .map(|(_, record)| record.name.as_str())
        .collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
    assert!(names.contains(&"b"));
    assert!(names.contains(&"link"));

    for (_, record) in &records {
        if record.name == "." || record.name == ".." {
            continue;
        }
        let looked_up = lookup_ino(&engine, dir_ino, &record.name);
        assert_eq!(looked_up, record.inode, "inode mismatch for {}", record.name);
    }

    // Slicing continues where the previous call stopped.
    let tail = engine.readdir(handle, records.len() - 1).unwrap();
    assert_eq!(tail.len(), 1);
    engine.releasedir(handle).unwrap();
    assert_eq!(engine.readdir(handle, 0).unwrap_err().0, libc::EINVAL);
}

#[test]
fn test_opendir_of_file_is_enotdir() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/b");
    assert_eq!(engine.opendir(ino).unwrap_err().0, libc::ENOTDIR);
}

#[test]
fn test_chunked_read_across_boundary() {
    let fx = Fixture::new();
    let mib = 1usize << 20;
    let mut content = Vec::with_capacity(2 * mib + 512);
    for n in 0..(2 * mib + 512) {
        content.push((n % 251) as u8);
    }
    let chunks = fx.publisher.publish_chunked(&content, mib);
    assert_eq!(chunks.len(), 3);
    let whole = fx.publisher.publish_object(&content);
    let root = fx.publisher.publish_catalog(
        &CatalogBuilder::new("").add_chunked_file(
            "/big.bin",
            whole,
            content.len() as u64,
            chunks,
        ),
    );
    fx.publisher.publish_manifest(root, 1, 900);
    let engine = fx.engine();

    let ino = resolve(&engine, "/big.bin");
    let baseline = engine_num_downloads(&engine);
    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    // Opening a chunked file defers all fetches to read.
    assert_eq!(engine_num_downloads(&engine), baseline);

    // Straddles the first and second chunk: exactly those two are fetched.
    let offset = mib as u64 - 6;
    let data = engine.read(ino, open.handle, offset, 32).unwrap();
    assert_eq!(data, &content[offset as usize..offset as usize + 32]);
    assert_eq!(engine_num_downloads(&engine), baseline + 2);

    // A read inside an already-open chunk costs no further fetch.
    let data = engine.read(ino, open.handle, mib as u64 + 100, 16).unwrap();
    assert_eq!(data, &content[mib + 100..mib + 116]);
    assert_eq!(engine_num_downloads(&engine), baseline + 2);

    // Reading the tail crosses into the last chunk.
    let tail_offset = content.len() as u64 - 100;
    let data = engine.read(ino, open.handle, tail_offset, 200).unwrap();
    assert_eq!(data, &content[content.len() - 100..]);
    assert_eq!(engine_num_downloads(&engine), baseline + 3);

    engine.release(ino, open.handle).unwrap();
}

#[test]
fn test_chunked_read_equals_whole_content() {
    let fx = Fixture::new();
    let content: Vec<u8> = (0..10_000u32).flat_map(|n| n.to_le_bytes()).collect();
    let chunks = fx.publisher.publish_chunked(&content, 4096);
    let whole = fx.publisher.publish_object(&content);
    let root = fx.publisher.publish_catalog(
        &CatalogBuilder::new("").add_chunked_file(
            "/data",
            whole,
            content.len() as u64,
            chunks,
        ),
    );
    fx.publisher.publish_manifest(root, 1, 900);
    let engine = fx.engine();

    let ino = resolve(&engine, "/data");
    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    let mut assembled = Vec::new();
    let mut offset = 0u64;
    loop {
        let piece = engine.read(ino, open.handle, offset, 7000).unwrap();
        if piece.is_empty() {
            break;
        }
        offset += piece.len() as u64;
        assembled.extend_from_slice(&piece);
    }
    assert_eq!(assembled, content);
    engine.release(ino, open.handle).unwrap();
}

#[test]
fn test_open_hits_fd_limit_with_emfile() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    // 512 reserved descriptors plus two usable ones.
    let engine = fx.engine_with(EngineOptions {
        fqrn: FQRN.to_string(),
        kcache_timeout: 0.0,
        max_ttl: 0,
        max_open_files: 514,
        memcache_size: 16 * 1024 * 1024,
        fixed_catalog: false,
    });

    let ino = resolve(&engine, "/a/b");
    let first = engine.open(ino, libc::O_RDONLY).unwrap();
    let second = engine.open(ino, libc::O_RDONLY).unwrap();
    assert_eq!(engine.open(ino, libc::O_RDONLY).unwrap_err().0, libc::EMFILE);

    // Releasing one handle frees a slot again.
    engine.release(ino, first.handle).unwrap();
    let third = engine.open(ino, libc::O_RDONLY).unwrap();
    engine.release(ino, second.handle).unwrap();
    engine.release(ino, third.handle).unwrap();
}

#[test]
fn test_open_failure_counts_io_error() {
    let fx = Fixture::new();
    // Publish a catalog entry whose object is missing from the origin.
    let bogus = cvmfs_types::ContentDigest::from_bytes(b"never published");
    let root = fx
        .publisher
        .publish_catalog(&CatalogBuilder::new("").add_file("/ghost", bogus, 5));
    fx.publisher.publish_manifest(root, 1, 900);
    let engine = fx.engine();

    let ino = resolve(&engine, "/ghost");
    assert_eq!(engine.open(ino, libc::O_RDONLY).unwrap_err().0, libc::EIO);
    match engine.getxattr(1, "user.nioerr", 64).unwrap() {
        XattrReply::Data(raw) => assert_eq!(String::from_utf8(raw).unwrap(), "1"),
        XattrReply::Size(_) => unreachable!(),
    }
}

#[test]
fn test_getxattr_size_protocol() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let XattrReply::Size(len) = engine.getxattr(1, "user.fqrn", 0).unwrap() else {
        panic!("expected a size probe reply");
    };
    assert_eq!(len, FQRN.len());

    assert_eq!(
        engine.getxattr(1, "user.fqrn", len - 1).unwrap_err().0,
        libc::ERANGE
    );

    let XattrReply::Data(data) = engine.getxattr(1, "user.fqrn", len).unwrap() else {
        panic!("expected a data reply");
    };
    assert_eq!(data, FQRN.as_bytes());

    assert_eq!(
        engine.getxattr(1, "user.unknown", 64).unwrap_err().0,
        libc::ENODATA
    );
}

#[test]
fn test_hash_xattrs_on_regular_files() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let ino = resolve(&engine, "/a/b");

    // Not yet downloaded: lhash reports absence.
    let XattrReply::Data(lhash) = engine.getxattr(ino, "user.lhash", 256).unwrap() else {
        panic!("expected data");
    };
    assert_eq!(lhash, b"Not in cache");

    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    engine.release(ino, open.handle).unwrap();

    let XattrReply::Data(hash) = engine.getxattr(ino, "user.hash", 256).unwrap() else {
        panic!("expected data");
    };
    let XattrReply::Data(lhash) = engine.getxattr(ino, "user.lhash", 256).unwrap() else {
        panic!("expected data");
    };
    // Once cached, the locally recomputed digest matches the catalog one.
    assert_eq!(hash, lhash);

    // Directories carry no hash attributes.
    let dir_ino = resolve(&engine, "/a");
    assert_eq!(
        engine.getxattr(dir_ino, "user.hash", 256).unwrap_err().0,
        libc::ENODATA
    );
}

#[test]
fn test_listxattr_includes_hash_only_for_files() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let file_ino = resolve(&engine, "/a/b");
    let XattrReply::Data(list) = engine.listxattr(file_ino, 4096).unwrap() else {
        panic!("expected data");
    };
    let list = String::from_utf8(list).unwrap();
    assert!(list.contains("user.hash\0"));
    assert!(list.contains("user.fqrn\0"));

    let XattrReply::Data(list) = engine.listxattr(1, 4096).unwrap() else {
        panic!("expected data");
    };
    let list = String::from_utf8(list).unwrap();
    assert!(!list.contains("user.hash\0"));
}

#[test]
fn test_forget_drains_inode() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let parent = resolve(&engine, "/a");
    let ino = lookup_ino(&engine, parent, "b");
    let ino_again = lookup_ino(&engine, parent, "b");
    assert_eq!(ino, ino_again);

    // Two lookups, two references; draining both forgets the inode.
    engine.forget(ino, 2).unwrap();
    assert_eq!(engine.getattr(ino).unwrap_err().0, libc::ENOENT);

    // The path is still perfectly reachable afterwards.
    let fresh = lookup_ino(&engine, parent, "b");
    assert_eq!(engine.getattr(fresh).unwrap().attr.ino, fresh);
}

#[test]
fn test_statfs_reports_quota() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine();

    let stat = engine.statfs().unwrap();
    assert_eq!(stat.blocks, 1 << 30);
    assert!(stat.files > 0);
    assert!(stat.bfree <= stat.blocks);
}

#[test]
fn test_revision_swap_with_open_handle() {
    let fx = Fixture::new();
    let content = b"stable content".to_vec();
    let digest = fx.publisher.publish_object(&content);
    let root1 = fx.publisher.publish_catalog(
        &CatalogBuilder::new("")
            .revision(1)
            .ttl(1)
            .add_file("/f", digest, content.len() as u64),
    );
    fx.publisher.publish_manifest(root1, 1, 1);

    let engine = fx.engine();
    engine.spawn();

    let ino = resolve(&engine, "/f");
    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    assert_eq!(engine.read(ino, open.handle, 0, 6).unwrap(), b"stable");

    // Publish revision 2; the file keeps its digest.
    let root2 = fx.publisher.publish_catalog(
        &CatalogBuilder::new("")
            .revision(2)
            .ttl(900)
            .add_file("/f", digest, content.len() as u64)
            .add_dir("/new"),
    );
    fx.publisher.publish_manifest(root2, 2, 900);

    // Let the 1-second TTL fire, then drive the state machine through
    // the front door (kcache_timeout is 0, so drain-out is immediate).
    std::thread::sleep(Duration::from_millis(1500));
    let _ = engine.lookup(1, "f"); // starts the drain-out
    let _ = engine.lookup(1, "f"); // applies the new revision
    assert_eq!(engine.catalog_mgr().revision(), 2);

    // The outstanding handle keeps working across the swap.
    assert_eq!(engine.read(ino, open.handle, 7, 7).unwrap(), b"content");
    engine.release(ino, open.handle).unwrap();

    // The new revision's content is visible.
    assert!(engine.lookup(1, "new").is_ok());
}

#[test]
fn test_failed_reload_keeps_serving_current_revision() {
    let fx = Fixture::new();
    let digest = fx.publisher.publish_object(b"content");
    let root = fx.publisher.publish_catalog(
        &CatalogBuilder::new("")
            .revision(1)
            .ttl(1)
            .add_file("/f", digest, 7),
    );
    fx.publisher.publish_manifest(root, 1, 1);

    let engine = fx.engine();
    engine.spawn();
    let ino = resolve(&engine, "/f");

    // Cut the origin before the TTL fires.
    std::fs::remove_file(fx.publisher.origin().join(".cvmfspublished")).unwrap();
    std::thread::sleep(Duration::from_millis(1500));

    // The reload fails; the mount keeps serving the loaded revision.
    assert!(engine.lookup(1, "f").is_ok());
    assert_eq!(engine.catalog_mgr().revision(), 1);
    assert_eq!(engine.getattr(ino).unwrap().attr.size, 7);
    assert!(engine.catalog_mgr().offline_mode());
}

#[test]
fn test_corrupt_lru_db_recovers_on_restart() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    {
        let engine = fx.engine();
        let ino = resolve(&engine, "/a/b");
        let open = engine.open(ino, libc::O_RDONLY).unwrap();
        engine.release(ino, open.handle).unwrap();
    }

    std::fs::write(fx.cache_dir.path().join("cachedb"), b"garbage").unwrap();

    // A fresh engine over the same cache dir rebuilds the database and
    // keeps serving.
    let engine = fx.engine();
    let ino = resolve(&engine, "/a/b");
    let open = engine.open(ino, libc::O_RDONLY).unwrap();
    assert_eq!(engine.read(ino, open.handle, 0, 7).unwrap(), b"content");
    engine.release(ino, open.handle).unwrap();
}

#[test]
fn test_state_handover_preserves_handles() {
    let fx = Fixture::new();
    let content: Vec<u8> = (0..20_000u32).flat_map(|n| n.to_le_bytes()).collect();
    let chunks = fx.publisher.publish_chunked(&content, 16 * 1024);
    let whole = fx.publisher.publish_object(&content);
    let file_digest = fx.publisher.publish_object(b"plain");
    let root = fx.publisher.publish_catalog(
        &CatalogBuilder::new("")
            .add_chunked_file("/big", whole, content.len() as u64, chunks)
            .add_file("/small", file_digest, 5)
            .add_dir("/d"),
    );
    fx.publisher.publish_manifest(root, 1, 900);

    let engine1 = fx.engine();
    let big_ino = resolve(&engine1, "/big");
    let open = engine1.open(big_ino, libc::O_RDONLY).unwrap();
    let first_half = engine1.read(big_ino, open.handle, 0, 1024).unwrap();

    let dir_ino = resolve(&engine1, "/d");
    let dir_handle = engine1.opendir(dir_ino).unwrap();

    engine1.enter_maintenance();
    let saved = engine1.save_state_json().unwrap();
    drop(engine1);

    // The successor restores the snapshot and continues serving the same
    // kernel-visible handles.
    let engine2 = fx.engine();
    engine2.restore_state_json(&saved).unwrap();

    let second_half = engine2
        .read(big_ino, open.handle, 1024, 1024)
        .unwrap();
    assert_eq!(first_half, content[..1024]);
    assert_eq!(second_half, content[1024..2048]);

    let records = engine2.readdir(dir_handle, 0).unwrap();
    assert!(records.iter().any(|(_, r)| r.name == "."));
    engine2.releasedir(dir_handle).unwrap();
    engine2.release(big_ino, open.handle).unwrap();
}

#[test]
fn test_maintenance_mode_reports_zero_kcache_timeout() {
    let fx = Fixture::new();
    publish_basic(&fx.publisher, b"content");
    let engine = fx.engine_with(EngineOptions {
        fqrn: FQRN.to_string(),
        kcache_timeout: 60.0,
        max_ttl: 0,
        max_open_files: 100_000,
        memcache_size: 16 * 1024 * 1024,
        fixed_catalog: false,
    });

    assert_eq!(engine.lookup(1, "a").unwrap().timeout, 60.0);
    engine.enter_maintenance();
    assert_eq!(engine.lookup(1, "a").unwrap().timeout, 0.0);
}
