//! `cvmfs2`: mount a CernVM-FS repository.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cvmfs_cache::{CacheBackend, Fetcher, PosixCacheManager, QuotaManager, TieredCacheManager};
use cvmfs_catalog::{CatalogManager, InodeGenerationAnnotation};
use cvmfs_client::engine::EngineOptions;
use cvmfs_client::{ClientConfig, Engine};
use cvmfs_download::{Downloader, HttpDownloader, HttpDownloaderConfig};
use cvmfs_types::ContentDigest;

#[derive(Parser)]
#[command(name = "cvmfs2")]
#[command(version, about = "CernVM-FS read-only network filesystem client", long_about = None)]
struct Cli {
    /// Fully qualified repository name, e.g. atlas.cern.ch
    fqrn: String,

    /// Where to mount the repository
    mountpoint: PathBuf,

    /// Configuration files, applied in order (environment wins)
    #[arg(short = 'c', long = "config")]
    config_files: Vec<PathBuf>,

    /// Stay attached to the terminal
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
}

/// Exclusively lock `lock.<fqrn>` in the cache directory; another holder
/// means the repository is already mounted.
fn acquire_lockfile(cache_dir: &std::path::Path, fqrn: &str) -> Result<File> {
    let path = cache_dir.join(format!("lock.{fqrn}"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("cannot open lock file {}", path.display()))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        bail!("repository {fqrn} is already mounted (lock held)");
    }
    Ok(file)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CVMFS_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.fqrn, &cli.config_files)?;
    if config.server_urls.is_empty() {
        bail!("CVMFS_SERVER_URL is not configured for {}", cli.fqrn);
    }
    if config.nfs_source {
        warn!("CVMFS_NFS_SOURCE is configured but NFS maps are handled externally");
    }

    // Cache directory, lock file and crash detection
    std::fs::create_dir_all(&config.cache_dir)
        .with_context(|| format!("cannot create cache directory {}", config.cache_dir.display()))?;
    let _lockfile = acquire_lockfile(&config.cache_dir, &cli.fqrn)?;

    let running_sentinel = config.cache_dir.join(format!("running.{}", cli.fqrn));
    let rebuild_cachedb = running_sentinel.exists();
    if rebuild_cachedb {
        warn!("looks like the previous instance crashed, rebuilding cache database");
    }
    File::create(&running_sentinel).context("could not create running sentinel")?;
    if !config.nfs_source {
        let _ = File::create(config.cache_dir.join(format!("no_nfs_maps.{}", cli.fqrn)));
    }

    // Quota-managed upper cache, optionally stacked on a shared lower one
    let quota = Arc::new(
        QuotaManager::new(&config.cache_dir, config.quota_limit, rebuild_cachedb)
            .context("failed to initialize lru cache")?,
    );
    let mut upper =
        PosixCacheManager::create(&config.cache_dir).context("failed to setup cache directory")?;
    upper.set_quota_observer(quota.clone());
    let cache: Arc<dyn CacheBackend> = match &config.shared_dir {
        Some(shared_dir) => {
            let lower = PosixCacheManager::create(shared_dir)
                .context("failed to setup shared cache directory")?;
            Arc::new(TieredCacheManager::new(Arc::new(upper), Arc::new(lower)))
        }
        None => Arc::new(upper),
    };

    if quota.capacity() != 0 && quota.capacity() != u64::MAX && quota.size() > quota.capacity() {
        info!(
            size = quota.size(),
            capacity = quota.capacity(),
            "cache is already beyond quota size, cleaning up"
        );
        quota
            .cleanup(quota.capacity() / 2)
            .context("failed to clean up cache")?;
    }

    // Network transport
    let transport = Arc::new(
        HttpDownloader::new(HttpDownloaderConfig {
            hosts: config.server_urls.clone(),
            proxies: config.proxies.clone(),
            timeout: config.timeout,
            timeout_direct: config.timeout_direct,
            max_retries: config.max_retries,
            backoff_init_ms: config.backoff_init_ms,
            backoff_max_ms: config.backoff_max_ms,
            host_reset_after: config.host_reset_after,
            proxy_reset_after: config.proxy_reset_after,
        })
        .context("failed to initialize downloader")?,
    );
    if let Some(dns_server) = &config.dns_server {
        warn!(dns_server, "CVMFS_DNS_SERVER is recorded but name resolution uses the system resolver");
    }
    if config.ignore_signature {
        warn!("signature verification disabled by configuration");
    }
    let download: Arc<dyn Downloader> = transport.clone();
    let fetcher = Arc::new(Fetcher::new(cache, download.clone()));

    // Catalog tree
    let annotation = Arc::new(InodeGenerationAnnotation::new());
    let mut catalog_mgr = CatalogManager::new(&cli.fqrn, fetcher.clone(), download);
    catalog_mgr.set_inode_annotation(annotation.clone());
    catalog_mgr.set_owner_maps(config.uid_map.clone(), config.gid_map.clone());

    let fixed_catalog = match &config.root_hash {
        Some(root_hash) => {
            let digest = ContentDigest::from_hex(root_hash)
                .with_context(|| format!("bad CVMFS_ROOT_HASH: {root_hash}"))?;
            catalog_mgr
                .init_fixed(digest)
                .context("failed to initialize root file catalog")?;
            true
        }
        None => {
            catalog_mgr
                .init()
                .context("failed to initialize root file catalog")?;
            !config.auto_update
        }
    };
    let catalog_mgr = Arc::new(catalog_mgr);

    let max_open_files = max_open_files();
    let engine = Arc::new(Engine::new(
        EngineOptions {
            fqrn: cli.fqrn.clone(),
            kcache_timeout: config.kcache_timeout,
            max_ttl: config.max_ttl,
            max_open_files,
            memcache_size: config.memcache_size,
            fixed_catalog,
        },
        catalog_mgr,
        fetcher,
        quota,
        annotation,
        Some(transport),
    ));
    engine.spawn();

    info!(
        fqrn = %cli.fqrn,
        mountpoint = %cli.mountpoint.display(),
        revision = engine.catalog_mgr().revision(),
        foreground = cli.foreground,
        "mounting repository"
    );
    let mount_result = cvmfs_client::fuse::mount(engine, &cli.mountpoint);

    let _ = std::fs::remove_file(&running_sentinel);
    mount_result.context("mount failed")?;
    Ok(())
}

/// The soft RLIMIT_NOFILE, which caps kernel-visible handles.
fn max_open_files() -> u32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc == 0 && limit.rlim_cur > 0 {
        limit.rlim_cur.min(u32::MAX as u64) as u32
    } else {
        1024
    }
}
