//! Client configuration.
//!
//! `CVMFS_*` keys are read from flat `key=value` config files (later
//! files override earlier ones) and finally from the process environment,
//! which wins. Unknown keys are ignored. Values that fail to parse are
//! boot errors with a categorical code, so the loader can report why a
//! mount did not come up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use cvmfs_types::OwnerMap;

/// Categorical boot failures, reported before the filesystem goes live.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("Configuration error: {0}")]
    Options(String),

    #[error("Cache directory unusable: {0}")]
    CacheDir(String),

    #[error("Failed to initialize quota manager: {0}")]
    Quota(String),

    #[error("Failed to initialize root file catalog: {0}")]
    Catalog(String),

    #[error("Failed to load public keys: {0}")]
    Signature(String),

    #[error("Repository already mounted: {0}")]
    DoubleMount(String),
}

/// Kernel cache timeout when nothing is configured, seconds.
pub const DEFAULT_KCACHE_TIMEOUT: f64 = 60.0;

/// Network timeout when nothing is configured, seconds.
pub const DEFAULT_TIMEOUT: u64 = 2;

/// Memory for the meta-data caches when nothing is configured.
pub const DEFAULT_MEMCACHE_SIZE: u64 = 16 * 1024 * 1024;

/// Cache limit when nothing is configured, bytes.
pub const DEFAULT_QUOTA_LIMIT: u64 = 1024 * 1024 * 1024;

const DEFAULT_CACHE_BASE: &str = "/var/lib/cvmfs";

/// Everything the mount needs to know, resolved from files and
/// environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub fqrn: String,
    /// Host URLs after `@org@`/`@fqrn@` substitution.
    pub server_urls: Vec<String>,
    pub proxies: Vec<String>,
    pub dns_server: Option<String>,
    pub timeout: u64,
    pub timeout_direct: u64,
    pub proxy_reset_after: u64,
    pub host_reset_after: u64,
    pub max_retries: u32,
    /// Backoff bounds, milliseconds.
    pub backoff_init_ms: u64,
    pub backoff_max_ms: u64,
    pub memcache_size: u64,
    /// Cap on the effective catalog TTL, seconds (0 = none).
    pub max_ttl: u64,
    /// Kernel dentry/attr cache lifetime, seconds (0 = disabled).
    pub kcache_timeout: f64,
    /// Upper cache capacity, bytes (0 = bypass, `u64::MAX` = unmanaged).
    pub quota_limit: u64,
    /// Private, quota-managed cache directory.
    pub cache_dir: PathBuf,
    /// Shared lower cache layer, if configured.
    pub shared_dir: Option<PathBuf>,
    pub root_hash: Option<String>,
    pub repository_tag: String,
    pub ignore_signature: bool,
    /// `false` pins the mounted revision (no TTL-driven remounts).
    pub auto_update: bool,
    pub nfs_source: bool,
    pub nfs_shared_dir: Option<PathBuf>,
    pub public_keys: Vec<PathBuf>,
    pub uid_map: OwnerMap,
    pub gid_map: OwnerMap,
    pub tracefile: Option<PathBuf>,
}

impl ClientConfig {
    /// Resolve the configuration for `fqrn` from `config_files` (in
    /// order) and the environment.
    pub fn load(fqrn: &str, config_files: &[PathBuf]) -> Result<Self, BootError> {
        let mut options = HashMap::new();
        for file in config_files {
            parse_config_file(file, &mut options)?;
        }
        for (key, value) in std::env::vars() {
            if key.starts_with("CVMFS_") {
                options.insert(key, value);
            }
        }
        Self::from_options(fqrn, &options)
    }

    fn from_options(fqrn: &str, options: &HashMap<String, String>) -> Result<Self, BootError> {
        let get = |key: &str| options.get(key).map(String::as_str);
        let parse_u64 = |key: &str, default: u64| -> Result<u64, BootError> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| BootError::Options(format!("bad value for {key}: {raw}"))),
                None => Ok(default),
            }
        };
        let parse_i64 = |key: &str, default: i64| -> Result<i64, BootError> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| BootError::Options(format!("bad value for {key}: {raw}"))),
                None => Ok(default),
            }
        };

        let org = fqrn.split('.').next().unwrap_or(fqrn);
        let server_urls = get("CVMFS_SERVER_URL")
            .map(|raw| {
                raw.split(';')
                    .filter(|url| !url.is_empty())
                    .map(|url| url.replace("@org@", org).replace("@fqrn@", fqrn))
                    .collect()
            })
            .unwrap_or_default();

        let proxies = get("CVMFS_HTTP_PROXY")
            .map(|raw| {
                raw.split([';', '|'])
                    .filter(|p| !p.is_empty() && *p != "DIRECT")
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let timeout = parse_u64("CVMFS_TIMEOUT", DEFAULT_TIMEOUT)?;
        let timeout_direct = parse_u64("CVMFS_TIMEOUT_DIRECT", DEFAULT_TIMEOUT)?;

        let kcache_timeout = match parse_i64("CVMFS_KCACHE_TIMEOUT", 0)? {
            0 => DEFAULT_KCACHE_TIMEOUT,
            -1 => 0.0,
            secs => secs as f64,
        };

        let quota_limit = match parse_i64(
            "CVMFS_QUOTA_LIMIT",
            (DEFAULT_QUOTA_LIMIT / (1024 * 1024)) as i64,
        )? {
            -1 => u64::MAX,
            0 => 0,
            mb if mb > 0 => mb as u64 * 1024 * 1024,
            other => {
                return Err(BootError::Options(format!(
                    "bad value for CVMFS_QUOTA_LIMIT: {other}"
                )))
            }
        };

        let shared_cache = get("CVMFS_SHARED_CACHE").map(is_on).unwrap_or(false);
        let cache_base = get("CVMFS_CACHE_BASE").unwrap_or(DEFAULT_CACHE_BASE);
        let cache_dir = Path::new(cache_base).join(fqrn);
        let shared_dir = shared_cache.then(|| Path::new(cache_base).join("shared"));

        let public_keys = match get("CVMFS_KEYS_DIR") {
            Some(dir) => collect_pub_keys(Path::new(dir)),
            None => get("CVMFS_PUBLIC_KEY")
                .map(|raw| raw.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
        };

        let uid_map = match get("CVMFS_UID_MAP") {
            Some(path) => parse_owner_map(Path::new(path))
                .map_err(|e| BootError::Options(format!("failed to parse uid map: {e}")))?,
            None => OwnerMap::default(),
        };
        let gid_map = match get("CVMFS_GID_MAP") {
            Some(path) => parse_owner_map(Path::new(path))
                .map_err(|e| BootError::Options(format!("failed to parse gid map: {e}")))?,
            None => OwnerMap::default(),
        };

        Ok(Self {
            fqrn: fqrn.to_string(),
            server_urls,
            proxies,
            dns_server: get("CVMFS_DNS_SERVER").map(str::to_string),
            timeout,
            timeout_direct,
            proxy_reset_after: parse_u64("CVMFS_PROXY_RESET_AFTER", 0)?,
            host_reset_after: parse_u64("CVMFS_HOST_RESET_AFTER", 0)?,
            max_retries: parse_u64("CVMFS_MAX_RETRIES", 1)? as u32,
            backoff_init_ms: parse_u64("CVMFS_BACKOFF_INIT", 2)? * 1000,
            backoff_max_ms: parse_u64("CVMFS_BACKOFF_MAX", 10)? * 1000,
            memcache_size: parse_u64(
                "CVMFS_MEMCACHE_SIZE",
                DEFAULT_MEMCACHE_SIZE / (1024 * 1024),
            )? * 1024
                * 1024,
            max_ttl: parse_u64("CVMFS_MAX_TTL", 0)? * 60,
            kcache_timeout,
            quota_limit,
            cache_dir,
            shared_dir,
            root_hash: get("CVMFS_ROOT_HASH").map(str::to_string),
            repository_tag: get("CVMFS_REPOSITORY_TAG").unwrap_or("").to_string(),
            ignore_signature: get("CVMFS_IGNORE_SIGNATURE").map(is_on).unwrap_or(false),
            auto_update: get("CVMFS_AUTO_UPDATE").map(is_on).unwrap_or(true),
            nfs_source: get("CVMFS_NFS_SOURCE").map(is_on).unwrap_or(false),
            nfs_shared_dir: get("CVMFS_NFS_SHARED").map(PathBuf::from),
            public_keys,
            uid_map,
            gid_map,
            tracefile: get("CVMFS_TRACEFILE").map(PathBuf::from),
        })
    }
}

fn is_on(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "yes" | "on" | "1" | "true"
    )
}

fn parse_config_file(
    path: &Path,
    options: &mut HashMap<String, String>,
) -> Result<(), BootError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BootError::Options(format!("cannot read {}: {e}", path.display())))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        options.insert(key.trim().to_string(), value.to_string());
    }
    Ok(())
}

fn collect_pub_keys(dir: &Path) -> Vec<PathBuf> {
    let mut keys: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "pub"))
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}

fn parse_owner_map(path: &Path) -> std::io::Result<OwnerMap> {
    let content = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(from), Some(to)) = (fields.next(), fields.next()) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed map line: {line}"),
            ));
        };
        let from: u32 = from.parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad id in owner map")
        })?;
        let to: u32 = to.parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad id in owner map")
        })?;
        map.insert(from, to);
    }
    Ok(OwnerMap::new(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_options("demo.example.org", &options(&[])).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.kcache_timeout, DEFAULT_KCACHE_TIMEOUT);
        assert_eq!(config.quota_limit, DEFAULT_QUOTA_LIMIT);
        assert!(config.auto_update);
        assert_eq!(
            config.cache_dir,
            Path::new("/var/lib/cvmfs/demo.example.org")
        );
    }

    #[test]
    fn test_server_url_substitution() {
        let config = ClientConfig::from_options(
            "atlas.cern.ch",
            &options(&[(
                "CVMFS_SERVER_URL",
                "http://a.example.com/@org@;http://b.example.com/@fqrn@",
            )]),
        )
        .unwrap();
        assert_eq!(
            config.server_urls,
            vec![
                "http://a.example.com/atlas",
                "http://b.example.com/atlas.cern.ch"
            ]
        );
    }

    #[test]
    fn test_kcache_timeout_disable() {
        let config = ClientConfig::from_options(
            "demo.example.org",
            &options(&[("CVMFS_KCACHE_TIMEOUT", "-1")]),
        )
        .unwrap();
        assert_eq!(config.kcache_timeout, 0.0);
    }

    #[test]
    fn test_quota_limit_modes() {
        let bypass =
            ClientConfig::from_options("r", &options(&[("CVMFS_QUOTA_LIMIT", "0")])).unwrap();
        assert_eq!(bypass.quota_limit, 0);
        let unmanaged =
            ClientConfig::from_options("r", &options(&[("CVMFS_QUOTA_LIMIT", "-1")])).unwrap();
        assert_eq!(unmanaged.quota_limit, u64::MAX);
        let limited =
            ClientConfig::from_options("r", &options(&[("CVMFS_QUOTA_LIMIT", "100")])).unwrap();
        assert_eq!(limited.quota_limit, 100 * 1024 * 1024);
    }

    #[test]
    fn test_bad_numeric_value_is_boot_error() {
        assert!(matches!(
            ClientConfig::from_options("r", &options(&[("CVMFS_TIMEOUT", "soon")])),
            Err(BootError::Options(_))
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = ClientConfig::from_options(
            "r",
            &options(&[("CVMFS_FUTURE_FEATURE", "whatever")]),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_shared_cache_path() {
        let config = ClientConfig::from_options(
            "r",
            &options(&[
                ("CVMFS_CACHE_BASE", "/scratch/cvmfs"),
                ("CVMFS_SHARED_CACHE", "yes"),
            ]),
        )
        .unwrap();
        assert_eq!(config.cache_dir, Path::new("/scratch/cvmfs/r"));
        assert_eq!(
            config.shared_dir.as_deref(),
            Some(Path::new("/scratch/cvmfs/shared"))
        );
    }

    #[test]
    fn test_config_file_parsing() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("default.conf");
        std::fs::write(
            &file,
            "# comment\nexport CVMFS_TIMEOUT=9\nCVMFS_HTTP_PROXY=\"http://proxy:3128\"\n",
        )
        .unwrap();
        let mut opts = HashMap::new();
        parse_config_file(&file, &mut opts).unwrap();
        assert_eq!(opts["CVMFS_TIMEOUT"], "9");
        assert_eq!(opts["CVMFS_HTTP_PROXY"], "http://proxy:3128");
    }

    #[test]
    fn test_owner_map_parsing() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("uid.map");
        std::fs::write(&file, "# remap\n123 1000\n124 1001\n").unwrap();
        let map = parse_owner_map(&file).unwrap();
        assert_eq!(map.map(123), 1000);
        assert_eq!(map.map(999), 999);

        std::fs::write(&file, "garbage\n").unwrap();
        assert!(parse_owner_map(&file).is_err());
    }
}
