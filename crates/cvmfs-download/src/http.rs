//! Reqwest-backed downloader with failover chains.
//!
//! Hosts are tried in order; a host that fails is demoted for the duration
//! of the reset delay. Proxies work the same way. Each attempt uses the
//! proxied or direct timeout depending on whether a proxy is active.
//! Retries back off exponentially between attempts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::{DownloadError, Downloader, Result};

/// Tuning knobs for [`HttpDownloader`]. Defaults mirror the client's
/// conservative boot configuration.
#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    /// Host URLs tried in order (already `@org@`/`@fqrn@`-substituted).
    pub hosts: Vec<String>,
    /// Proxy URLs tried in order; empty means direct connections only.
    pub proxies: Vec<String>,
    /// Timeout for proxied requests, seconds.
    pub timeout: u64,
    /// Timeout for direct requests, seconds.
    pub timeout_direct: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// First backoff delay, milliseconds.
    pub backoff_init_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub backoff_max_ms: u64,
    /// Return to the primary host after this many seconds (0 = never).
    pub host_reset_after: u64,
    /// Return to the primary proxy after this many seconds (0 = never).
    pub proxy_reset_after: u64,
}

impl Default for HttpDownloaderConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            proxies: Vec::new(),
            timeout: 2,
            timeout_direct: 2,
            max_retries: 1,
            backoff_init_ms: 2000,
            backoff_max_ms: 10_000,
            host_reset_after: 0,
            proxy_reset_after: 0,
        }
    }
}

/// Transfer statistics, readable as a snapshot for the runtime xattrs.
#[derive(Debug, Default)]
pub struct DownloadStats {
    pub transferred_bytes: AtomicU64,
    /// Accumulated transfer wall time, milliseconds.
    pub transfer_time_ms: AtomicU64,
    pub num_requests: AtomicU64,
    pub num_failures: AtomicU64,
}

impl DownloadStats {
    pub fn transferred_kb(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed) / 1024
    }

    /// Average throughput in KiB/s, `None` before the first transfer.
    pub fn speed_kbps(&self) -> Option<u64> {
        let ms = self.transfer_time_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        Some(self.transferred_kb() * 1000 / ms)
    }
}

struct ChainState {
    active: usize,
    /// When the active entry was demoted from the primary, for reset.
    failed_since: Option<Instant>,
}

/// Blocking HTTP downloader with host/proxy failover.
pub struct HttpDownloader {
    config: HttpDownloaderConfig,
    client: reqwest::blocking::Client,
    client_direct: reqwest::blocking::Client,
    host_state: Mutex<ChainState>,
    proxy_state: Mutex<ChainState>,
    stats: DownloadStats,
}

impl HttpDownloader {
    pub fn new(config: HttpDownloaderConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)));
        if let Some(proxy_url) = config.proxies.first() {
            if let Ok(proxy) = reqwest::Proxy::all(proxy_url) {
                builder = builder.proxy(proxy);
            }
        }
        let client = builder
            .build()
            .map_err(|e| DownloadError::Connection(e.to_string()))?;
        let client_direct = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_direct.max(1)))
            .no_proxy()
            .build()
            .map_err(|e| DownloadError::Connection(e.to_string()))?;
        Ok(Self {
            config,
            client,
            client_direct,
            host_state: Mutex::new(ChainState {
                active: 0,
                failed_since: None,
            }),
            proxy_state: Mutex::new(ChainState {
                active: 0,
                failed_since: None,
            }),
            stats: DownloadStats::default(),
        })
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    /// The currently active host, for `user.host`.
    pub fn active_host(&self) -> Option<String> {
        let state = self.host_state.lock().unwrap();
        self.config.hosts.get(state.active).cloned()
    }

    /// The currently active proxy, "DIRECT" when none is configured.
    pub fn active_proxy(&self) -> String {
        let state = self.proxy_state.lock().unwrap();
        self.config
            .proxies
            .get(state.active)
            .cloned()
            .unwrap_or_else(|| "DIRECT".to_string())
    }

    pub fn timeouts(&self) -> (u64, u64) {
        (self.config.timeout, self.config.timeout_direct)
    }

    fn pick_host(&self) -> Option<String> {
        let mut state = self.host_state.lock().unwrap();
        if let Some(since) = state.failed_since {
            if self.config.host_reset_after > 0
                && since.elapsed() >= Duration::from_secs(self.config.host_reset_after)
            {
                state.active = 0;
                state.failed_since = None;
            }
        }
        self.config.hosts.get(state.active).cloned()
    }

    fn fail_host(&self) {
        let mut state = self.host_state.lock().unwrap();
        if self.config.hosts.len() > 1 {
            state.active = (state.active + 1) % self.config.hosts.len();
        }
        state.failed_since.get_or_insert_with(Instant::now);
    }

    fn backoff(&self, attempt: u32) {
        // Jittered exponential backoff: the first delay is drawn below the
        // configured initial value so simultaneous clients spread out.
        let base = self
            .config
            .backoff_init_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.backoff_max_ms);
        let jittered = rand::thread_rng().gen_range(base / 2..=base.max(1));
        std::thread::sleep(Duration::from_millis(jittered));
    }

    fn attempt(&self, url: &str, sink: &mut dyn Write) -> Result<u64> {
        let use_proxy = !self.config.proxies.is_empty();
        let client = if use_proxy {
            &self.client
        } else {
            &self.client_direct
        };
        let started = Instant::now();
        let mut response = client.get(url).send().map_err(map_reqwest_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let nbytes = response
            .copy_to(sink)
            .map_err(|e| DownloadError::Connection(e.to_string()))?;
        self.stats
            .transferred_bytes
            .fetch_add(nbytes, Ordering::Relaxed);
        self.stats.transfer_time_ms.fetch_add(
            started.elapsed().as_millis().max(1) as u64,
            Ordering::Relaxed,
        );
        Ok(nbytes)
    }
}

impl Downloader for HttpDownloader {
    fn fetch_into(&self, rel_path: &str, sink: &mut dyn Write) -> Result<u64> {
        self.stats.num_requests.fetch_add(1, Ordering::Relaxed);
        let attempts = self.config.max_retries + 1;
        let mut last_err = DownloadError::Exhausted(attempts);
        for attempt in 0..attempts {
            let Some(host) = self.pick_host() else {
                return Err(DownloadError::Connection("no hosts configured".into()));
            };
            let url = format!("{}/{}", host.trim_end_matches('/'), rel_path);
            debug!(url = %url, attempt, "fetching object");
            match self.attempt(&url, sink) {
                Ok(nbytes) => return Ok(nbytes),
                // A 404 is authoritative, no point hammering the mirrors.
                Err(e @ DownloadError::NotFound(_)) => {
                    self.stats.num_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "fetch attempt failed");
                    self.fail_host();
                    last_err = e;
                    if attempt + 1 < attempts {
                        self.backoff(attempt);
                    }
                }
            }
        }
        self.stats.num_failures.fetch_add(1, Ordering::Relaxed);
        Err(last_err)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout(err.to_string())
    } else if err.is_connect() {
        DownloadError::Connection(err.to_string())
    } else {
        DownloadError::Connection(err.to_string())
    }
}
