//! Service settings.
//!
//! Everything configurable is injected at construction; nothing reads the
//! environment after startup. `from_env` applies the documented environment
//! overrides on top of the defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default worker count.
pub const DEFAULT_GLOBAL_CONCURRENCY: usize = 3;

/// Default per-user running-job cap.
pub const DEFAULT_PER_USER_CONCURRENCY: usize = 1;

/// Default URL download timeout.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;

/// Minimum enforceable download timeout.
pub const MIN_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// Default source-cache TTL in days.
pub const DEFAULT_CACHE_TTL_DAYS: u64 = 14;

/// Default source-cache size cap in GiB.
pub const DEFAULT_CACHE_MAX_GB: u64 = 30;

/// Hint returned to status pollers.
pub const DEFAULT_POLL_INTERVAL_MS_HINT: u64 = 1_500;

/// yt-dlp discovery configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YtDlpSettings {
    /// Explicit executable path (`YT_DLP_EXECUTABLE`).
    pub executable: Option<PathBuf>,
    /// Explicit `yt_dlp/__main__.py` entry (`YT_DLP_LOCAL_ENTRY`).
    pub local_entry: Option<PathBuf>,
    /// Roots scanned for checked-out yt-dlp trees (`YT_DLP_SEARCH_ROOTS`,
    /// `;`-separated).
    pub search_roots: Vec<PathBuf>,
}

/// Retention windows for terminal jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Failed/cancelled jobs older than this are swept.
    pub terminal_days: u64,
    /// Consumed results older than this are swept.
    pub consumed_minutes: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            terminal_days: 7,
            consumed_minutes: 10,
        }
    }
}

/// Top-level injected configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Worker count and global running-job cap (`SUBTITLE_GLOBAL_CONCURRENCY`).
    pub global_concurrency_limit: usize,
    /// Per-user running-job cap (`SUBTITLE_PER_USER_CONCURRENCY`).
    pub per_user_concurrency_limit: usize,
    /// URL download timeout, clamped to at least 60 s.
    pub download_timeout_secs: u64,
    /// Source-cache root directory.
    pub cache_root: PathBuf,
    /// Source-cache TTL (`URL_SOURCE_CACHE_TTL_DAYS`).
    pub cache_ttl_days: u64,
    /// Source-cache size cap in bytes (`URL_SOURCE_CACHE_MAX_GB`).
    pub cache_max_bytes: u64,
    pub ytdlp: YtDlpSettings,
    pub retention: RetentionSettings,
    /// Poll interval hint surfaced in the status read-model.
    pub poll_interval_ms_hint: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            global_concurrency_limit: DEFAULT_GLOBAL_CONCURRENCY,
            per_user_concurrency_limit: DEFAULT_PER_USER_CONCURRENCY,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            cache_root: PathBuf::from("runtime/source-cache"),
            cache_ttl_days: DEFAULT_CACHE_TTL_DAYS,
            cache_max_bytes: DEFAULT_CACHE_MAX_GB * 1024 * 1024 * 1024,
            ytdlp: YtDlpSettings::default(),
            retention: RetentionSettings::default(),
            poll_interval_ms_hint: DEFAULT_POLL_INTERVAL_MS_HINT,
        }
    }
}

impl ServiceSettings {
    /// Defaults plus the documented environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(value) = read_env_usize("SUBTITLE_GLOBAL_CONCURRENCY") {
            settings.global_concurrency_limit = value.max(1);
        }
        if let Some(value) = read_env_usize("SUBTITLE_PER_USER_CONCURRENCY") {
            settings.per_user_concurrency_limit = value.max(1);
        }
        if let Some(days) = read_env_u64("URL_SOURCE_CACHE_TTL_DAYS") {
            settings.cache_ttl_days = days.max(1);
        }
        if let Some(gb) = read_env_u64("URL_SOURCE_CACHE_MAX_GB") {
            settings.cache_max_bytes = (gb * 1024 * 1024 * 1024).max(1024 * 1024);
        }
        if let Ok(path) = std::env::var("YT_DLP_EXECUTABLE") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                settings.ytdlp.executable = Some(PathBuf::from(trimmed));
            }
        }
        if let Ok(path) = std::env::var("YT_DLP_LOCAL_ENTRY") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                settings.ytdlp.local_entry = Some(PathBuf::from(trimmed));
            }
        }
        if let Ok(roots) = std::env::var("YT_DLP_SEARCH_ROOTS") {
            settings.ytdlp.search_roots = roots
                .split(';')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        settings
    }

    /// Download timeout with the 60 s floor applied.
    #[must_use]
    pub const fn effective_download_timeout(&self) -> Duration {
        let secs = if self.download_timeout_secs < MIN_DOWNLOAD_TIMEOUT_SECS {
            MIN_DOWNLOAD_TIMEOUT_SECS
        } else {
            self.download_timeout_secs
        };
        Duration::from_secs(secs)
    }

    /// Cache TTL as a duration.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days * 24 * 3_600)
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn read_env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
