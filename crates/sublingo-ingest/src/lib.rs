//! URL ingestion for sublingo: normalization, cached downloads, yt-dlp
//! failover.

pub mod cache;
pub mod normalize;
pub mod ytdlp;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sublingo_core::{
    ErrorCode, PipelineError, ServiceSettings, SourceCacheIndexPort, StageResult, stage,
};

pub use cache::{SourceCache, SourceCachePolicy, materialize_cached_file, sha256_file};
pub use normalize::{extract_url_candidates, normalize_source_url};
pub use ytdlp::{YtDlpCommand, resolve_commands, run_download};

/// Failure codes that justify trying the next yt-dlp source.
const FAILOVER_CODES: [ErrorCode; 3] = [
    ErrorCode::YtDlpLaunchFailed,
    ErrorCode::YtDlpCommandFailed,
    ErrorCode::DownloadOutputMissing,
];

/// Fetches URL sources into job work dirs, deduplicating through the
/// content-addressed cache.
pub struct UrlIngestor {
    settings: ServiceSettings,
    cache: SourceCache,
}

impl UrlIngestor {
    pub fn new(settings: ServiceSettings, index: Arc<dyn SourceCacheIndexPort>) -> Self {
        let policy = SourceCachePolicy {
            root: settings.cache_root.clone(),
            ttl_seconds: i64::try_from(settings.cache_ttl().as_secs()).unwrap_or(i64::MAX),
            max_bytes: settings.cache_max_bytes,
        };
        Self {
            settings,
            cache: SourceCache::new(policy, index),
        }
    }

    /// Fetch the media behind `source_url` into `output_dir`.
    ///
    /// Cache hits materialize via hardlink and finish in milliseconds.
    /// Misses walk the yt-dlp invocation list, failing over on launch and
    /// command errors, and record the result into the cache on success.
    pub async fn fetch(
        &self,
        source_url: &str,
        output_dir: &Path,
        cancel: &(dyn Fn() -> bool + Send + Sync),
        on_progress: &(dyn Fn(u8, &str) + Send + Sync),
    ) -> StageResult<PathBuf> {
        let normalized = normalize_source_url(source_url)?;

        if let Some(cached) = self.cache.lookup(&normalized).await? {
            on_progress(95, "video cache hit, reusing downloaded media");
            let materialized = materialize_cached_file(&cached, output_dir).await?;
            on_progress(100, "cached video reused, preparing audio extraction");
            tracing::info!(
                target: "sublingo.ingest",
                url = %normalized,
                file = %cached.display(),
                "url ingest cache hit"
            );
            return Ok(materialized);
        }

        let commands = resolve_commands(&self.settings.ytdlp);
        if commands.is_empty() {
            return Err(PipelineError::new(
                stage::DOWNLOAD_SOURCE,
                ErrorCode::YtDlpNotAvailable,
                "yt-dlp was not found, no usable entry point",
            )
            .with_detail(
                "check YT_DLP_LOCAL_ENTRY, YT_DLP_EXECUTABLE, YT_DLP_SEARCH_ROOTS, or a yt-dlp \
                 executable on PATH",
            ));
        }

        let timeout = self.settings.effective_download_timeout();
        let mut last_error: Option<PipelineError> = None;
        for command in &commands {
            tracing::debug!(
                target: "sublingo.ingest",
                source = %command.source,
                "url ingest trying yt-dlp source"
            );
            match run_download(command, &normalized, output_dir, cancel, on_progress, timeout).await
            {
                Ok(downloaded) => {
                    if let Err(error) = self.cache.store(&normalized, &downloaded).await {
                        tracing::warn!(
                            target: "sublingo.ingest",
                            error = %error,
                            "url ingest cache store failed"
                        );
                    }
                    tracing::info!(
                        target: "sublingo.ingest",
                        url = %normalized,
                        file = %downloaded.display(),
                        source = %command.source,
                        "url ingest downloaded file"
                    );
                    return Ok(downloaded);
                }
                Err(error) if FAILOVER_CODES.contains(&error.code) => {
                    tracing::debug!(
                        target: "sublingo.ingest",
                        source = %command.source,
                        code = error.code.as_str(),
                        message = %error.message,
                        "yt-dlp source failed, trying next"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        let detail = last_error
            .and_then(|error| error.detail)
            .unwrap_or_else(|| "unknown".to_string());
        Err(PipelineError::new(
            stage::DOWNLOAD_SOURCE,
            ErrorCode::DownloadFailed,
            "source media download failed",
        )
        .with_detail(detail))
    }
}

// Silence unused dev-dependency warnings
#[cfg(test)]
use tokio_test as _;
