//! Core domain types and port definitions for the sublingo subtitle
//! pipeline orchestrator.
//!
//! This crate holds only domain types, the error envelope, port traits,
//! settings, and work-dir paths. Adapters (SQLite, yt-dlp, HTTP providers)
//! and orchestration live in sibling crates.

pub mod domain;
pub mod error;
pub mod paths;
pub mod ports;
pub mod progress;
pub mod settings;

// Re-export commonly used types for convenience
pub use domain::{
    AlignmentDiagnostics, AlignmentMode, AsrProfile, EventLevel, JobKind, JobRecord, JobStatus,
    LlmOptions, PROGRESS_EVENT_CAPACITY, PROGRESS_EVENT_RETURN_LIMIT, PipelineOptions,
    PipelineOutput, PipelineStats, ProgressEvent, Sentence, SourceCacheEntry, SourceMode,
    StageDetail, Subtitle, SyncDiagnostics, TranslationUsage, WhisperOptions, WhisperRuntime,
    WordSegment, WordSource, normalize_token, round3,
};
pub use error::{ErrorCode, PipelineError, StageResult, stage};
pub use paths::{WorkDir, safe_remove_tree, sanitize_filename};
pub use ports::{
    AsrSegment, AsrWord, JobStorePort, LocalAsrBackend, LocalAsrRequest, NoopUsageSink,
    SourceCacheIndexPort, StoreError, StoredJobRow, UsageRecord, UsageSinkPort,
};
pub use progress::{CancelCheck, ProgressFn, ProgressUpdate, never_cancel, noop_progress};
pub use settings::{RetentionSettings, ServiceSettings, YtDlpSettings};

/// Generate a URL-safe opaque job id.
#[must_use]
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Silence unused dev-dependency warnings until we add mock-based tests
#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tokio_test as _;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_url_safe_and_unique() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(a.len(), 32);
    }
}
