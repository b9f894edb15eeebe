//! Pipeline error envelope.
//!
//! Every failure in the system is expressed as a single serializable
//! envelope `{stage, code, message, detail}`. Stages are free-form tags
//! (see [`stage`]); codes form a closed taxonomy so callers can branch on
//! them without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known stage tags.
///
/// Stages stay plain strings on the wire because the job record treats
/// `current_stage` as a display tag, but internal code should use these
/// constants.
pub mod stage {
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const DOWNLOAD_SOURCE: &str = "download_source";
    pub const EXTRACT_AUDIO: &str = "extract_audio";
    pub const ASR: &str = "asr";
    pub const LLM_PRECHECK: &str = "llm_precheck";
    pub const LLM: &str = "llm";
    pub const LLM_TRANSLATE: &str = "llm_translate";
    pub const ALIGN_AND_BUILD: &str = "align_and_build";
    pub const COMPLETED: &str = "completed";
    pub const CANCELLING: &str = "cancelling";
    pub const CANCELLED: &str = "cancelled";
    pub const PIPELINE: &str = "pipeline";
}

/// Closed error-code taxonomy.
///
/// Serialized as `snake_case` strings so persisted job rows and HTTP
/// adapters see stable identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    FfmpegMissing,
    FfmpegExtractFailed,
    InvalidSourceUrl,
    YtDlpNotAvailable,
    YtDlpLaunchFailed,
    YtDlpCommandFailed,
    DownloadOutputMissing,
    DownloadTimeout,
    DownloadFailed,
    CloudAsrFailed,
    LocalRuntimeMissing,
    LocalAsrFailed,
    LocalWhisperxMissing,
    LocalWhisperxFailed,
    LocalWhisperxEmptySegments,
    AsrEmptySegments,
    AsrTextEmpty,
    AsrProviderChainEmpty,
    AsrProviderUnknown,
    AsrAllProvidersFailed,
    WordTimestampsMissing,
    InvalidWhisperModel,
    InvalidRuntime,
    MissingLlmApiKey,
    LlmAccessDenied,
    LlmRequestFailed,
    LlmInvalidJson,
    TimestampAlignmentFailed,
    CancelRequested,
    PipelineUnexpectedError,
    ServiceRestarted,
    StorageFailed,
}

impl ErrorCode {
    /// Stable string form, identical to the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FfmpegMissing => "ffmpeg_missing",
            Self::FfmpegExtractFailed => "ffmpeg_extract_failed",
            Self::InvalidSourceUrl => "invalid_source_url",
            Self::YtDlpNotAvailable => "yt_dlp_not_available",
            Self::YtDlpLaunchFailed => "yt_dlp_launch_failed",
            Self::YtDlpCommandFailed => "yt_dlp_command_failed",
            Self::DownloadOutputMissing => "download_output_missing",
            Self::DownloadTimeout => "download_timeout",
            Self::DownloadFailed => "download_failed",
            Self::CloudAsrFailed => "cloud_asr_failed",
            Self::LocalRuntimeMissing => "local_runtime_missing",
            Self::LocalAsrFailed => "local_asr_failed",
            Self::LocalWhisperxMissing => "local_whisperx_missing",
            Self::LocalWhisperxFailed => "local_whisperx_failed",
            Self::LocalWhisperxEmptySegments => "local_whisperx_empty_segments",
            Self::AsrEmptySegments => "asr_empty_segments",
            Self::AsrTextEmpty => "asr_text_empty",
            Self::AsrProviderChainEmpty => "asr_provider_chain_empty",
            Self::AsrProviderUnknown => "asr_provider_unknown",
            Self::AsrAllProvidersFailed => "asr_all_providers_failed",
            Self::WordTimestampsMissing => "word_timestamps_missing",
            Self::InvalidWhisperModel => "invalid_whisper_model",
            Self::InvalidRuntime => "invalid_runtime",
            Self::MissingLlmApiKey => "missing_llm_api_key",
            Self::LlmAccessDenied => "llm_access_denied",
            Self::LlmRequestFailed => "llm_request_failed",
            Self::LlmInvalidJson => "llm_invalid_json",
            Self::TimestampAlignmentFailed => "timestamp_alignment_failed",
            Self::CancelRequested => "cancel_requested",
            Self::PipelineUnexpectedError => "pipeline_unexpected_error",
            Self::ServiceRestarted => "service_restarted",
            Self::StorageFailed => "storage_failed",
        }
    }

    /// Whether a user retry (with the same inputs) can plausibly succeed.
    #[must_use]
    pub const fn is_user_retryable(self) -> bool {
        matches!(
            self,
            Self::InvalidSourceUrl
                | Self::YtDlpNotAvailable
                | Self::YtDlpLaunchFailed
                | Self::YtDlpCommandFailed
                | Self::DownloadOutputMissing
                | Self::DownloadTimeout
                | Self::DownloadFailed
                | Self::CloudAsrFailed
                | Self::LocalAsrFailed
                | Self::LocalWhisperxFailed
                | Self::AsrAllProvidersFailed
                | Self::MissingLlmApiKey
                | Self::LlmAccessDenied
                | Self::LlmRequestFailed
                | Self::LlmInvalidJson
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single failure envelope produced at every failure point.
///
/// Designed to be serializable across the persistence and HTTP boundaries
/// without depending on non-serializable error types; I/O and HTTP causes
/// are captured as strings in `detail`.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("[{stage}] {code}: {message}")]
pub struct PipelineError {
    /// Stage tag the failure was observed in.
    pub stage: String,
    /// Taxonomy code.
    pub code: ErrorCode,
    /// User-facing message.
    pub message: String,
    /// Diagnostic payload, often a JSON blob. Truncated at the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PipelineError {
    pub fn new(stage: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            code,
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a JSON value as the detail payload.
    #[must_use]
    pub fn with_detail_json(mut self, detail: &serde_json::Value) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    /// Cancellation observed at a cooperative checkpoint.
    pub fn cancel_requested(stage: impl Into<String>) -> Self {
        Self::new(
            stage,
            ErrorCode::CancelRequested,
            "cancellation requested, task stopped at the next checkpoint",
        )
    }

    /// Wrap a panic-adjacent unexpected failure.
    pub fn unexpected(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorCode::PipelineUnexpectedError, message)
    }

    #[must_use]
    pub fn is_cancel(&self) -> bool {
        self.code == ErrorCode::CancelRequested
    }

    /// Re-tag the stage, keeping code/message/detail. The pipeline engine
    /// uses this to attach the current stage to bubbled-up failures.
    #[must_use]
    pub fn at_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }
}

/// Convenience result alias for stage-level operations.
pub type StageResult<T> = Result<T, PipelineError>;
