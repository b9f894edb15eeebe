//! Domain types shared across the workspace.

pub mod cache;
pub mod job;
pub mod options;
pub mod result;
pub mod subtitle;

pub use cache::SourceCacheEntry;
pub use job::{
    EventLevel, JobKind, JobRecord, JobStatus, PROGRESS_EVENT_CAPACITY,
    PROGRESS_EVENT_RETURN_LIMIT, ProgressEvent, SourceMode, StageDetail, SyncDiagnostics,
};
pub use options::{
    AsrProfile, DEFAULT_ASR_BASE_URL, DEFAULT_LLM_BASE_URL, DEFAULT_LLM_MODEL,
    LOCAL_WHISPER_MODELS, LlmOptions, PipelineOptions, QWEN_MT_FLASH_MODEL, WhisperOptions,
    WhisperRuntime,
};
pub use result::{PipelineOutput, PipelineStats, TranslationUsage};
pub use subtitle::{
    AlignmentDiagnostics, AlignmentMode, Sentence, Subtitle, WordSegment, WordSource,
    normalize_token, round3,
};
