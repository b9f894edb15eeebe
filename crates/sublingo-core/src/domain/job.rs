//! Job record and its observable state.
//!
//! The record is the single source of truth for one job. It is persisted as
//! one JSON blob per state transition and rebuilt from that blob at startup,
//! so everything here is serializable and self-describing.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::options::PipelineOptions;
use super::result::PipelineOutput;
use super::subtitle::{Sentence, WordSegment};

/// Capacity of the per-job progress event ring buffer.
pub const PROGRESS_EVENT_CAPACITY: usize = 30;

/// How many recent events the status read-model returns.
pub const PROGRESS_EVENT_RETURN_LIMIT: usize = 12;

/// What kind of work the job performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Full pipeline over an uploaded artifact.
    #[default]
    Full,
    /// Full pipeline preceded by a URL download.
    Url,
    /// Translate/align resume over previously produced sentences.
    Resume,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Url => "url",
            Self::Resume => "resume",
        }
    }
}

/// Where the source media came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    File,
    Url,
    Resume,
}

impl SourceMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Url => "url",
            Self::Resume => "resume",
        }
    }
}

/// Lifecycle status.
///
/// Terminal statuses are monotonic: once `completed`, `failed`, or
/// `cancelled`, only `result_consumed` and housekeeping fields may change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Severity tag on a progress event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

/// One entry in the progress event ring buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub at_ms: i64,
    pub stage: String,
    pub percent: u8,
    pub message: String,
    pub level: EventLevel,
}

/// Live detail for the current step inside a stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDetail {
    pub stage: String,
    pub step_key: String,
    pub step_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_in_stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub updated_at_ms: i64,
}

/// Timing-correction diagnostics stored after completion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncDiagnostics {
    pub alignment_quality_score: f64,
    pub global_offset_ms: i64,
    pub drift_scale: f64,
    pub correction_applied: bool,
    pub correction_method: String,
    pub triggered: bool,
    pub correction_score: f64,
    pub fallback_rows: usize,
    pub fallback_ratio: f64,
    pub alignment_mode: String,
    pub quality_gate_triggered: bool,
}

/// The full mutable state of one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    /// Opaque URL-safe unique token.
    pub job_id: String,
    /// Opaque owner id supplied by the identity collaborator.
    pub user_id: String,
    pub kind: JobKind,
    pub source_mode: SourceMode,
    /// Filesystem directory exclusively owned by this job.
    pub work_dir: PathBuf,
    /// Empty until the URL fetch completes for `url` jobs.
    pub video_path: PathBuf,
    pub source_url: String,
    /// Immutable after creation.
    pub options: PipelineOptions,

    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_stage: String,
    pub message: String,
    pub error: Option<String>,
    pub error_code: String,
    pub error_detail: Option<serde_json::Value>,

    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,

    pub result: Option<PipelineOutput>,
    pub result_consumed: bool,
    pub partial_result: Option<PipelineOutput>,
    pub cancel_requested: bool,

    /// Cumulative time spent per stage. Closing an active stage adds
    /// `now - stage_started_at` to its bucket before switching.
    pub stage_durations_ms: BTreeMap<String, u64>,
    /// Stages in first-entered order.
    pub stage_order: Vec<String>,
    pub stage_started_at_ms: Option<i64>,
    pub stage_detail: Option<StageDetail>,
    /// Ring buffer of recent progress events (capacity 30, last 12 served).
    pub recent_progress_events: VecDeque<ProgressEvent>,
    /// Strictly increases on every externally visible mutation.
    pub status_revision: u64,
    pub sync_diagnostics: Option<SyncDiagnostics>,

    /// Effective runtime/model bookkeeping surfaced in the status view.
    pub whisper_runtime: String,
    pub whisper_model_requested: String,
    pub whisper_model_effective: String,
    pub asr_provider_effective: String,
    pub asr_fallback_used: bool,

    /// Resume inputs (only for `kind = resume`).
    pub resume_sentences: Vec<Sentence>,
    pub resume_word_segments: Vec<WordSegment>,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            user_id: String::new(),
            kind: JobKind::Full,
            source_mode: SourceMode::File,
            work_dir: PathBuf::new(),
            video_path: PathBuf::new(),
            source_url: String::new(),
            options: PipelineOptions::default(),
            status: JobStatus::Queued,
            progress_percent: 0,
            current_stage: crate::error::stage::QUEUED.to_string(),
            message: String::new(),
            error: None,
            error_code: String::new(),
            error_detail: None,
            created_at_ms: 0,
            started_at_ms: None,
            updated_at_ms: 0,
            completed_at_ms: None,
            result: None,
            result_consumed: false,
            partial_result: None,
            cancel_requested: false,
            stage_durations_ms: BTreeMap::new(),
            stage_order: Vec::new(),
            stage_started_at_ms: None,
            stage_detail: None,
            recent_progress_events: VecDeque::new(),
            status_revision: 0,
            sync_diagnostics: None,
            whisper_runtime: String::new(),
            whisper_model_requested: String::new(),
            whisper_model_effective: String::new(),
            asr_provider_effective: String::new(),
            asr_fallback_used: false,
            resume_sentences: Vec::new(),
            resume_word_segments: Vec::new(),
        }
    }
}

impl JobRecord {
    /// Push a progress event, evicting the oldest past capacity.
    pub fn push_progress_event(&mut self, event: ProgressEvent) {
        if self.recent_progress_events.len() >= PROGRESS_EVENT_CAPACITY {
            self.recent_progress_events.pop_front();
        }
        self.recent_progress_events.push_back(event);
    }

    /// Bump the externally visible revision counter.
    pub fn bump_revision(&mut self) {
        self.status_revision = self.status_revision.saturating_add(1);
    }

    /// Close the active stage bucket and account its elapsed time.
    pub fn close_active_stage(&mut self, now_ms: i64) {
        if let Some(started) = self.stage_started_at_ms.take() {
            if self.current_stage.is_empty() {
                return;
            }
            let elapsed = u64::try_from((now_ms - started).max(0)).unwrap_or(0);
            *self
                .stage_durations_ms
                .entry(self.current_stage.clone())
                .or_insert(0) += elapsed;
        }
    }

    /// Transition to `next_stage`, closing the previous stage bucket first.
    /// Re-entering the current stage is a no-op.
    pub fn transition_stage(&mut self, next_stage: &str, now_ms: i64) {
        if next_stage.is_empty() || next_stage == self.current_stage {
            return;
        }
        self.close_active_stage(now_ms);
        self.current_stage = next_stage.to_string();
        if !self.stage_order.iter().any(|s| s == next_stage) {
            self.stage_order.push(next_stage.to_string());
        }
        self.stage_started_at_ms = Some(now_ms);
        self.stage_durations_ms
            .entry(next_stage.to_string())
            .or_insert(0);
    }
}
