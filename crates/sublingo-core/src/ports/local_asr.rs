//! Local ASR backend port.
//!
//! The dispatcher owns provider-chain logic and model-handle caching; the
//! actual inference runtimes (faster-whisper, whisperx) plug in behind this
//! trait so the chain is testable without model weights.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Intent-based transcription request for a local runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalAsrRequest {
    /// Mono 16 kHz WAV produced by the extract stage.
    pub audio_path: PathBuf,
    /// Validated local model name (`tiny` … `large-v3`).
    pub model: String,
    /// Source language hint; empty means auto-detect.
    pub language: String,
    /// Only honored by backends that support diarization.
    pub enable_diarization: bool,
    /// HuggingFace token for diarization model downloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_token: Option<String>,
}

/// One word inside a transcribed segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsrWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One transcribed segment. Words are required downstream; a backend that
/// cannot produce them forces the pipeline to abort with
/// `word_timestamps_missing`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsrSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub words: Vec<AsrWord>,
}

/// A pluggable local transcription runtime.
///
/// # Design Rules
///
/// - Express intent, not invocation detail
/// - Must support: mock backend in tests, alternative inference engines
/// - A missing runtime reports `local_runtime_missing` /
///   `local_whisperx_missing` through the normal error envelope
#[async_trait]
pub trait LocalAsrBackend: Send + Sync {
    /// Provider id this backend answers for
    /// (`local_faster_whisper` or `local_whisperx`).
    fn provider_id(&self) -> &'static str;

    /// Transcribe the audio file, returning timed segments with words.
    async fn transcribe(&self, request: &LocalAsrRequest) -> Result<Vec<AsrSegment>, PipelineError>;
}
