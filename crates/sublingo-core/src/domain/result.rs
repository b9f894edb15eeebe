//! Pipeline output and per-run statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::job::SyncDiagnostics;
use super::subtitle::{Subtitle, WordSegment};

/// Token usage for the dedicated translation-model path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationUsage {
    /// `llm_model` or `translation_model`.
    pub mode_effective: String,
    pub provider_effective: String,
    pub model_effective: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
}

/// Statistics attached to every pipeline result, consumed by the status
/// read-model and forwarded to the metered usage sink.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStats {
    pub duration_sec: f64,
    pub subtitle_count: usize,
    pub word_count: usize,
    pub whisper_runtime: String,
    pub whisper_model_requested: String,
    pub whisper_model_effective: String,
    pub asr_profile: String,
    pub asr_provider_effective: String,
    pub asr_provider_attempts: Vec<String>,
    pub asr_fallback_used: bool,
    pub llm_base_url: String,
    pub llm_provider_effective: String,
    pub llm_model_effective: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub llm_request_count: u64,
    pub provider_request_id: String,
    pub translation_batch_count: usize,
    pub translation: TranslationUsage,
    /// Wall-clock per stage.
    pub timing_ms: BTreeMap<String, u64>,
    /// Stage order as executed.
    pub stages: Vec<String>,
}

/// The value delivered to the owner on completion.
///
/// `partial` marks best-effort results salvaged after a late-stage failure;
/// the original failure travels in `partial_stage` / `partial_error`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOutput {
    pub subtitles: Vec<Subtitle>,
    pub source_srt: String,
    pub bilingual_srt: String,
    pub word_segments: Vec<WordSegment>,
    pub diagnostics: SyncDiagnostics,
    pub stats: PipelineStats,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_error: Option<String>,
}

impl PipelineOutput {
    /// Mark this output as a salvaged partial result.
    #[must_use]
    pub fn into_partial(mut self, stage: impl Into<String>, error: impl Into<String>) -> Self {
        self.partial = true;
        self.partial_stage = Some(stage.into());
        self.partial_error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_marking() {
        let output = PipelineOutput::default().into_partial("llm", "bad json");
        assert!(output.partial);
        assert_eq!(output.partial_stage.as_deref(), Some("llm"));
        assert_eq!(output.partial_error.as_deref(), Some("bad json"));
    }

    #[test]
    fn stats_serialize_with_defaults() {
        let stats = PipelineStats::default();
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["prompt_tokens"], 0);
        assert_eq!(json["asr_provider_attempts"], serde_json::json!([]));
    }
}
