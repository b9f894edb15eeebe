//! Job submission options.
//!
//! Options are immutable after job creation and travel with the persisted
//! record, so every type here is serializable and self-describing.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PipelineError, StageResult, stage};

/// Default LLM endpoint when the user leaves the base URL empty.
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.siliconflow.cn/v1";

/// Default LLM model.
pub const DEFAULT_LLM_MODEL: &str = "tencent/Hunyuan-MT-7B";

/// Default cloud ASR endpoint.
pub const DEFAULT_ASR_BASE_URL: &str = "https://dashscope.aliyuncs.com";

/// Dedicated translation model that bypasses chunked LLM translation.
pub const QWEN_MT_FLASH_MODEL: &str = "qwen-mt-flash";

/// Model names accepted by the local whisper runtimes.
pub const LOCAL_WHISPER_MODELS: [&str; 5] = ["tiny", "base", "small", "medium", "large-v3"];

/// Where transcription runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperRuntime {
    #[default]
    Cloud,
    Local,
}

impl WhisperRuntime {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }

    /// Parse a user-supplied runtime tag. Unknown values are an error so a
    /// typo never silently selects the cloud path.
    pub fn parse(value: &str) -> StageResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            other => Err(PipelineError::new(
                stage::ASR,
                ErrorCode::InvalidRuntime,
                format!("unsupported whisper runtime: {other}"),
            )),
        }
    }
}

/// Transcription accuracy/latency trade-off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsrProfile {
    Fast,
    #[default]
    Balanced,
    Accurate,
}

impl AsrProfile {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Accurate => "accurate",
        }
    }

    /// Unknown profiles fall back to `balanced`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Self::Fast,
            "accurate" => Self::Accurate,
            _ => Self::Balanced,
        }
    }
}

/// ASR configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperOptions {
    pub runtime: WhisperRuntime,
    /// Cloud model id (`paraformer-v2`, `qwen3-asr-flash-filetrans`) or a
    /// local model name (`tiny` … `large-v3`).
    pub model: String,
    /// Source language hint forwarded to the provider.
    pub language: String,
    /// Cloud ASR base URL; empty means the provider default.
    pub base_url: String,
    /// Cloud ASR API key.
    pub api_key: String,
    /// HuggingFace token for whisperx diarization models.
    pub hf_token: String,
}

impl WhisperOptions {
    /// Validate the model against the selected runtime.
    ///
    /// Local runtimes only accept the fixed whisper model set; cloud-only
    /// identifiers are rejected with `invalid_whisper_model`.
    pub fn validate_local_model(&self) -> StageResult<()> {
        if self.runtime != WhisperRuntime::Local {
            return Ok(());
        }
        let model = self.model.trim();
        if model.is_empty() || LOCAL_WHISPER_MODELS.contains(&model) {
            return Ok(());
        }
        Err(PipelineError::new(
            stage::ASR,
            ErrorCode::InvalidWhisperModel,
            format!("model '{model}' is not available in the local runtime"),
        )
        .with_detail(format!("allowed={}", LOCAL_WHISPER_MODELS.join(","))))
    }

    /// Effective local model, defaulting by profile when unset.
    #[must_use]
    pub fn effective_local_model(&self, profile: AsrProfile) -> String {
        let model = self.model.trim();
        if !model.is_empty() && LOCAL_WHISPER_MODELS.contains(&model) {
            return model.to_string();
        }
        match profile {
            AsrProfile::Fast => "base".to_string(),
            AsrProfile::Balanced => "small".to_string(),
            AsrProfile::Accurate => "large-v3".to_string(),
        }
    }
}

/// LLM endpoint configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    /// Base URL; empty means the Silicon Flow default.
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    /// Whether the provider accepts a JSON response-format hint.
    pub support_json: bool,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key: String::new(),
            support_json: true,
        }
    }
}

impl LlmOptions {
    /// Whether the dedicated translation-model shortcut applies.
    #[must_use]
    pub fn is_translation_model(&self) -> bool {
        self.model.trim().eq_ignore_ascii_case(QWEN_MT_FLASH_MODEL)
    }
}

/// Full option set for one job. Immutable after creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub whisper: WhisperOptions,
    pub llm: LlmOptions,
    pub source_language: String,
    pub target_language: String,
    pub asr_profile: AsrProfile,
    pub enable_diarization: bool,
    /// Master switch for provider fallback chains.
    pub fallback_enabled: bool,
    /// Allow falling back from local ASR to the cloud provider.
    pub allow_cloud_fallback: bool,
    /// Allow falling back from cloud ASR to local runtimes.
    pub allow_local_fallback: bool,
}
