//! Translation engine.
//!
//! Two explicit strategies selected at pipeline construction:
//!
//! - [`ChunkedLlmStrategy`]: batch sentences under dual (item, char)
//!   limits and ask a generic LLM for a row-keyed JSON object per batch.
//! - [`QwenMtDirectStrategy`]: the dedicated `qwen-mt-flash` translation
//!   model; one call for all rows, `translation_options` body, tolerant
//!   response parsing, and a halving fallback on context overflow.

mod qwen_mt;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use sublingo_core::{
    CancelCheck, ErrorCode, LlmOptions, PipelineError, StageResult, TranslationUsage, stage,
};

use crate::llm::{LLM_REQUEST_TIMEOUT, LlmClient, LlmUsageSnapshot};

pub use qwen_mt::QwenMtDirectStrategy;

/// Dual batch limits for the generic-LLM path.
#[derive(Clone, Copy, Debug)]
pub struct TranslationLimits {
    /// Hard cap on rows per batch.
    pub max_items: usize,
    /// Soft cap on summed text length per batch.
    pub max_chars: usize,
    /// The char cap only applies once a batch holds this many rows.
    pub min_items: usize,
}

impl Default for TranslationLimits {
    fn default() -> Self {
        Self {
            max_items: 28,
            max_chars: 2_600,
            min_items: 8,
        }
    }
}

/// One translation run over the job's sentence texts.
#[derive(Clone, Debug)]
pub struct TranslationRequest {
    pub texts: Vec<String>,
    pub source_language: String,
    pub target_language: String,
}

/// Translations plus usage for metering.
#[derive(Clone, Debug)]
pub struct TranslationOutcome {
    pub translations: Vec<String>,
    pub batch_count: usize,
    pub llm_usage: LlmUsageSnapshot,
    pub translation_usage: TranslationUsage,
}

/// Pluggable translation backend.
#[async_trait]
pub trait TranslationStrategy: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancelCheck,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> StageResult<TranslationOutcome>;
}

/// Pick the strategy for the configured model.
pub fn select_strategy(
    options: &LlmOptions,
    limits: TranslationLimits,
) -> StageResult<Box<dyn TranslationStrategy>> {
    if options.is_translation_model() {
        Ok(Box::new(QwenMtDirectStrategy::new(options.clone())?))
    } else {
        let client = LlmClient::new(options.clone(), LLM_REQUEST_TIMEOUT)?;
        Ok(Box::new(ChunkedLlmStrategy::new(client, limits)))
    }
}

/// Partition texts into `(start, end)` batches under both limits.
///
/// A batch always holds at least one item. The char limit yields while the
/// batch is still under `min_items`, so one oversized row never starves a
/// batch down to nothing.
#[must_use]
pub fn build_translation_batches(
    texts: &[String],
    limits: TranslationLimits,
) -> Vec<(usize, usize)> {
    if texts.is_empty() {
        return Vec::new();
    }
    let max_items = limits.max_items.max(1);
    let max_chars = limits.max_chars.max(1);
    let min_items = limits.min_items.clamp(1, max_items);

    let total = texts.len();
    let mut batches = Vec::new();
    let mut cursor = 0usize;
    while cursor < total {
        let start = cursor;
        let mut chars_in_batch = 0usize;
        while cursor < total {
            let item_chars = texts[cursor].chars().count();
            let current_count = cursor - start;
            if current_count + 1 > max_items {
                break;
            }
            if chars_in_batch + item_chars > max_chars && current_count >= min_items {
                break;
            }
            chars_in_batch += item_chars;
            cursor += 1;
        }
        if cursor == start {
            cursor += 1;
        }
        batches.push((start, cursor));
    }
    batches
}

/// Generic-LLM translation via row-keyed JSON batches.
pub struct ChunkedLlmStrategy {
    client: LlmClient,
    limits: TranslationLimits,
}

impl ChunkedLlmStrategy {
    #[must_use]
    pub const fn new(client: LlmClient, limits: TranslationLimits) -> Self {
        Self { client, limits }
    }

    fn build_prompt(request: &TranslationRequest, payload: &Map<String, Value>) -> String {
        format!(
            "You are a subtitle translation assistant. Translate the following {} subtitles \
             into {}. Return only a JSON object whose keys exactly match the input keys, with \
             the translated text as values.\n{}",
            request.source_language,
            request.target_language,
            Value::Object(payload.clone())
        )
    }
}

#[async_trait]
impl TranslationStrategy for ChunkedLlmStrategy {
    async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancelCheck,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> StageResult<TranslationOutcome> {
        let usage = self.client.usage_collector();
        let mut translations = vec![String::new(); request.texts.len()];
        let batches = build_translation_batches(&request.texts, self.limits);

        for &(start, end) in &batches {
            if cancel() {
                return Err(PipelineError::cancel_requested(stage::LLM_TRANSLATE));
            }

            let mut payload = Map::new();
            for (offset, text) in request.texts[start..end].iter().enumerate() {
                payload.insert(format!("id_{offset}"), Value::String(text.clone()));
            }
            let prompt = Self::build_prompt(request, &payload);
            let data = self.client.chat_json(&prompt, &usage).await?;

            for offset in 0..(end - start) {
                let key = format!("id_{offset}");
                let Some(value) = data.get(&key).and_then(Value::as_str) else {
                    return Err(PipelineError::new(
                        stage::LLM,
                        ErrorCode::LlmInvalidJson,
                        "LLM translation response is missing row keys",
                    )
                    .with_detail_json(&json!({
                        "missing_key": key,
                        "batch_start": start,
                        "batch_end": end,
                        "returned_keys": data.as_object()
                            .map(|object| object.keys().cloned().collect::<Vec<_>>())
                            .unwrap_or_default(),
                    })));
                };
                translations[start + offset] = value.trim().to_string();
            }

            on_progress(end, request.texts.len());
            if cancel() {
                return Err(PipelineError::cancel_requested(stage::LLM_TRANSLATE));
            }
        }

        Ok(TranslationOutcome {
            translations,
            batch_count: batches.len(),
            llm_usage: usage.snapshot(),
            translation_usage: TranslationUsage {
                mode_effective: "llm_model".to_string(),
                ..TranslationUsage::default()
            },
        })
    }
}
