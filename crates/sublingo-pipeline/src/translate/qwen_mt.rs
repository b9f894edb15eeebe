//! Dedicated `qwen-mt-flash` translation strategy.
//!
//! Bypasses batching: every row goes out in a single call carrying a
//! `translation_options` body. The response content may be a JSON object
//! or newline-delimited `id_N: translation` lines. On context overflow
//! (HTTP 400/413 with an overflow hint) the payload is halved and retried,
//! bounded by a recursion depth.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use sublingo_core::{
    CancelCheck, ErrorCode, LlmOptions, PipelineError, StageResult, TranslationUsage, stage,
};

use crate::llm::client::truncate;
use crate::llm::{
    LlmUsageSnapshot, UsageCollector, extract_usage_from_payload, infer_llm_provider,
    normalize_llm_base_url,
};

use super::{TranslationOutcome, TranslationRequest, TranslationStrategy};

/// Provider label for metering.
pub const QWEN_MT_FLASH_PROVIDER: &str = "dashscope_qwen_mt_flash";

/// Default endpoint when the user leaves the base URL empty.
const DEFAULT_QWEN_MT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Maximum halving depth for the context-overflow fallback.
const MAX_SPLIT_RECURSION_DEPTH: usize = 12;

/// Request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Error-text fragments that identify a context-length overflow.
const CONTEXT_OVERFLOW_HINTS: [&str; 6] = [
    "maximum context",
    "context length",
    "too long",
    "token",
    "length",
    "input is too long",
];

static BATCH_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^id_(\d+)$").expect("batch key regex"));
static BATCH_LINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(id_\d+)\s*[:：]\s*(.*)$").expect("batch line regex"));

/// The `qwen-mt-flash` direct strategy.
pub struct QwenMtDirectStrategy {
    http: reqwest::Client,
    options: LlmOptions,
    endpoint: String,
}

impl QwenMtDirectStrategy {
    pub fn new(options: LlmOptions) -> StageResult<Self> {
        let base = normalize_qwen_base_url(&options.base_url);
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::unexpected(stage::LLM, format!("http client: {e}")))?;
        Ok(Self {
            http,
            options,
            endpoint: format!("{base}/chat/completions"),
        })
    }

    /// Translate a key-ordered payload, halving on context overflow.
    fn translate_payload_with_fallback<'a>(
        &'a self,
        payload: Vec<(String, String)>,
        source_lang: &'a str,
        target_lang: &'a str,
        depth: usize,
        usage: &'a UsageCollector,
    ) -> Pin<Box<dyn Future<Output = StageResult<BTreeMap<String, String>>> + Send + 'a>> {
        Box::pin(async move {
            match self
                .translate_payload_once(&payload, source_lang, target_lang, usage)
                .await
            {
                Ok(translated) => Ok(translated),
                Err(error) => {
                    if !is_context_overflow(&error) || payload.len() <= 1 {
                        return Err(error);
                    }
                    if depth >= MAX_SPLIT_RECURSION_DEPTH {
                        return Err(PipelineError::new(
                            stage::LLM,
                            ErrorCode::LlmRequestFailed,
                            "translation model request failed (overflow fallback exceeded max depth)",
                        )
                        .with_detail(format!(
                            "fallback_depth={depth}; limit={MAX_SPLIT_RECURSION_DEPTH}"
                        )));
                    }

                    let split_point = payload.len() / 2;
                    let (left, right) = payload.split_at(split_point);
                    tracing::debug!(
                        target: "sublingo.translate",
                        depth,
                        size = payload.len(),
                        left = left.len(),
                        right = right.len(),
                        "qwen-mt overflow fallback split"
                    );

                    let mut translated = self
                        .translate_payload_with_fallback(
                            left.to_vec(),
                            source_lang,
                            target_lang,
                            depth + 1,
                            usage,
                        )
                        .await?;
                    translated.extend(
                        self.translate_payload_with_fallback(
                            right.to_vec(),
                            source_lang,
                            target_lang,
                            depth + 1,
                            usage,
                        )
                        .await?,
                    );
                    Ok(translated)
                }
            }
        })
    }

    async fn translate_payload_once(
        &self,
        payload: &[(String, String)],
        source_lang: &str,
        target_lang: &str,
        usage: &UsageCollector,
    ) -> StageResult<BTreeMap<String, String>> {
        if payload.is_empty() {
            return Ok(BTreeMap::new());
        }
        let api_key = self.options.api_key.trim();
        if api_key.is_empty() {
            return Err(PipelineError::new(
                stage::LLM_PRECHECK,
                ErrorCode::MissingLlmApiKey,
                "LLM API key is missing",
            ));
        }

        let mut content_payload = Map::new();
        for (key, value) in payload {
            content_payload.insert(key.clone(), Value::String(value.clone()));
        }
        let body = json!({
            "model": self.options.model.trim().to_lowercase(),
            "messages": [{"role": "user", "content": Value::Object(content_payload).to_string()}],
            "translation_options": {
                "source_lang": source_lang,
                "target_lang": target_lang,
            },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                PipelineError::new(
                    stage::LLM,
                    ErrorCode::LlmRequestFailed,
                    "translation model request failed",
                )
                .with_detail(truncate(&error.to_string(), 600))
            })?;

        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(PipelineError::new(
                stage::LLM,
                ErrorCode::LlmRequestFailed,
                format!("translation model request failed (HTTP {status})"),
            )
            .with_detail(truncate(&body_text, 1_200)));
        }

        let response_payload: Value = serde_json::from_str(&body_text).map_err(|_| {
            PipelineError::new(
                stage::LLM,
                ErrorCode::LlmInvalidJson,
                "translation model returned non-JSON",
            )
            .with_detail(truncate(&body_text, 600))
        })?;

        let content = response_payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(PipelineError::new(
                stage::LLM,
                ErrorCode::LlmInvalidJson,
                "translation model returned empty content",
            )
            .with_detail(truncate(&response_payload.to_string(), 600)));
        }

        let expected_keys: Vec<&str> = payload.iter().map(|(key, _)| key.as_str()).collect();
        let translated = parse_translation_content(&content, &expected_keys, &response_payload)?;

        let (prompt_tokens, completion_tokens, total_tokens, request_id) =
            extract_usage_from_payload(&response_payload);
        usage.record(prompt_tokens, completion_tokens, total_tokens, &request_id);

        Ok(translated)
    }
}

#[async_trait]
impl TranslationStrategy for QwenMtDirectStrategy {
    async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancelCheck,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> StageResult<TranslationOutcome> {
        if cancel() {
            return Err(PipelineError::cancel_requested(stage::LLM_TRANSLATE));
        }

        let payload: Vec<(String, String)> = request
            .texts
            .iter()
            .enumerate()
            .map(|(idx, text)| (format!("id_{idx}"), text.trim().to_string()))
            .collect();
        let source_lang = normalize_translation_language(&request.source_language);
        let target_lang = normalize_translation_language(&request.target_language);

        let usage = UsageCollector::default();
        let translated = self
            .translate_payload_with_fallback(payload, &source_lang, &target_lang, 0, &usage)
            .await?;

        let mut translations = Vec::with_capacity(request.texts.len());
        for idx in 0..request.texts.len() {
            translations.push(
                translated
                    .get(&format!("id_{idx}"))
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        on_progress(request.texts.len(), request.texts.len());

        let counters = usage.snapshot();
        Ok(TranslationOutcome {
            translations,
            batch_count: 1,
            llm_usage: LlmUsageSnapshot {
                base_url: normalize_llm_base_url(&self.options.base_url),
                provider_effective: infer_llm_provider(&self.options.base_url),
                model_effective: self.options.model.trim().to_string(),
                ..LlmUsageSnapshot::default()
            },
            translation_usage: TranslationUsage {
                mode_effective: "translation_model".to_string(),
                provider_effective: QWEN_MT_FLASH_PROVIDER.to_string(),
                model_effective: self.options.model.trim().to_lowercase(),
                prompt_tokens: counters.prompt_tokens,
                completion_tokens: counters.completion_tokens,
                total_tokens: counters.total_tokens,
                request_count: counters.request_count,
            },
        })
    }
}

fn normalize_qwen_base_url(base_url: &str) -> String {
    let mut value = base_url.trim().to_string();
    if value.is_empty() {
        value = DEFAULT_QWEN_MT_BASE_URL.to_string();
    }
    if !value.contains("://") {
        value = format!("https://{value}");
    }
    value.trim_end_matches('/').to_string()
}

/// Full language names the translation endpoint expects.
fn normalize_translation_language(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "English".to_string();
    }
    match trimmed.to_lowercase().as_str() {
        "en" => "English".to_string(),
        "zh" => "Chinese".to_string(),
        "ja" => "Japanese".to_string(),
        "ko" => "Korean".to_string(),
        _ => trimmed.to_string(),
    }
}

/// HTTP 400/413 plus an overflow hint in the combined message/detail.
fn is_context_overflow(error: &PipelineError) -> bool {
    if error.code != ErrorCode::LlmRequestFailed {
        return false;
    }
    let merged = format!(
        "{} {}",
        error.message,
        error.detail.as_deref().unwrap_or("")
    )
    .to_lowercase();
    if !merged.contains("http 400") && !merged.contains("http 413") {
        return false;
    }
    CONTEXT_OVERFLOW_HINTS.iter().any(|hint| merged.contains(hint))
}

/// Parse model content: JSON object first, line-oriented fallback second;
/// either must return exactly the expected key set.
fn parse_translation_content(
    content: &str,
    expected_keys: &[&str],
    raw_payload: &Value,
) -> StageResult<BTreeMap<String, String>> {
    let expected: std::collections::BTreeSet<&str> = expected_keys.iter().copied().collect();

    let parsed_json = parse_json_object(content).map(normalize_translation_mapping);
    if let Some(mapping) = &parsed_json {
        if mapping.keys().map(String::as_str).collect::<std::collections::BTreeSet<_>>() == expected
        {
            return Ok(mapping.clone());
        }
    }

    let line_mapping = parse_translation_lines(content);
    if !line_mapping.is_empty()
        && line_mapping
            .keys()
            .map(String::as_str)
            .collect::<std::collections::BTreeSet<_>>()
            == expected
    {
        return Ok(line_mapping);
    }

    let detail = json!({
        "expected_keys": expected_keys,
        "parsed_json_keys": parsed_json
            .map(|m| m.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default(),
        "line_keys": line_mapping.keys().cloned().collect::<Vec<_>>(),
        "content_preview": truncate(content, 400),
        "raw_preview": truncate(&raw_payload.to_string(), 200),
    });
    Err(PipelineError::new(
        stage::LLM,
        ErrorCode::LlmInvalidJson,
        "translation model response did not match the expected shape",
    )
    .with_detail(truncate(&detail.to_string(), 1_200)))
}

fn parse_json_object(content: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(content) {
        return Some(object);
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&content[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn normalize_translation_mapping(object: Map<String, Value>) -> BTreeMap<String, String> {
    object
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.trim().to_string();
            if !BATCH_KEY_PATTERN.is_match(&key) {
                return None;
            }
            let text = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            Some((key, text.trim().to_string()))
        })
        .collect()
}

fn parse_translation_lines(content: &str) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(captures) = BATCH_LINE_PATTERN.captures(line) {
            let key = captures[1].trim().to_string();
            let value = captures[2].trim().to_string();
            if !key.is_empty() {
                mapping.insert(key, value);
            }
        }
    }
    mapping
}
