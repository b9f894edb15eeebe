//! Cloud ASR client (OpenAI-compatible multipart transcription).
//!
//! The endpoint shape is negotiated: both `/audio/transcriptions` and
//! `/files/transcriptions` are tried, and for each endpoint a sequence of
//! request-field variants from most specific (word-level granularities) to
//! bare. Failures are classified as retry-with-next-variant or terminal.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use sublingo_core::domain::DEFAULT_ASR_BASE_URL;
use sublingo_core::{AsrSegment, AsrWord, ErrorCode, PipelineError, StageResult, WhisperOptions, stage};

use crate::llm::client::truncate;

/// Endpoint path variants, tried in order.
const ASR_ENDPOINT_SUFFIXES: [&str; 2] = ["/audio/transcriptions", "/files/transcriptions"];

/// Error-text fragments that justify trying the next endpoint/variant.
const ASR_RETRY_HINT_TOKENS: [&str; 15] = [
    "unsupported",
    "not support",
    "not_supported",
    "unknown parameter",
    "unrecognized",
    "invalid parameter",
    "extra fields",
    "unknown url",
    "unknown endpoint",
    "no route",
    "route not found",
    "not found",
    "method not allowed",
    "invalid endpoint",
    "cannot post",
];

/// Error-text fragments that are terminal (credentials, billing).
const ASR_NO_RETRY_HINT_TOKENS: [&str; 8] = [
    "invalid api key",
    "incorrect api key",
    "authentication",
    "unauthorized",
    "forbidden",
    "insufficient_quota",
    "insufficient quota",
    "billing",
];

/// Default cloud request timeout.
pub const CLOUD_ASR_TIMEOUT: Duration = Duration::from_secs(180);

/// Normalize the configured transcription base URL.
#[must_use]
pub fn normalize_asr_base_url(base_url: &str) -> String {
    let value = base_url.trim();
    if value.is_empty() {
        return DEFAULT_ASR_BASE_URL.to_string();
    }
    let value = if value.contains("://") {
        value.to_string()
    } else {
        format!("https://{value}")
    };
    value.trim_end_matches('/').to_string()
}

/// Both endpoint candidates rooted at the (suffix-stripped) base URL.
#[must_use]
pub fn build_endpoint_candidates(base_url: &str) -> Vec<String> {
    let normalized = normalize_asr_base_url(base_url);
    let lower = normalized.to_lowercase();
    let mut base_root = normalized.clone();
    for suffix in ASR_ENDPOINT_SUFFIXES {
        if lower.ends_with(suffix) {
            base_root = normalized[..normalized.len() - suffix.len()]
                .trim_end_matches('/')
                .to_string();
            if base_root.is_empty() {
                base_root = normalized.clone();
            }
            break;
        }
    }

    ASR_ENDPOINT_SUFFIXES
        .iter()
        .map(|suffix| format!("{}{suffix}", base_root.trim_end_matches('/')))
        .collect()
}

/// Request-field variants in decreasing specificity: array granularities,
/// scalar granularities, verbose_json only, bare.
#[must_use]
pub fn build_request_field_candidates(model: &str, language: &str) -> Vec<Vec<(String, String)>> {
    let mut shared = vec![("model".to_string(), model.trim().to_string())];
    let language = language.trim();
    if !language.is_empty() {
        shared.push(("language".to_string(), language.to_string()));
    }

    let with = |extra: &[(&str, &str)]| -> Vec<(String, String)> {
        let mut fields = shared.clone();
        fields.extend(
            extra
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string())),
        );
        fields
    };

    vec![
        with(&[
            ("response_format", "verbose_json"),
            ("timestamp_granularities[]", "word"),
            ("timestamp_granularities[]", "segment"),
        ]),
        with(&[
            ("response_format", "verbose_json"),
            ("timestamp_granularities", "word"),
            ("timestamp_granularities", "segment"),
        ]),
        with(&[("response_format", "verbose_json")]),
        with(&[]),
    ]
}

/// Retry-with-next-variant vs terminal failure classification.
#[must_use]
pub fn should_retry_request(status_code: Option<u16>, error_text: &str) -> bool {
    let text = error_text.to_lowercase();
    if ASR_NO_RETRY_HINT_TOKENS.iter().any(|token| text.contains(token)) {
        return false;
    }
    let Some(status) = status_code else {
        return true;
    };
    match status {
        401 | 403 => false,
        code if code >= 500 => true,
        404 | 405 | 406 | 408 | 410 | 415 | 421 | 422 | 425 | 426 | 429 => true,
        _ => ASR_RETRY_HINT_TOKENS.iter().any(|token| text.contains(token)),
    }
}

/// Best-effort human message out of a provider error body.
fn extract_error_message(payload: Option<&Value>, fallback_text: &str) -> String {
    if let Some(payload) = payload {
        if let Some(message) = payload["error"]["message"].as_str() {
            if !message.trim().is_empty() {
                return message.trim().to_string();
            }
        }
        for key in ["message", "detail", "error"] {
            if let Some(message) = payload[key].as_str() {
                if !message.trim().is_empty() {
                    return message.trim().to_string();
                }
            }
        }
        return truncate(&payload.to_string(), 800);
    }
    fallback_text.trim().to_string()
}

/// Cloud transcription client.
#[derive(Clone, Debug)]
pub struct CloudAsrClient {
    http: reqwest::Client,
}

impl CloudAsrClient {
    pub fn new(timeout: Duration) -> StageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::unexpected(stage::ASR, format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Transcribe an audio file, negotiating endpoint and field variants.
    pub async fn transcribe(
        &self,
        audio_path: &Path,
        whisper: &WhisperOptions,
        model: &str,
        model_label: &str,
    ) -> StageResult<Vec<AsrSegment>> {
        let api_key = whisper.api_key.trim();
        if api_key.is_empty() {
            return Err(PipelineError::new(
                stage::ASR,
                ErrorCode::CloudAsrFailed,
                "cloud runtime requires whisper.api_key",
            ));
        }

        let audio_bytes = tokio::fs::read(audio_path).await.map_err(|e| {
            PipelineError::new(
                stage::ASR,
                ErrorCode::CloudAsrFailed,
                format!("{model_label} could not read audio file"),
            )
            .with_detail(e.to_string())
        })?;
        let audio_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let endpoints = build_endpoint_candidates(&whisper.base_url);
        let field_candidates = build_request_field_candidates(model, &whisper.language);
        let mut failure_details: Vec<String> = Vec::new();

        tracing::debug!(
            target: "sublingo.asr",
            model,
            language = %whisper.language,
            endpoints = endpoints.len(),
            "cloud transcription request"
        );

        for endpoint in &endpoints {
            for (variant_index, fields) in field_candidates.iter().enumerate() {
                if variant_index > 0 {
                    tracing::debug!(
                        target: "sublingo.asr",
                        endpoint = %endpoint,
                        variant = variant_index + 1,
                        "cloud transcription retry with next payload variant"
                    );
                }

                let mut form = reqwest::multipart::Form::new().part(
                    "file",
                    reqwest::multipart::Part::bytes(audio_bytes.clone())
                        .file_name(audio_name.clone())
                        .mime_str("audio/wav")
                        .map_err(|e| {
                            PipelineError::unexpected(stage::ASR, format!("multipart: {e}"))
                        })?,
                );
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }

                let response = match self
                    .http
                    .post(endpoint)
                    .bearer_auth(api_key)
                    .multipart(form)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(error) => {
                        let error_text =
                            format!("request_error={}", truncate(&error.to_string(), 420));
                        failure_details
                            .push(format!("endpoint={endpoint}; status=request_error; detail={error_text}"));
                        if should_retry_request(None, &error_text) {
                            continue;
                        }
                        return Err(PipelineError::new(
                            stage::ASR,
                            ErrorCode::CloudAsrFailed,
                            format!("{model_label} cloud transcription request failed"),
                        )
                        .with_detail(truncate(&failure_details.join("\n"), 1_200)));
                    }
                };

                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let payload: Option<Value> = serde_json::from_str(&body).ok();

                if status >= 400 {
                    let error_text =
                        extract_error_message(payload.as_ref(), &truncate(&body, 600));
                    failure_details.push(format!(
                        "endpoint={endpoint}; status={status}; detail={}",
                        truncate(&error_text, 420)
                    ));
                    if should_retry_request(Some(status), &error_text) {
                        continue;
                    }
                    return Err(PipelineError::new(
                        stage::ASR,
                        ErrorCode::CloudAsrFailed,
                        format!("{model_label} cloud transcription failed (HTTP {status})"),
                    )
                    .with_detail(truncate(&failure_details.join("\n"), 1_200)));
                }

                let Some(payload) = payload else {
                    failure_details.push(format!(
                        "endpoint={endpoint}; status=200; detail=non_json_body:{}",
                        truncate(&body, 420)
                    ));
                    continue;
                };

                if let Some(segments) = extract_segments_from_cloud_payload(&payload) {
                    tracing::debug!(
                        target: "sublingo.asr",
                        endpoint = %endpoint,
                        segments = segments.len(),
                        "cloud transcription success"
                    );
                    return Ok(segments);
                }

                failure_details.push(format!(
                    "endpoint={endpoint}; status=200; detail=unrecognized_payload:{}",
                    truncate(&payload.to_string(), 200)
                ));
            }
        }

        Err(PipelineError::new(
            stage::ASR,
            ErrorCode::CloudAsrFailed,
            format!("{model_label} cloud transcription returned no parsable segments"),
        )
        .with_detail(truncate(&failure_details.join("\n"), 1_200)))
    }
}

// =============================================================================
// Response payload parsing
// =============================================================================

fn finite(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn ms_to_seconds(value: &Value) -> Option<f64> {
    finite(value).map(|ms| round3(ms.max(0.0) / 1000.0))
}

/// Read a timestamp from a mapping, trying second-based keys first, then
/// millisecond-based ones.
fn read_time_seconds(value: &Value, second_keys: &[&str], ms_keys: &[&str]) -> Option<f64> {
    for key in second_keys {
        if let Some(seconds) = finite(&value[*key]) {
            return Some(seconds);
        }
    }
    for key in ms_keys {
        if let Some(seconds) = ms_to_seconds(&value[*key]) {
            return Some(seconds);
        }
    }
    None
}

const START_SECOND_KEYS: [&str; 4] = ["start", "start_time", "from", "begin"];
const START_MS_KEYS: [&str; 2] = ["start_ms", "begin_time"];
const END_SECOND_KEYS: [&str; 4] = ["end", "end_time", "to", "finish"];
const END_MS_KEYS: [&str; 2] = ["end_ms", "stop_time"];

fn word_text(item: &Value) -> String {
    for key in ["word", "text", "token"] {
        if let Some(text) = item[key].as_str() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn word_confidence(item: &Value) -> Option<f64> {
    for key in ["confidence", "score", "probability", "logprob"] {
        if let Some(value) = finite(&item[key]) {
            return Some((value * 1_000_000.0).round() / 1_000_000.0);
        }
    }
    None
}

/// Words in the OpenAI verbose_json shape (seconds).
fn normalize_transcription_words(words: &Value) -> Vec<AsrWord> {
    let Some(items) = words.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let word = word_text(item);
            let start = read_time_seconds(item, &START_SECOND_KEYS, &START_MS_KEYS)?;
            let end = read_time_seconds(item, &END_SECOND_KEYS, &END_MS_KEYS)?;
            if word.is_empty() || start < 0.0 || end <= start {
                return None;
            }
            Some(AsrWord {
                word,
                start: round3(start),
                end: round3(end),
                confidence: word_confidence(item),
            })
        })
        .collect()
}

/// Words in the paraformer shape (`begin_time`/`end_time` in ms).
fn normalize_paraformer_words(words: &Value) -> Vec<AsrWord> {
    let Some(items) = words.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let word = word_text(item);
            let start = ms_to_seconds(&item["begin_time"])?;
            let end = ms_to_seconds(&item["end_time"])?;
            if word.is_empty() || end <= start {
                return None;
            }
            Some(AsrWord {
                word,
                start,
                end,
                confidence: None,
            })
        })
        .collect()
}

fn merged_word_text(words: &[AsrWord]) -> String {
    words
        .iter()
        .map(|w| w.word.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Paraformer payload: `transcripts[].sentences[]`.
fn extract_paraformer_segments(payload: &Value) -> Option<Vec<AsrSegment>> {
    let transcripts = payload["transcripts"].as_array()?;
    let mut segments = Vec::new();
    let mut last_end = 0.0f64;
    for transcript in transcripts {
        let Some(sentences) = transcript["sentences"].as_array() else {
            continue;
        };
        for sentence in sentences {
            let words = normalize_paraformer_words(&sentence["words"]);
            let mut text = sentence["text"].as_str().unwrap_or("").trim().to_string();
            if text.is_empty() && !words.is_empty() {
                text = merged_word_text(&words);
            }
            if text.is_empty() {
                continue;
            }
            let mut start = ms_to_seconds(&sentence["begin_time"]);
            let mut end = ms_to_seconds(&sentence["end_time"]);
            if !words.is_empty() {
                start = start.or(Some(words[0].start));
                end = end.or_else(|| words.last().map(|w| w.end));
            }
            let start = start.unwrap_or(last_end).max(0.0);
            let end = match end {
                Some(value) if value > start => value,
                _ => start + 0.8,
            };
            last_end = end;
            segments.push(AsrSegment {
                start: round3(start),
                end: round3(end.max(start)),
                text,
                words,
            });
        }
    }
    (!segments.is_empty()).then_some(segments)
}

/// OpenAI verbose_json payload: `segments[]` / `words[]` / `text`.
fn extract_openai_segments(payload: &Value) -> Option<Vec<AsrSegment>> {
    let has_openai_shape = ["text", "segments", "words"]
        .iter()
        .any(|key| !payload[*key].is_null());
    let text = payload["text"].as_str().unwrap_or("").trim().to_string();
    let global_words = normalize_transcription_words(&payload["words"]);

    if let Some(segments_raw) = payload["segments"].as_array() {
        let mut segments = Vec::new();
        let mut last_end = 0.0f64;
        for raw_segment in segments_raw {
            let mut words = normalize_transcription_words(&raw_segment["words"]);
            let start = read_time_seconds(raw_segment, &START_SECOND_KEYS, &START_MS_KEYS);
            let end = read_time_seconds(raw_segment, &END_SECOND_KEYS, &END_MS_KEYS);
            if words.is_empty() && !global_words.is_empty() {
                if let (Some(start), Some(end)) = (start, end) {
                    if end > start {
                        words = global_words
                            .iter()
                            .filter(|w| w.start >= start - 0.05 && w.end <= end + 0.05)
                            .cloned()
                            .collect();
                    }
                }
            }
            let mut segment_text =
                raw_segment["text"].as_str().unwrap_or("").trim().to_string();
            if segment_text.is_empty() && !words.is_empty() {
                segment_text = merged_word_text(&words);
            }
            if segment_text.is_empty() {
                continue;
            }
            let start = start
                .or_else(|| words.first().map(|w| w.start))
                .unwrap_or(last_end)
                .max(0.0);
            let end = match end.or_else(|| words.last().map(|w| w.end)) {
                Some(value) if value > start => value,
                _ => start + 0.8,
            };
            last_end = end;
            segments.push(AsrSegment {
                start: round3(start),
                end: round3(end.max(start)),
                text: segment_text,
                words,
            });
        }
        if !segments.is_empty() {
            return Some(segments);
        }
    }

    if !global_words.is_empty() {
        let merged_text = if text.is_empty() {
            merged_word_text(&global_words)
        } else {
            text.clone()
        };
        if !merged_text.is_empty() {
            let start = global_words[0].start.max(0.0);
            let last = global_words.last().map_or(start, |w| w.end);
            let end = if last > start { last } else { start + 0.8 };
            return Some(vec![AsrSegment {
                start: round3(start),
                end: round3(end),
                text: merged_text,
                words: global_words,
            }]);
        }
    }

    if !text.is_empty() {
        return Some(vec![AsrSegment {
            start: 0.0,
            end: 0.8,
            text,
            words: Vec::new(),
        }]);
    }
    if has_openai_shape {
        return Some(Vec::new());
    }
    None
}

/// Try both shapes on the payload and on common nesting envelopes.
#[must_use]
pub fn extract_segments_from_cloud_payload(payload: &Value) -> Option<Vec<AsrSegment>> {
    let mut candidates: Vec<&Value> = vec![payload];
    for key in ["data", "result", "output", "transcription", "response"] {
        match &payload[key] {
            value @ Value::Object(_) => candidates.push(value),
            Value::Array(items) => {
                candidates.extend(items.iter().filter(|item| item.is_object()));
            }
            _ => {}
        }
    }

    for candidate in candidates {
        if let Some(segments) = extract_paraformer_segments(candidate) {
            return Some(segments);
        }
        if let Some(segments) = extract_openai_segments(candidate) {
            return Some(segments);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_candidates_strip_known_suffixes() {
        let candidates = build_endpoint_candidates("https://api.example.com/v1/audio/transcriptions");
        assert_eq!(
            candidates,
            vec![
                "https://api.example.com/v1/audio/transcriptions",
                "https://api.example.com/v1/files/transcriptions",
            ]
        );

        let defaults = build_endpoint_candidates("");
        assert!(defaults[0].starts_with(DEFAULT_ASR_BASE_URL));
        assert_eq!(defaults.len(), 2);
    }

    #[test]
    fn field_candidates_in_specificity_order() {
        let candidates = build_request_field_candidates("paraformer-v2", "en");
        assert_eq!(candidates.len(), 4);
        assert!(
            candidates[0]
                .iter()
                .any(|(name, value)| name == "timestamp_granularities[]" && value == "word")
        );
        assert!(
            candidates[1]
                .iter()
                .any(|(name, _)| name == "timestamp_granularities")
        );
        assert_eq!(
            candidates[2]
                .iter()
                .filter(|(name, _)| name.starts_with("timestamp"))
                .count(),
            0
        );
        assert_eq!(candidates[3].len(), 2); // model + language only

        // No language: shared fields shrink to model
        let bare = build_request_field_candidates("m", "");
        assert_eq!(bare[3].len(), 1);
    }

    #[test]
    fn retry_classification() {
        assert!(!should_retry_request(Some(401), ""));
        assert!(!should_retry_request(Some(500), "billing problem"));
        assert!(should_retry_request(None, "connection reset"));
        assert!(should_retry_request(Some(503), ""));
        assert!(should_retry_request(Some(404), ""));
        assert!(should_retry_request(Some(400), "unknown parameter: timestamp_granularities"));
        assert!(!should_retry_request(Some(400), "audio too short"));
    }

    #[test]
    fn parses_openai_verbose_json() {
        let payload = json!({
            "text": "Hello world How are you",
            "segments": [
                {"start": 0.0, "end": 1.5, "text": "Hello world", "words": [
                    {"word": "hello", "start": 0.0, "end": 0.5},
                    {"word": "world", "start": 0.6, "end": 1.5, "probability": 0.98},
                ]},
                {"start": 1.6, "end": 3.0, "text": "How are you", "words": [
                    {"word": "how", "start": 1.6, "end": 2.0},
                    {"word": "are", "start": 2.1, "end": 2.4},
                    {"word": "you", "start": 2.5, "end": 3.0},
                ]},
            ],
        });
        let segments = extract_segments_from_cloud_payload(&payload).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].words.len(), 2);
        assert_eq!(segments[0].words[1].confidence, Some(0.98));
        assert_eq!(segments[1].text, "How are you");
    }

    #[test]
    fn parses_paraformer_shape_with_ms_times() {
        let payload = json!({
            "transcripts": [{
                "sentences": [{
                    "begin_time": 0, "end_time": 1500, "text": "Hello world",
                    "words": [
                        {"text": "hello", "begin_time": 0, "end_time": 500},
                        {"text": "world", "begin_time": 600, "end_time": 1500},
                    ],
                }],
            }],
        });
        let segments = extract_segments_from_cloud_payload(&payload).unwrap();
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start - 0.0).abs() < 1e-9);
        assert!((segments[0].end - 1.5).abs() < 1e-9);
        assert!((segments[0].words[1].start - 0.6).abs() < 1e-9);
    }

    #[test]
    fn parses_nested_envelopes() {
        let payload = json!({
            "output": {
                "transcripts": [{
                    "sentences": [{"begin_time": 0, "end_time": 800, "text": "hi", "words": []}],
                }],
            },
        });
        let segments = extract_segments_from_cloud_payload(&payload).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hi");
    }

    #[test]
    fn global_words_fill_missing_segment_words() {
        let payload = json!({
            "text": "hello world",
            "segments": [{"start": 0.0, "end": 1.5, "text": "hello world"}],
            "words": [
                {"word": "hello", "start": 0.0, "end": 0.5},
                {"word": "world", "start": 0.6, "end": 1.5},
            ],
        });
        let segments = extract_segments_from_cloud_payload(&payload).unwrap();
        assert_eq!(segments[0].words.len(), 2);
    }

    #[test]
    fn unrecognized_payload_is_none() {
        assert!(extract_segments_from_cloud_payload(&json!({"status": "queued"})).is_none());
    }

    #[test]
    fn text_only_payload_yields_wordless_segment() {
        let segments =
            extract_segments_from_cloud_payload(&json!({"text": "just text"})).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].words.is_empty());
    }
}
