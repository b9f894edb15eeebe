//! JSON-returning LLM client with protocol auto-negotiation.
//!
//! One public call, [`LlmClient::chat_json`]: try the preferred protocol,
//! classify failures, and fall back to the other shape when the
//! classification allows it. Token usage lands in the caller's
//! [`UsageCollector`].

use std::time::Duration;

use serde_json::{Value, json};

use sublingo_core::{ErrorCode, LlmOptions, PipelineError, StageResult, stage};

use super::protocol::{
    LlmProtocol, infer_llm_provider, infer_protocol_candidates, normalize_llm_base_url,
    should_fallback_protocol,
};
use super::usage::{UsageCollector, extract_usage_from_payload};

/// Default per-request timeout.
pub const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Reusable client for one `(base_url, model, key)` configuration.
#[derive(Clone, Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    options: LlmOptions,
    base_url: String,
    protocols: [LlmProtocol; 2],
}

impl LlmClient {
    pub fn new(options: LlmOptions, timeout: Duration) -> StageResult<Self> {
        let base_url = normalize_llm_base_url(&options.base_url);
        let protocols = infer_protocol_candidates(&options.base_url, &options.model);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::unexpected(stage::LLM, format!("http client: {e}")))?;
        Ok(Self {
            http,
            options,
            base_url,
            protocols,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn options(&self) -> &LlmOptions {
        &self.options
    }

    #[must_use]
    pub fn protocols(&self) -> [LlmProtocol; 2] {
        self.protocols
    }

    /// A fresh usage collector labeled for this endpoint.
    #[must_use]
    pub fn usage_collector(&self) -> UsageCollector {
        UsageCollector::new(
            self.base_url.clone(),
            infer_llm_provider(&self.options.base_url),
            self.options.model.trim().to_string(),
        )
    }

    fn api_key(&self) -> StageResult<&str> {
        let key = self.options.api_key.trim();
        if key.is_empty() {
            return Err(PipelineError::new(
                stage::LLM_PRECHECK,
                ErrorCode::MissingLlmApiKey,
                "LLM API key is missing",
            ));
        }
        Ok(key)
    }

    /// Send a prompt, expect a JSON object back.
    ///
    /// Walks the protocol candidates, applying the shared fallback
    /// classification between them. Non-JSON content from a 2xx response
    /// is terminal (`llm_invalid_json`), never a protocol problem.
    pub async fn chat_json(&self, prompt: &str, usage: &UsageCollector) -> StageResult<Value> {
        let api_key = self.api_key()?;
        let mut failure_details: Vec<String> = Vec::new();

        for protocol in self.protocols {
            tracing::debug!(
                target: "sublingo.llm",
                protocol = protocol.as_str(),
                base_url = %self.base_url,
                model = %self.options.model,
                "llm json request"
            );
            let attempt = match protocol {
                LlmProtocol::Responses => self.request_responses(api_key, prompt, usage).await,
                LlmProtocol::Chat => self.request_chat(api_key, prompt, usage).await,
            };
            match attempt {
                Ok(value) => return Ok(value),
                Err(AttemptError::Terminal(error)) => return Err(error),
                Err(AttemptError::Protocol { status, error_text }) => {
                    let status_tag =
                        status.map_or_else(|| "request_error".to_string(), |s| s.to_string());
                    failure_details.push(format!(
                        "protocol={}; status={status_tag}; detail={}",
                        protocol.as_str(),
                        truncate(&error_text, 600)
                    ));
                    if should_fallback_protocol(status, &error_text) {
                        tracing::debug!(
                            target: "sublingo.llm",
                            protocol = protocol.as_str(),
                            status = ?status,
                            "falling back to next protocol"
                        );
                        continue;
                    }
                    return Err(PipelineError::new(
                        stage::LLM,
                        ErrorCode::LlmRequestFailed,
                        format!(
                            "LLM request failed (protocol={}; status={status_tag})",
                            protocol.as_str()
                        ),
                    )
                    .with_detail(truncate(&failure_details.join("\n"), 1_200)));
                }
            }
        }

        Err(PipelineError::new(
            stage::LLM,
            ErrorCode::LlmRequestFailed,
            "LLM request failed on every protocol",
        )
        .with_detail(truncate(&failure_details.join("\n"), 1_200)))
    }

    /// `responses` shape: JSON-format payload first (when supported), then
    /// the minimal payload.
    async fn request_responses(
        &self,
        api_key: &str,
        prompt: &str,
        usage: &UsageCollector,
    ) -> Result<Value, AttemptError> {
        let endpoint = format!("{}/responses", self.base_url);
        let base_payload = json!({
            "model": self.options.model,
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": prompt}],
            }],
        });

        let mut payload_candidates: Vec<Value> = Vec::new();
        if self.options.support_json {
            let mut with_format = base_payload.clone();
            with_format["text"] = json!({"format": {"type": "json_object"}});
            payload_candidates.push(with_format);
        }
        payload_candidates.push(base_payload);

        let mut last_status: Option<u16> = None;
        let mut last_error = String::new();
        for payload in payload_candidates {
            let response = match self
                .http
                .post(&endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    last_status = None;
                    last_error = format!("request_error={}", truncate(&error.to_string(), 420));
                    continue;
                }
            };

            let status = response.status().as_u16();
            let request_id_header = response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = response.text().await.unwrap_or_default();
            if status >= 400 {
                last_status = Some(status);
                last_error = format!("body={}", truncate(&body, 600));
                continue;
            }

            let payload: Value = serde_json::from_str(&body).map_err(|_| {
                AttemptError::Terminal(
                    PipelineError::new(
                        stage::LLM,
                        ErrorCode::LlmInvalidJson,
                        "LLM responses body is not JSON",
                    )
                    .with_detail(truncate(&body, 600)),
                )
            })?;

            let content = extract_responses_output_text(&payload);
            if content.is_empty() {
                return Err(AttemptError::Terminal(
                    PipelineError::new(
                        stage::LLM,
                        ErrorCode::LlmInvalidJson,
                        "LLM responses payload carried no text",
                    )
                    .with_detail(truncate(&payload.to_string(), 600)),
                ));
            }

            let (prompt_tokens, completion_tokens, total_tokens, mut request_id) =
                extract_usage_from_payload(&payload);
            if request_id.is_empty() {
                request_id = request_id_header;
            }
            usage.record(prompt_tokens, completion_tokens, total_tokens, &request_id);

            return extract_json_from_text(&content).ok_or_else(|| {
                AttemptError::Terminal(
                    PipelineError::new(
                        stage::LLM,
                        ErrorCode::LlmInvalidJson,
                        "LLM returned non-JSON content",
                    )
                    .with_detail(truncate(&content, 600)),
                )
            });
        }

        Err(AttemptError::Protocol {
            status: last_status,
            error_text: last_error,
        })
    }

    /// Classic chat-completions shape.
    async fn request_chat(
        &self,
        api_key: &str,
        prompt: &str,
        usage: &UsageCollector,
    ) -> Result<Value, AttemptError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let mut payload = json!({
            "model": self.options.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if self.options.support_json {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = match self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                return Err(AttemptError::Protocol {
                    status: None,
                    error_text: format!(
                        "request_error={}",
                        truncate(&error.to_string(), 420)
                    ),
                });
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(AttemptError::Protocol {
                status: Some(status),
                error_text: format!("body={}", truncate(&body, 600)),
            });
        }

        let payload: Value = serde_json::from_str(&body).map_err(|_| {
            AttemptError::Terminal(
                PipelineError::new(
                    stage::LLM,
                    ErrorCode::LlmInvalidJson,
                    "LLM chat body is not JSON",
                )
                .with_detail(truncate(&body, 600)),
            )
        })?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        if content.trim().is_empty() {
            return Err(AttemptError::Terminal(
                PipelineError::new(
                    stage::LLM,
                    ErrorCode::LlmInvalidJson,
                    "LLM chat payload carried no content",
                )
                .with_detail(truncate(&payload.to_string(), 600)),
            ));
        }

        let (prompt_tokens, completion_tokens, total_tokens, request_id) =
            extract_usage_from_payload(&payload);
        usage.record(prompt_tokens, completion_tokens, total_tokens, &request_id);

        extract_json_from_text(&content).ok_or_else(|| {
            AttemptError::Terminal(
                PipelineError::new(
                    stage::LLM,
                    ErrorCode::LlmInvalidJson,
                    "LLM returned non-JSON content",
                )
                .with_detail(truncate(&content, 600)),
            )
        })
    }
}

/// Per-protocol attempt failure.
enum AttemptError {
    /// Candidate for protocol fallback classification.
    Protocol {
        status: Option<u16>,
        error_text: String,
    },
    /// Surface immediately, no fallback.
    Terminal(PipelineError),
}

/// Parse a JSON object out of model text: raw JSON, fenced code block, or
/// the first `{` .. last `}` slice.
#[must_use]
pub fn extract_json_from_text(content: &str) -> Option<Value> {
    let mut raw = content.trim();
    if raw.starts_with("```") {
        raw = raw.trim_start_matches("```");
        // Drop a language tag like `json`
        if let Some(newline) = raw.find('\n') {
            let (first_line, rest) = raw.split_at(newline);
            if first_line.chars().all(|c| c.is_ascii_alphanumeric()) {
                raw = rest;
            }
        }
        raw = raw.trim_end_matches("```").trim();
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&raw[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Merge the text content out of a `responses`-shape payload:
/// `output_text` as string or list, or the nested `output[].content[]`
/// items (plain strings or `{value}` wrappers).
#[must_use]
pub fn extract_responses_output_text(payload: &Value) -> String {
    match &payload["output_text"] {
        Value::String(text) if !text.trim().is_empty() => return text.trim().to_string(),
        Value::Array(items) => {
            let merged: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !merged.is_empty() {
                return merged.join("\n");
            }
        }
        _ => {}
    }

    let Some(output_items) = payload["output"].as_array() else {
        return String::new();
    };
    let mut chunks: Vec<String> = Vec::new();
    for item in output_items {
        let Some(content_items) = item["content"].as_array() else {
            continue;
        };
        for content in content_items {
            match &content["text"] {
                Value::String(text) if !text.trim().is_empty() => {
                    chunks.push(text.trim().to_string());
                }
                Value::Object(inner) => {
                    if let Some(nested) = inner.get("value").and_then(Value::as_str) {
                        if !nested.trim().is_empty() {
                            chunks.push(nested.trim().to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }
    chunks.join("\n").trim().to_string()
}

pub(crate) fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(base_url: &str, model: &str) -> LlmOptions {
        LlmOptions {
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: "sk-test".to_string(),
            support_json: true,
        }
    }

    #[test]
    fn extract_json_variants() {
        let direct = extract_json_from_text(r#"{"id_0": "a"}"#).unwrap();
        assert_eq!(direct["id_0"], "a");

        let fenced = extract_json_from_text("```json\n{\"id_0\": \"a\"}\n```").unwrap();
        assert_eq!(fenced["id_0"], "a");

        let embedded = extract_json_from_text("Sure! Here it is: {\"id_0\": \"a\"} done").unwrap();
        assert_eq!(embedded["id_0"], "a");

        assert!(extract_json_from_text("no json here").is_none());
        assert!(extract_json_from_text("[1, 2, 3]").is_none());
    }

    #[test]
    fn responses_output_text_shapes() {
        assert_eq!(
            extract_responses_output_text(&json!({"output_text": " hi "})),
            "hi"
        );
        assert_eq!(
            extract_responses_output_text(&json!({"output_text": ["a", " ", "b"]})),
            "a\nb"
        );
        let nested = json!({"output": [{"content": [{"text": "plain"}, {"text": {"value": "wrapped"}}]}]});
        assert_eq!(extract_responses_output_text(&nested), "plain\nwrapped");
        assert_eq!(extract_responses_output_text(&json!({})), "");
    }

    #[tokio::test]
    async fn chat_json_happy_path_records_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "req-42",
                "choices": [{"message": {"content": "{\"id_0\": \"你好\"}"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16},
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(
            options(&format!("{}/v1", server.uri()), "test-model"),
            LLM_REQUEST_TIMEOUT,
        )
        .unwrap();
        let usage = client.usage_collector();
        let value = client.chat_json("translate", &usage).await.unwrap();
        assert_eq!(value["id_0"], "你好");

        let snapshot = usage.snapshot();
        assert_eq!(snapshot.total_tokens, 16);
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.provider_request_id, "req-42");
    }

    #[tokio::test]
    async fn chat_falls_back_to_responses_on_route_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(404).set_body_string("route not found"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "req-7",
                "output_text": "{\"id_0\": \"ok\"}",
                "usage": {"input_tokens": 3, "output_tokens": 2},
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(
            options(&format!("{}/v1", server.uri()), "generic-model"),
            LLM_REQUEST_TIMEOUT,
        )
        .unwrap();
        let usage = client.usage_collector();
        let value = client.chat_json("translate", &usage).await.unwrap();
        assert_eq!(value["id_0"], "ok");
        assert_eq!(usage.snapshot().prompt_tokens, 3);
    }

    #[tokio::test]
    async fn auth_failure_does_not_fall_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(
            options(&format!("{}/v1", server.uri()), "generic-model"),
            LLM_REQUEST_TIMEOUT,
        )
        .unwrap();
        let usage = client.usage_collector();
        let err = client.chat_json("translate", &usage).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmRequestFailed);
        assert!(err.detail.unwrap().contains("status=401"));
    }

    #[tokio::test]
    async fn malformed_content_is_invalid_json_not_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "definitely not json"}}],
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(
            options(&format!("{}/v1", server.uri()), "generic-model"),
            LLM_REQUEST_TIMEOUT,
        )
        .unwrap();
        let usage = client.usage_collector();
        let err = client.chat_json("translate", &usage).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LlmInvalidJson);
    }

    #[tokio::test]
    async fn missing_api_key_is_precheck_error() {
        let mut opts = options("https://api.example.com/v1", "m");
        opts.api_key = String::new();
        let client = LlmClient::new(opts, LLM_REQUEST_TIMEOUT).unwrap();
        let usage = client.usage_collector();
        let err = client.chat_json("x", &usage).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingLlmApiKey);
        assert_eq!(err.stage, stage::LLM_PRECHECK);
    }
}
