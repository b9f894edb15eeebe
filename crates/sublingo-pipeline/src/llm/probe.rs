//! LLM access precheck.
//!
//! A 1-token ping per protocol candidate, run before the pipeline spends
//! money on a job. Successes are cached with a TTL so back-to-back jobs
//! against the same endpoint skip the probe.

use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};

use sublingo_core::{ErrorCode, PipelineError, StageResult, stage};

use super::client::{LlmClient, truncate};
use super::protocol::{LlmProtocol, should_fallback_protocol};

/// Probe success TTL.
pub const PROBE_TTL: Duration = Duration::from_secs(600);

/// Probe cache capacity.
const PROBE_CACHE_CAPACITY: usize = 64;

/// Probe request timeout (shorter than pipeline calls).
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// TTL'd LRU of successful probes, keyed by a digest of
/// `base_url|model|api_key|protocol-order`.
#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    capacity: usize,
    // Access-ordered: oldest first
    entries: std::sync::Mutex<Vec<(String, Instant)>>,
}

impl Default for ProbeCache {
    fn default() -> Self {
        Self::new(PROBE_TTL, PROBE_CACHE_CAPACITY)
    }
}

impl ProbeCache {
    #[must_use]
    pub const fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Whether a fresh success is cached. Refreshes the entry's LRU slot.
    pub fn hit(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().expect("probe cache lock");
        let now = Instant::now();
        entries.retain(|(_, stored_at)| now.duration_since(*stored_at) < self.ttl);
        if let Some(position) = entries.iter().position(|(stored_key, _)| stored_key == key) {
            let entry = entries.remove(position);
            entries.push(entry);
            return true;
        }
        false
    }

    /// Record a success, evicting the least recently used past capacity.
    pub fn store(&self, key: String) {
        let mut entries = self.entries.lock().expect("probe cache lock");
        entries.retain(|(stored_key, _)| stored_key != &key);
        entries.push((key, Instant::now()));
        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }
    }
}

/// Cache key for a client configuration.
#[must_use]
pub fn probe_cache_key(client: &LlmClient) -> String {
    let protocol_order = client
        .protocols()
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(">");
    let raw = format!(
        "{}|{}|{}|{protocol_order}",
        client.base_url(),
        client.options().model.trim(),
        client.options().api_key.trim(),
    );
    let digest = Sha256::digest(raw.as_bytes());
    format!("{digest:x}")
}

/// Verify the configured endpoint accepts requests.
///
/// Returns `Ok(())` on the first protocol that answers below 400; raises
/// `llm_access_denied` when no candidate does and the failure is not a
/// protocol-shape problem. Missing key raises `missing_llm_api_key`.
pub async fn probe_llm_access(client: &LlmClient, cache: &ProbeCache) -> StageResult<()> {
    let api_key = client.options().api_key.trim().to_string();
    if api_key.is_empty() {
        return Err(PipelineError::new(
            stage::LLM_PRECHECK,
            ErrorCode::MissingLlmApiKey,
            "LLM API key is missing",
        ));
    }

    let cache_key = probe_cache_key(client);
    if cache.hit(&cache_key) {
        tracing::debug!(target: "sublingo.llm", "llm precheck cache hit");
        return Ok(());
    }

    let http = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| PipelineError::unexpected(stage::LLM_PRECHECK, format!("http client: {e}")))?;

    let mut failure_details: Vec<String> = Vec::new();
    for protocol in client.protocols() {
        let (endpoint, payloads) = probe_payloads(client, protocol);
        let mut last_status: Option<u16> = None;
        let mut last_error = String::new();

        for payload in payloads {
            let response = match http
                .post(&endpoint)
                .bearer_auth(&api_key)
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
            if status < 400 {
                cache.store(cache_key);
                tracing::debug!(
                    target: "sublingo.llm",
                    protocol = protocol.as_str(),
                    "llm precheck success"
                );
                return Ok(());
            }
            last_status = Some(status);
            last_error = format!(
                "body={}",
                truncate(&response.text().await.unwrap_or_default(), 420)
            );
        }

        let status_tag = last_status.map_or_else(|| "request_error".to_string(), |s| s.to_string());
        failure_details.push(format!(
            "protocol={}; status={status_tag}; detail={last_error}",
            protocol.as_str()
        ));
        if should_fallback_protocol(last_status, &last_error) {
            continue;
        }
        return Err(PipelineError::new(
            stage::LLM_PRECHECK,
            ErrorCode::LlmAccessDenied,
            "LLM API precheck failed",
        )
        .with_detail(truncate(&failure_details.join("\n"), 1_200)));
    }

    Err(PipelineError::new(
        stage::LLM_PRECHECK,
        ErrorCode::LlmAccessDenied,
        "LLM API precheck failed",
    )
    .with_detail(truncate(&failure_details.join("\n"), 1_200)))
}

fn probe_payloads(client: &LlmClient, protocol: LlmProtocol) -> (String, Vec<serde_json::Value>) {
    match protocol {
        LlmProtocol::Responses => {
            let endpoint = format!("{}/responses", client.base_url());
            let base_payload = json!({
                "model": client.options().model,
                "input": [
                    {
                        "type": "message",
                        "role": "developer",
                        "content": [{"type": "input_text", "text": "You are a connectivity probe. Reply briefly."}],
                    },
                    {
                        "type": "message",
                        "role": "user",
                        "content": [{"type": "input_text", "text": "ping"}],
                    },
                ],
            });
            let mut payloads = Vec::new();
            if client.options().support_json {
                let mut with_format = base_payload.clone();
                with_format["text"] = json!({"format": {"type": "json_object"}});
                payloads.push(with_format);
            }
            payloads.push(base_payload);
            (endpoint, payloads)
        }
        LlmProtocol::Chat => {
            let endpoint = format!("{}/chat/completions", client.base_url());
            let payload = json!({
                "model": client.options().model,
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
            });
            (endpoint, vec![payload])
        }
    }
}
