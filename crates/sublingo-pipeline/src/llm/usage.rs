//! Per-job LLM usage accumulation.
//!
//! Token counters and the last provider request id, collected across every
//! call a job makes and snapshotted into the result stats for metering.

use std::sync::Mutex;

/// Accumulated usage for one job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LlmUsageSnapshot {
    pub base_url: String,
    pub provider_effective: String,
    pub model_effective: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
    /// Last non-empty provider request id seen.
    pub provider_request_id: String,
}

/// Thread-safe usage accumulator. One per job run.
#[derive(Debug, Default)]
pub struct UsageCollector {
    inner: Mutex<LlmUsageSnapshot>,
}

impl UsageCollector {
    pub fn new(
        base_url: impl Into<String>,
        provider_effective: impl Into<String>,
        model_effective: impl Into<String>,
    ) -> Self {
        Self {
            inner: Mutex::new(LlmUsageSnapshot {
                base_url: base_url.into(),
                provider_effective: provider_effective.into(),
                model_effective: model_effective.into(),
                ..LlmUsageSnapshot::default()
            }),
        }
    }

    /// Record one request's usage sample.
    pub fn record(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        provider_request_id: &str,
    ) {
        let mut usage = self.inner.lock().expect("usage lock");
        usage.prompt_tokens += prompt_tokens;
        usage.completion_tokens += completion_tokens;
        usage.total_tokens += if total_tokens > 0 {
            total_tokens
        } else {
            prompt_tokens + completion_tokens
        };
        usage.request_count += 1;
        let id = provider_request_id.trim();
        if !id.is_empty() {
            usage.provider_request_id = id.to_string();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LlmUsageSnapshot {
        self.inner.lock().expect("usage lock").clone()
    }
}

/// Pull `(prompt, completion, total, request_id)` out of a provider
/// response body. Tolerates both `prompt/completion` and `input/output`
/// counter names.
#[must_use]
pub fn extract_usage_from_payload(payload: &serde_json::Value) -> (u64, u64, u64, String) {
    let usage = &payload["usage"];
    let prompt = read_u64(usage, &["prompt_tokens", "input_tokens"]);
    let completion = read_u64(usage, &["completion_tokens", "output_tokens"]);
    let total = read_u64(usage, &["total_tokens"]);
    let request_id = payload["id"].as_str().unwrap_or("").trim().to_string();
    (prompt, completion, total, request_id)
}

fn read_u64(value: &serde_json::Value, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|key| value[*key].as_u64())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_accumulates_and_keeps_last_request_id() {
        let collector = UsageCollector::new("https://api.example.com", "example", "model-x");
        collector.record(10, 5, 15, "req-1");
        collector.record(20, 10, 0, "");
        collector.record(1, 1, 2, "req-3");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.prompt_tokens, 31);
        assert_eq!(snapshot.completion_tokens, 16);
        // Second sample falls back to prompt+completion
        assert_eq!(snapshot.total_tokens, 15 + 30 + 2);
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.provider_request_id, "req-3");
    }

    #[test]
    fn extract_usage_handles_both_counter_shapes() {
        let chat = json!({"id": "req-a", "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}});
        assert_eq!(
            extract_usage_from_payload(&chat),
            (7, 3, 10, "req-a".to_string())
        );

        let responses = json!({"id": "req-b", "usage": {"input_tokens": 4, "output_tokens": 2}});
        assert_eq!(
            extract_usage_from_payload(&responses),
            (4, 2, 0, "req-b".to_string())
        );

        let missing = json!({});
        assert_eq!(extract_usage_from_payload(&missing), (0, 0, 0, String::new()));
    }
}
