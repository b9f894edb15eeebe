//! LLM protocol negotiation rules.
//!
//! Two competing OpenAI-compatible HTTP shapes exist in the wild: the
//! `responses` single-input-array endpoint and the classic chat-completions
//! messages endpoint. An explicit endpoint suffix in the configured base
//! URL wins; otherwise the model family decides; the opposite shape is
//! always listed as the fallback.

use sublingo_core::domain::DEFAULT_LLM_BASE_URL;

/// Model-name prefixes that prefer the `responses` shape.
const RESPONSES_PREFERRED_MODEL_PREFIXES: [&str; 4] = ["gpt-5", "o1", "o3", "o4"];

/// Error-text fragments that justify falling back to the other protocol.
const FALLBACK_HINT_TOKENS: [&str; 13] = [
    "unsupported",
    "not support",
    "not_supported",
    "unknown parameter",
    "unrecognized",
    "unknown url",
    "unknown endpoint",
    "no route",
    "route not found",
    "not found",
    "method not allowed",
    "invalid endpoint",
    "cannot post",
];

/// Error-text fragments that must surface to the user instead of falling
/// back (credential and billing problems).
const NO_FALLBACK_HINT_TOKENS: [&str; 8] = [
    "invalid api key",
    "incorrect api key",
    "authentication",
    "unauthorized",
    "forbidden",
    "insufficient_quota",
    "insufficient quota",
    "billing",
];

/// The two OpenAI-compatible request shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProtocol {
    Responses,
    Chat,
}

impl LlmProtocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Responses => "responses",
            Self::Chat => "chat.completions",
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Responses => Self::Chat,
            Self::Chat => Self::Responses,
        }
    }
}

/// Normalize a configured base URL: default when empty, scheme when bare,
/// explicit endpoint suffixes and trailing slashes stripped. Idempotent.
#[must_use]
pub fn normalize_llm_base_url(base_url: &str) -> String {
    let mut value = base_url.trim().to_string();
    if value.is_empty() {
        value = DEFAULT_LLM_BASE_URL.to_string();
    }
    if !value.contains("://") {
        value = format!("https://{value}");
    }
    while value.ends_with('/') {
        value.pop();
    }
    let lower = value.to_lowercase();
    for suffix in ["/responses", "/chat/completions", "/completions"] {
        if lower.ends_with(suffix) {
            value.truncate(value.len() - suffix.len());
            break;
        }
    }
    value.trim_end_matches('/').to_string()
}

fn model_prefers_responses(model: &str) -> bool {
    let model_lower = model.trim().to_lowercase();
    RESPONSES_PREFERRED_MODEL_PREFIXES
        .iter()
        .any(|prefix| model_lower.starts_with(prefix))
}

/// Ordered protocol candidates `[first, fallback]`.
#[must_use]
pub fn infer_protocol_candidates(base_url: &str, model: &str) -> [LlmProtocol; 2] {
    let raw = base_url.trim();
    if raw.is_empty() && model_prefers_responses(model) {
        return [LlmProtocol::Responses, LlmProtocol::Chat];
    }

    let mut first = LlmProtocol::Chat;
    let mut explicit = false;

    let normalized = raw.to_lowercase();
    let normalized = normalized.trim_end_matches('/');
    if normalized.ends_with("/responses") {
        first = LlmProtocol::Responses;
        explicit = true;
    } else if normalized.ends_with("/chat/completions") || normalized.ends_with("/completions") {
        first = LlmProtocol::Chat;
        explicit = true;
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    if let Ok(parsed) = url::Url::parse(&with_scheme) {
        let path = parsed.path().to_lowercase();
        if path.ends_with("/responses") {
            first = LlmProtocol::Responses;
            explicit = true;
        } else if path.ends_with("/chat/completions") || path.ends_with("/completions") {
            first = LlmProtocol::Chat;
            explicit = true;
        }
    }

    if !explicit && first != LlmProtocol::Responses && model_prefers_responses(model) {
        first = LlmProtocol::Responses;
    }

    [first, first.opposite()]
}

/// Decide whether a failed request justifies trying the other protocol.
#[must_use]
pub fn should_fallback_protocol(status_code: Option<u16>, error_text: &str) -> bool {
    let text = error_text.to_lowercase();
    if NO_FALLBACK_HINT_TOKENS.iter().any(|token| text.contains(token)) {
        return false;
    }
    let Some(status) = status_code else {
        // Network error without a status: worth trying the other shape
        return true;
    };
    match status {
        401 | 403 => false,
        code if code >= 500 => true,
        404 | 405 | 406 | 408 | 410 | 415 | 421 | 422 | 425 | 426 | 429 => true,
        _ => FALLBACK_HINT_TOKENS.iter().any(|token| text.contains(token)),
    }
}

/// Provider label inferred from the endpoint host, for metering records.
#[must_use]
pub fn infer_llm_provider(base_url: &str) -> String {
    let normalized = normalize_llm_base_url(base_url);
    let host = url::Url::parse(&normalized)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default();
    if host.is_empty() {
        return String::new();
    }
    if host.contains("dashscope.aliyuncs.com") {
        return "dashscope".to_string();
    }
    if host.contains("openai.com") {
        return "openai".to_string();
    }
    if host.contains("openrouter.ai") {
        return "openrouter".to_string();
    }
    if host.contains("siliconflow.cn") {
        return "siliconflow".to_string();
    }
    host.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_defaults_and_strips_suffixes() {
        assert_eq!(normalize_llm_base_url(""), DEFAULT_LLM_BASE_URL);
        assert_eq!(
            normalize_llm_base_url("api.example.com/v1/"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_llm_base_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_llm_base_url("https://api.example.com/v1/responses"),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in [
            "",
            "api.example.com/v1/responses",
            "https://api.siliconflow.cn/v1/",
        ] {
            let once = normalize_llm_base_url(input);
            assert_eq!(normalize_llm_base_url(&once), once);
        }
    }

    #[test]
    fn explicit_suffix_wins_over_model_preference() {
        assert_eq!(
            infer_protocol_candidates("https://api.example.com/v1/chat/completions", "gpt-5"),
            [LlmProtocol::Chat, LlmProtocol::Responses]
        );
        assert_eq!(
            infer_protocol_candidates("https://api.example.com/v1/responses", "some-model"),
            [LlmProtocol::Responses, LlmProtocol::Chat]
        );
    }

    #[test]
    fn model_family_decides_without_explicit_suffix() {
        assert_eq!(
            infer_protocol_candidates("https://api.example.com/v1", "o3-mini"),
            [LlmProtocol::Responses, LlmProtocol::Chat]
        );
        assert_eq!(
            infer_protocol_candidates("https://api.example.com/v1", "tencent/Hunyuan-MT-7B"),
            [LlmProtocol::Chat, LlmProtocol::Responses]
        );
        assert_eq!(
            infer_protocol_candidates("", "gpt-5-mini"),
            [LlmProtocol::Responses, LlmProtocol::Chat]
        );
    }

    #[test]
    fn fallback_classification() {
        // Credential problems never fall back
        assert!(!should_fallback_protocol(Some(401), "unauthorized"));
        assert!(!should_fallback_protocol(Some(500), "insufficient_quota exceeded"));
        assert!(!should_fallback_protocol(None, "Invalid API key provided"));
        // Network errors fall back
        assert!(should_fallback_protocol(None, "connection refused"));
        // Server errors fall back
        assert!(should_fallback_protocol(Some(502), "bad gateway"));
        // Routing-ish statuses fall back
        for status in [404, 405, 406, 408, 410, 415, 421, 422, 425, 426, 429] {
            assert!(should_fallback_protocol(Some(status), ""), "status {status}");
        }
        // 400 only with a hint
        assert!(should_fallback_protocol(Some(400), "unknown parameter: text.format"));
        assert!(!should_fallback_protocol(Some(400), "temperature out of range"));
    }

    #[test]
    fn provider_inference() {
        assert_eq!(infer_llm_provider(""), "siliconflow");
        assert_eq!(
            infer_llm_provider("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            "dashscope"
        );
        assert_eq!(infer_llm_provider("https://api.openai.com/v1"), "openai");
        assert_eq!(
            infer_llm_provider("https://llm.internal.example.org/v1"),
            "llm_internal_example_org"
        );
    }
}
