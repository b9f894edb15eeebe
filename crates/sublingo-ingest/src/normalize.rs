//! Source URL validation and normalization.
//!
//! Callers may paste a bare URL or a free-text blob (share sheets, chat
//! messages). The first `http(s)://…` substring is extracted, trailing
//! punctuation and CJK break characters are trimmed, and the result is
//! canonicalized so equal links hit the same cache row.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use sublingo_core::{ErrorCode, PipelineError, StageResult, stage};

static URL_SCAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>'"`]+"#).expect("url scan regex"));
static TRAILING_TRIM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[)\]\}>,.;!?。！？；，、》】）]+$").expect("trailing trim regex"));
static INLINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[，。！？；、）】》]").expect("inline break regex"));

fn parse_http_url(value: &str) -> Option<Url> {
    let parsed = Url::parse(value.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str()?;
    Some(parsed)
}

/// All plausible URLs in a free-text blob, cleaned and deduplicated.
#[must_use]
pub fn extract_url_candidates(raw: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for matched in URL_SCAN.find_iter(raw) {
        let mut cleaned = TRAILING_TRIM.replace(matched.as_str().trim(), "").into_owned();
        if let Some(break_match) = INLINE_BREAK.find(&cleaned) {
            cleaned.truncate(break_match.start());
            cleaned = cleaned.trim().to_string();
        }
        if parse_http_url(&cleaned).is_none() {
            continue;
        }
        let dedup_key = cleaned.to_lowercase();
        if seen.contains(&dedup_key) {
            continue;
        }
        seen.push(dedup_key);
        candidates.push(cleaned);
    }
    candidates
}

fn canonical_form(parsed: &Url) -> String {
    let scheme = parsed.scheme().to_lowercase();
    let host = parsed.host_str().unwrap_or("").to_lowercase();
    let port = parsed
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    let path = {
        let path = parsed.path();
        if path.is_empty() { "/" } else { path }
    };
    let query = parsed
        .query()
        .filter(|q| !q.is_empty())
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    format!("{scheme}://{host}{port}{path}{query}")
}

/// Canonicalize a source URL, or extract one from free text.
///
/// Fragments are dropped; scheme and host are lowercased; an empty path
/// becomes `/`. Normalization is idempotent. Anything without a usable
/// `http(s)` URL is `invalid_source_url`.
pub fn normalize_source_url(raw: &str) -> StageResult<String> {
    let value = raw.trim();
    if let Some(parsed) = parse_http_url(value) {
        return Ok(canonical_form(&parsed));
    }

    let candidates = extract_url_candidates(value);
    if let Some(first) = candidates.first() {
        if let Some(parsed) = parse_http_url(first) {
            return Ok(canonical_form(&parsed));
        }
    }

    let preview: String = value.chars().take(200).collect();
    Err(PipelineError::new(
        stage::DOWNLOAD_SOURCE,
        ErrorCode::InvalidSourceUrl,
        "source link is not a valid http(s) URL",
    )
    .with_detail(format!("url={preview}")))
}
