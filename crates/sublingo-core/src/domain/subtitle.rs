//! Subtitle-domain value types: word segments, sentences, emitted rows,
//! and alignment diagnostics.

use serde::{Deserialize, Serialize};

/// Which runtime produced a word segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordSource {
    #[default]
    Cloud,
    Local,
}

impl WordSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        }
    }
}

/// A single spoken token with word-level timing.
///
/// The raw token is kept verbatim; matching always goes through
/// [`normalize_token`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordSegment {
    /// 1-based position in the flattened word stream.
    pub id: u32,
    /// Seconds, 3-decimal precision.
    pub start: f64,
    pub end: f64,
    /// Raw token text as returned by the provider.
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Index of the ASR segment this word came from.
    pub asr_segment_index: u32,
    pub source: WordSource,
}

impl WordSegment {
    /// Valid timing: finite, non-negative, `end > start`.
    #[must_use]
    pub fn has_valid_timing(&self) -> bool {
        self.start.is_finite() && self.end.is_finite() && self.start >= 0.0 && self.end > self.start
    }
}

/// Normalize a token for matching: lowercase, strip everything that is not
/// ASCII alphanumeric, collapse whitespace away entirely.
#[must_use]
pub fn normalize_token(raw: &str) -> String {
    raw.chars()
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// One translated sentence with timing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub translation: String,
}

impl Sentence {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            translation: String::new(),
        }
    }
}

/// One emitted subtitle row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    /// 1-based display index.
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub translation: String,
    /// 0-based index, kept for clients that address rows positionally.
    pub index: u32,
}

impl Subtitle {
    /// Build the emitted rows from a finished sentence list.
    #[must_use]
    pub fn from_sentences(sentences: &[Sentence]) -> Vec<Self> {
        sentences
            .iter()
            .enumerate()
            .map(|(index, row)| Self {
                id: u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1),
                start: round3(row.start),
                end: round3(row.end),
                text: row.text.trim().to_string(),
                translation: row.translation.trim().to_string(),
                index: u32::try_from(index).unwrap_or(u32::MAX),
            })
            .collect()
    }
}

/// Round to 3 decimals, the wire precision for all durations.
#[must_use]
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// How the aligner matched the overall row set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    #[default]
    Strict,
    QwenWordStreamFallback,
}

impl AlignmentMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::QwenWordStreamFallback => "qwen_word_stream_fallback",
        }
    }
}

/// Per-run aligner diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentDiagnostics {
    /// Mean per-row score in [0, 1]: exact 1.0, fuzzy its ratio, fallback 0.35.
    pub alignment_quality_score: f64,
    pub aligned_rows: usize,
    pub total_rows: usize,
    pub exact_match_rows: usize,
    pub fuzzy_match_rows: usize,
    pub fallback_rows: usize,
    /// `fallback_rows / total_rows`.
    pub fallback_ratio: f64,
    pub alignment_mode: AlignmentMode,
}
