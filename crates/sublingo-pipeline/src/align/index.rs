//! Compact word index used by the aligner.
//!
//! Words are normalized (lowercased, non-alphanumeric stripped) and
//! concatenated into one string; `char_starts[i]` is the cumulative length
//! before token `i`, so a byte position in the concatenated string maps
//! back to a word index by binary search.

use sublingo_core::{WordSegment, normalize_token};

/// One retained word: compact form plus original timing.
#[derive(Clone, Debug)]
struct IndexedWord {
    compact: String,
    start: f64,
    end: f64,
}

/// Normalized, position-indexed view of the word stream.
#[derive(Clone, Debug, Default)]
pub struct WordIndex {
    full: String,
    char_starts: Vec<usize>,
    words: Vec<IndexedWord>,
}

impl WordIndex {
    /// Build the index, dropping words whose compact form is empty or whose
    /// timing is invalid.
    #[must_use]
    pub fn build(word_segments: &[WordSegment]) -> Self {
        let mut index = Self::default();
        for segment in word_segments {
            let compact = normalize_token(&segment.word);
            if compact.is_empty() || !segment.has_valid_timing() {
                continue;
            }
            index.char_starts.push(index.full.len());
            index.full.push_str(&compact);
            index.words.push(IndexedWord {
                compact,
                start: segment.start,
                end: segment.end,
            });
        }
        index
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() || self.full.is_empty()
    }

    #[must_use]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Exact substring search starting at byte position `from`.
    #[must_use]
    pub fn find_from(&self, needle: &str, from: usize) -> Option<usize> {
        if from >= self.full.len() {
            return None;
        }
        self.full[from..].find(needle).map(|pos| pos + from)
    }

    /// Map a byte position in the concatenated string to a word index.
    #[must_use]
    pub fn char_pos_to_word_idx(&self, char_pos: usize) -> Option<usize> {
        if self.char_starts.is_empty() {
            return None;
        }
        // partition_point gives the first start greater than char_pos
        let idx = self.char_starts.partition_point(|&start| start <= char_pos);
        idx.checked_sub(1)
    }

    #[must_use]
    pub fn word_start(&self, idx: usize) -> f64 {
        self.words[idx].start
    }

    #[must_use]
    pub fn word_end(&self, idx: usize) -> f64 {
        self.words[idx].end
    }

    /// Byte position just past word `idx` in the concatenated string.
    #[must_use]
    pub fn char_end_of_word(&self, idx: usize) -> usize {
        self.char_starts[idx] + self.words[idx].compact.len()
    }

    /// Compact forms of words `[start, end)` joined.
    #[must_use]
    pub fn joined_compact(&self, start: usize, end: usize) -> String {
        self.words[start..end]
            .iter()
            .map(|word| word.compact.as_str())
            .collect()
    }

    /// A slice of the concatenated string around `pos`, for diagnostics.
    #[must_use]
    pub fn context_around(&self, pos: usize, needle_len: usize, radius: usize) -> String {
        let start = pos.saturating_sub(radius);
        let end = (pos + needle_len + radius).min(self.full.len());
        self.full[start..end].to_string()
    }
}

/// Sentence tokens: lowercase, punctuation stripped per token, whitespace
/// split. Tokens whose normalized form is empty are dropped.
#[must_use]
pub fn tokenize_sentence(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(normalize_token)
        .filter(|token| !token.is_empty())
        .collect()
}

/// The sentence's compact form: tokens joined without separators.
#[must_use]
pub fn compact_sentence(text: &str) -> String {
    tokenize_sentence(text).concat()
}
