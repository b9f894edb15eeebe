//! Word-timestamp aligner.
//!
//! Maps sentence rows onto spans of the flattened word stream. Three tiers,
//! cheapest first:
//!
//! 1. Exact substring match of the sentence's compact form against the
//!    concatenated compact word stream, resuming at the previous match end.
//! 2. Bounded fuzzy match: a window of up to 180 words, candidate spans of
//!    `expected_tokens - 3 ..= expected_tokens + 4` words, scored by LCS
//!    ratio. Accepted at >= 0.70 (>= 0.78 for sentences under 3 tokens).
//! 3. Proportional word-span fallback, only when the caller permits it
//!    (qwen file-trans provider). Scored 0.35.
//!
//! A total miss fails the run with `timestamp_alignment_failed` and a JSON
//! diagnostic. The aligner is deterministic: same inputs, same outputs.

mod index;

use serde_json::json;

use sublingo_core::{
    AlignmentDiagnostics, AlignmentMode, CancelCheck, ErrorCode, PipelineError, Sentence,
    StageResult, WordSegment, round3,
};

use index::{WordIndex, compact_sentence, tokenize_sentence};

/// Fuzzy-search window size in words.
const FUZZY_WINDOW_WORDS: usize = 180;

/// How many words before the cursor the fuzzy window may reach back.
const FUZZY_BACKTRACK_WORDS: usize = 3;

/// Acceptance threshold for fuzzy matches.
const FUZZY_MIN_RATIO: f64 = 0.70;

/// Stricter threshold for very short sentences.
const FUZZY_MIN_RATIO_SHORT: f64 = 0.78;

/// Sentences under this many tokens use the stricter threshold.
const FUZZY_SHORT_TOKEN_COUNT: usize = 3;

/// Row score assigned to proportional-fallback matches.
const FALLBACK_ROW_SCORE: f64 = 0.35;

/// Aligner invocation parameters.
#[derive(Clone, Debug)]
pub struct AlignRequest {
    /// Stage tag used in error envelopes.
    pub stage: String,
    /// Permit the proportional word-span fallback tier.
    pub allow_word_stream_fallback: bool,
}

impl Default for AlignRequest {
    fn default() -> Self {
        Self {
            stage: sublingo_core::stage::ALIGN_AND_BUILD.to_string(),
            allow_word_stream_fallback: false,
        }
    }
}

/// Aligned rows plus quality diagnostics.
#[derive(Clone, Debug)]
pub struct AlignOutcome {
    pub rows: Vec<Sentence>,
    pub diagnostics: AlignmentDiagnostics,
}

/// Align sentence rows against the flattened word stream.
///
/// `on_row(done, total)` fires after every aligned row; the cancel predicate
/// is read between rows.
pub fn align_sentences(
    rows: &[Sentence],
    word_segments: &[WordSegment],
    request: &AlignRequest,
    cancel: &CancelCheck,
    mut on_row: impl FnMut(usize, usize),
) -> StageResult<AlignOutcome> {
    let index = WordIndex::build(word_segments);
    if index.is_empty() {
        return Err(PipelineError::new(
            &request.stage,
            ErrorCode::TimestampAlignmentFailed,
            "word-level timestamps missing, cannot align subtitles",
        )
        .with_detail_json(&json!({ "reason": "word_segments_empty" })));
    }

    let mut aligned: Vec<Sentence> = Vec::with_capacity(rows.len());
    let mut scores: Vec<f64> = Vec::with_capacity(rows.len());
    let mut exact_match_rows = 0usize;
    let mut fuzzy_match_rows = 0usize;
    let mut fallback_rows = 0usize;
    let mut alignment_mode = AlignmentMode::Strict;
    let mut current_pos = 0usize;
    let mut current_word_idx = 0usize;
    let total_rows = rows.len().max(1);

    for (sentence_index, row) in rows.iter().enumerate() {
        if cancel() {
            return Err(PipelineError::cancel_requested(&request.stage));
        }
        let text = row.text.trim();
        if text.is_empty() {
            continue;
        }
        let clean_sentence = compact_sentence(text);
        if clean_sentence.is_empty() {
            continue;
        }

        let mut matched: Option<(usize, usize, f64)> = None;

        // Tier 1: exact substring from the current scan position.
        if let Some(exact_pos) = index.find_from(&clean_sentence, current_pos) {
            let start_idx = index.char_pos_to_word_idx(exact_pos);
            let end_idx = index.char_pos_to_word_idx(exact_pos + clean_sentence.len() - 1);
            if let (Some(start_idx), Some(end_idx)) = (start_idx, end_idx) {
                if end_idx >= start_idx {
                    matched = Some((start_idx, end_idx, 1.0));
                    exact_match_rows += 1;
                }
            }
        }

        // Tier 2: bounded fuzzy match over a word window.
        if matched.is_none() {
            let sentence_tokens = tokenize_sentence(text);
            if let Some((start_idx, end_idx, ratio)) =
                find_fuzzy_match(&sentence_tokens, &index, current_word_idx)
            {
                let min_accept = if sentence_tokens.len() >= FUZZY_SHORT_TOKEN_COUNT {
                    FUZZY_MIN_RATIO
                } else {
                    FUZZY_MIN_RATIO_SHORT
                };
                if ratio >= min_accept {
                    matched = Some((start_idx, end_idx, (ratio * 10_000.0).round() / 10_000.0));
                    fuzzy_match_rows += 1;
                }
            }
        }

        // Tier 3: proportional allocation over the remaining word budget.
        if matched.is_none() && request.allow_word_stream_fallback {
            if let Some((start_idx, end_idx)) =
                allocate_fallback_span(rows, sentence_index, text, &index, current_word_idx)
            {
                matched = Some((start_idx, end_idx, FALLBACK_ROW_SCORE));
                fallback_rows += 1;
                alignment_mode = AlignmentMode::QwenWordStreamFallback;
            }
        }

        let Some((start_idx, end_idx, row_score)) = matched else {
            let context = index.context_around(current_pos, clean_sentence.len(), 30);
            return Err(PipelineError::new(
                &request.stage,
                ErrorCode::TimestampAlignmentFailed,
                "word-level timestamp alignment failed",
            )
            .with_detail_json(&json!({
                "sentence_index": sentence_index,
                "sentence": text,
                "normalized_sentence": clean_sentence,
                "search_position": current_pos,
                "context": context,
                "aligned_rows": aligned.len(),
                "exact_match_rows": exact_match_rows,
                "fuzzy_match_rows": fuzzy_match_rows,
                "fallback_rows": fallback_rows,
                "allow_word_stream_fallback": request.allow_word_stream_fallback,
            })));
        };

        let start = index.word_start(start_idx);
        let end = index.word_end(end_idx).max(start);
        aligned.push(Sentence {
            start: round3(start),
            end: round3(end),
            text: text.to_string(),
            translation: row.translation.trim().to_string(),
        });
        current_pos = index.char_end_of_word(end_idx);
        current_word_idx = end_idx + 1;
        scores.push(row_score);

        on_row(sentence_index + 1, total_rows);
    }

    smooth_touching_boundaries(&mut aligned);

    let quality = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };
    #[allow(clippy::cast_precision_loss)]
    let fallback_ratio = fallback_rows as f64 / rows.len().max(1) as f64;
    let diagnostics = AlignmentDiagnostics {
        alignment_quality_score: (quality * 10_000.0).round() / 10_000.0,
        aligned_rows: aligned.len(),
        total_rows: rows.len(),
        exact_match_rows,
        fuzzy_match_rows,
        fallback_rows,
        fallback_ratio: (fallback_ratio * 10_000.0).round() / 10_000.0,
        alignment_mode,
    };

    Ok(AlignOutcome {
        rows: aligned,
        diagnostics,
    })
}

/// Fuzzy tier: scan candidate spans near the cursor, best LCS ratio wins.
fn find_fuzzy_match(
    sentence_tokens: &[String],
    index: &WordIndex,
    start_word_idx: usize,
) -> Option<(usize, usize, f64)> {
    if sentence_tokens.is_empty() || index.is_empty() {
        return None;
    }

    let expected_len = sentence_tokens.len().max(1);
    let target_compact = sentence_tokens.concat();
    let token_min_len = expected_len.saturating_sub(3).max(1);
    let token_max_len = expected_len + 4;

    let window_start = start_word_idx.saturating_sub(FUZZY_BACKTRACK_WORDS);
    let window_end = (start_word_idx + FUZZY_WINDOW_WORDS).min(index.word_count());
    if window_end <= window_start {
        return None;
    }

    let mut best: Option<(usize, usize, f64)> = None;
    for candidate_start in window_start..window_end {
        for token_len in token_min_len..=token_max_len {
            let candidate_end = candidate_start + token_len;
            if candidate_end > window_end {
                break;
            }
            let compact = index.joined_compact(candidate_start, candidate_end);
            let score = lcs_ratio(&target_compact, &compact);
            if best.is_none_or(|(_, _, prev)| score > prev) {
                best = Some((candidate_start, candidate_end - 1, score));
            }
        }
    }
    best.filter(|(start, end, _)| end >= start)
}

/// Similarity in [0, 1]: `2 * lcs / (len_a + len_b)`.
fn lcs_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    // Two-row DP over bytes; compact forms are ASCII by construction.
    let mut prev = vec![0usize; b_bytes.len() + 1];
    let mut next = vec![0usize; b_bytes.len() + 1];
    for &ac in a_bytes {
        for (j, &bc) in b_bytes.iter().enumerate() {
            next[j + 1] = if ac == bc {
                prev[j] + 1
            } else {
                prev[j + 1].max(next[j])
            };
        }
        std::mem::swap(&mut prev, &mut next);
    }
    let lcs = prev[b_bytes.len()];
    #[allow(clippy::cast_precision_loss)]
    let ratio = (2 * lcs) as f64 / (a_bytes.len() + b_bytes.len()) as f64;
    ratio
}

/// Fallback tier: allocate words proportionally to this sentence's share of
/// the remaining tokens, keeping at least one word for every later sentence.
fn allocate_fallback_span(
    rows: &[Sentence],
    sentence_index: usize,
    text: &str,
    index: &WordIndex,
    current_word_idx: usize,
) -> Option<(usize, usize)> {
    let remaining_words = index.word_count().saturating_sub(current_word_idx);
    let (remaining_rows, remaining_tokens) = count_remaining_rows_and_tokens(rows, sentence_index);
    let token_count = tokenize_sentence(text).len().max(1);
    if remaining_words == 0 || remaining_rows == 0 || remaining_tokens == 0 {
        return None;
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let proportional_words =
        ((remaining_words * token_count) as f64 / remaining_tokens as f64).round() as usize;
    let reserve_for_future = remaining_rows.saturating_sub(1);
    let max_words_for_current = remaining_words.saturating_sub(reserve_for_future).max(1);
    let allocated_words = proportional_words.max(1).min(max_words_for_current);

    let start_idx = current_word_idx;
    let end_idx = (start_idx + allocated_words - 1).min(index.word_count() - 1);
    (end_idx >= start_idx).then_some((start_idx, end_idx))
}

/// Rows and token totals still waiting for a span, from `start_index` on.
fn count_remaining_rows_and_tokens(rows: &[Sentence], start_index: usize) -> (usize, usize) {
    let mut remaining_rows = 0usize;
    let mut total_tokens = 0usize;
    for row in rows.iter().skip(start_index) {
        let text = row.text.trim();
        if text.is_empty() || compact_sentence(text).is_empty() {
            continue;
        }
        remaining_rows += 1;
        total_tokens += tokenize_sentence(text).len().max(1);
    }
    (remaining_rows, total_tokens)
}

/// Close sub-second gaps by extending the earlier row's end; never overlap.
fn smooth_touching_boundaries(rows: &mut [Sentence]) {
    for idx in 0..rows.len().saturating_sub(1) {
        let next_start = rows[idx + 1].start;
        let current = &mut rows[idx];
        let gap = next_start - current.end;
        if gap > 0.0 && gap < 1.0 {
            current.end = round3(next_start);
        }
        if current.end < current.start {
            current.end = round3(current.start);
        }
    }
}
