//! Subtitle assembler: overlong-line splitting, timeline normalization,
//! and SRT emission.

use std::sync::LazyLock;

use regex::Regex;

use sublingo_core::{Sentence, round3};

/// Line-length policy and split behavior.
#[derive(Clone, Debug)]
pub struct SubtitleConfig {
    /// Source-character budget per line.
    pub max_source_len: usize,
    /// Weighted translation length is compared as `weighted * multiplier >
    /// max_source_len`.
    pub translation_multiplier: f64,
    /// Recursive split rounds.
    pub max_split_rounds: usize,
    /// Minimum duration handed to a split child.
    pub min_child_duration: f64,
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            max_source_len: 75,
            translation_multiplier: 1.2,
            max_split_rounds: 3,
            min_child_duration: 0.3,
        }
    }
}

/// Display-width weight of one character.
///
/// CJK/Japanese and full-width forms read wider than Latin; Hangul sits in
/// between; Thai and ASCII count as one.
fn char_weight(c: char) -> f64 {
    let code = c as u32;
    match code {
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xFF01..=0xFF5E => 1.75,
        0xAC00..=0xD7A3 | 0x1100..=0x11FF => 1.5,
        _ => 1.0,
    }
}

/// Sum of per-character display weights.
#[must_use]
pub fn weighted_text_length(text: &str) -> f64 {
    text.chars().map(char_weight).sum()
}

/// Whether a row breaches the line-length policy.
#[must_use]
pub fn needs_secondary_split(text: &str, translation: &str, config: &SubtitleConfig) -> bool {
    if text.chars().count() > config.max_source_len {
        return true;
    }
    #[allow(clippy::cast_precision_loss)]
    let budget = config.max_source_len as f64;
    weighted_text_length(translation) * config.translation_multiplier > budget
}

static SPLIT_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[，,。！？!?；;：:]").expect("split punctuation regex"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Split the source text in two at the punctuation mark nearest its
/// midpoint, falling back to the nearest whitespace. Returns the original
/// text as a single part when no cut point exists.
#[must_use]
pub fn split_source_parts(text: &str) -> Vec<String> {
    let clean = WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned();
    if clean.is_empty() {
        return Vec::new();
    }
    if !clean.contains(' ') && !SPLIT_PUNCT.is_match(&clean) {
        return vec![clean];
    }

    let midpoint = clean.len() / 2;
    let mut split_index = 0usize;
    let punct_ends: Vec<usize> = SPLIT_PUNCT.find_iter(&clean).map(|m| m.end()).collect();
    if punct_ends.is_empty() {
        for matched in WHITESPACE_RUN.find_iter(&clean) {
            let position = matched.start();
            if split_index == 0 || position.abs_diff(midpoint) < split_index.abs_diff(midpoint) {
                split_index = position;
            }
        }
    } else {
        split_index = punct_ends
            .into_iter()
            .min_by_key(|pos| pos.abs_diff(midpoint))
            .unwrap_or(0);
    }

    if split_index == 0 || split_index >= clean.len() || !clean.is_char_boundary(split_index) {
        return vec![clean];
    }

    let left = clean[..split_index].trim();
    let right = clean[split_index..].trim();
    if left.is_empty() || right.is_empty() {
        return vec![clean];
    }
    vec![left.to_string(), right.to_string()]
}

/// Split the translation proportionally to the source parts' character
/// counts. Empty translations yield empty parts.
#[must_use]
pub fn split_translation_proportional(translation: &str, source_parts: &[String]) -> Vec<String> {
    let trimmed = translation.trim();
    if source_parts.is_empty() {
        return Vec::new();
    }
    if source_parts.len() == 1 || trimmed.is_empty() {
        let mut parts = vec![String::new(); source_parts.len()];
        parts[0] = trimmed.to_string();
        return parts;
    }

    let source_total: usize = source_parts.iter().map(|p| p.chars().count()).sum();
    let chars: Vec<char> = trimmed.chars().collect();
    let mut parts = Vec::with_capacity(source_parts.len());
    let mut cursor = 0usize;
    for (idx, source_part) in source_parts.iter().enumerate() {
        let take = if idx == source_parts.len() - 1 {
            chars.len() - cursor
        } else {
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let share = ((chars.len() * source_part.chars().count()) as f64
                / source_total.max(1) as f64)
                .round() as usize;
            share.min(chars.len() - cursor)
        };
        let part: String = chars[cursor..cursor + take].iter().collect();
        parts.push(part.trim().to_string());
        cursor += take;
    }
    parts
}

/// Distribute a parent's span over split children proportionally to their
/// character counts, with a minimum duration per child. The last child
/// always lands on the parent's end.
fn distribute_timeline(
    start: f64,
    end: f64,
    parts: Vec<(String, String)>,
    min_child_duration: f64,
) -> Vec<Sentence> {
    if parts.is_empty() {
        return Vec::new();
    }
    if parts.len() == 1 {
        let (text, translation) = parts.into_iter().next().expect("single part");
        return vec![Sentence {
            start,
            end: end.max(start + min_child_duration),
            text,
            translation,
        }];
    }

    let total_chars: usize = parts.iter().map(|(text, _)| text.chars().count()).sum();
    let duration = (end - start).max(0.5);
    let mut rows = Vec::with_capacity(parts.len());
    let mut cursor = start;
    let count = parts.len();
    for (idx, (text, translation)) in parts.into_iter().enumerate() {
        let next_cursor = if idx == count - 1 {
            end.max(cursor + min_child_duration)
        } else {
            #[allow(clippy::cast_precision_loss)]
            let share = duration * (text.chars().count() as f64 / total_chars.max(1) as f64);
            cursor + share.max(min_child_duration)
        };
        rows.push(Sentence {
            start: round3(cursor),
            end: round3(next_cursor),
            text,
            translation,
        });
        cursor = next_cursor;
    }
    rows
}

/// Split rows breaching the line policy, up to `max_split_rounds` passes.
#[must_use]
pub fn split_long_rows(sentences: Vec<Sentence>, config: &SubtitleConfig) -> Vec<Sentence> {
    let mut current = sentences;
    for _ in 0..config.max_split_rounds {
        let mut changed = false;
        let mut next_rows: Vec<Sentence> = Vec::with_capacity(current.len());
        for row in current {
            let text = row.text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            if !needs_secondary_split(&text, &row.translation, config) {
                next_rows.push(row);
                continue;
            }
            let source_parts = split_source_parts(&text);
            if source_parts.len() < 2 {
                next_rows.push(row);
                continue;
            }
            let translation_parts = split_translation_proportional(&row.translation, &source_parts);
            changed = true;
            let pairs: Vec<(String, String)> = source_parts
                .into_iter()
                .zip(translation_parts)
                .collect();
            next_rows.extend(distribute_timeline(
                row.start,
                row.end,
                pairs,
                config.min_child_duration,
            ));
        }
        current = next_rows;
        if !changed {
            break;
        }
    }
    current
}

/// Final timeline pass: drop empty rows, clamp `start >= 0` and
/// `end >= start`, enforce strict non-overlap, round to wire precision.
#[must_use]
pub fn normalize_timeline(sentences: Vec<Sentence>) -> Vec<Sentence> {
    let mut normalized: Vec<Sentence> = Vec::with_capacity(sentences.len());
    let mut prev_end = 0.0f64;
    for row in sentences {
        let text = row.text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        let mut start = if row.start.is_finite() { row.start } else { 0.0 }.max(0.0);
        if start < prev_end {
            start = prev_end;
        }
        let end = if row.end.is_finite() { row.end } else { start }.max(start);
        let item = Sentence {
            start: round3(start),
            end: round3(end),
            text,
            translation: row.translation.trim().to_string(),
        };
        prev_end = item.end;
        normalized.push(item);
    }
    normalized
}

/// `HH:MM:SS,mmm` SRT timestamp.
#[must_use]
pub fn format_srt_time(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = millis / 3_600_000;
    let minutes = (millis % 3_600_000) / 60_000;
    let secs = (millis % 60_000) / 1_000;
    let ms = millis % 1_000;
    format!("{hours:02}:{minutes:02}:{secs:02},{ms:03}")
}

/// Standard SRT. The bilingual variant puts the translation on a second
/// line when non-empty.
#[must_use]
pub fn build_srt(sentences: &[Sentence], include_translation: bool) -> String {
    let mut blocks: Vec<String> = Vec::with_capacity(sentences.len());
    for (index, row) in sentences.iter().enumerate() {
        let text = row.text.trim();
        let translation = row.translation.trim();
        let body = if include_translation && !translation.is_empty() {
            format!("{text}\n{translation}")
        } else {
            text.to_string()
        };
        blocks.push(format!(
            "{}\n{} --> {}\n{}",
            index + 1,
            format_srt_time(row.start),
            format_srt_time(row.end),
            body
        ));
    }
    blocks.join("\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(start: f64, end: f64, text: &str, translation: &str) -> Sentence {
        Sentence {
            start,
            end,
            text: text.to_string(),
            translation: translation.to_string(),
        }
    }

    #[test]
    fn weights_by_script() {
        assert!((weighted_text_length("abc") - 3.0).abs() < 1e-9);
        assert!((weighted_text_length("你好") - 3.5).abs() < 1e-9);
        assert!((weighted_text_length("한글") - 3.0).abs() < 1e-9);
        assert!((weighted_text_length("ไทย") - 3.0).abs() < 1e-9);
        assert!((weighted_text_length("！") - 1.75).abs() < 1e-9);
    }

    #[test]
    fn split_policy_thresholds() {
        let config = SubtitleConfig::default();
        let short = "hello world";
        assert!(!needs_secondary_split(short, "", &config));

        let long_source = "a".repeat(76);
        assert!(needs_secondary_split(&long_source, "", &config));

        // 40 CJK chars weigh 70; 70 * 1.2 = 84 > 75
        let heavy_translation = "你".repeat(40);
        assert!(needs_secondary_split(short, &heavy_translation, &config));
    }

    #[test]
    fn source_split_prefers_midpoint_punctuation() {
        let parts = split_source_parts("First clause, second clause follows here");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "First clause,");
        assert_eq!(parts[1], "second clause follows here");
    }

    #[test]
    fn source_split_falls_back_to_whitespace() {
        let parts = split_source_parts("alpha beta gamma delta");
        assert_eq!(parts.len(), 2);
        assert!(!parts[0].is_empty() && !parts[1].is_empty());
    }

    #[test]
    fn unsplittable_text_stays_whole() {
        assert_eq!(split_source_parts("supercalifragilistic"), vec![
            "supercalifragilistic".to_string()
        ]);
    }

    #[test]
    fn translation_splits_proportionally() {
        let source_parts = vec!["one two three".to_string(), "four".to_string()];
        let parts = split_translation_proportional("一二三四五六七八", &source_parts);
        assert_eq!(parts.len(), 2);
        let total: usize = parts.iter().map(|p| p.chars().count()).sum();
        assert_eq!(total, 8);
        assert!(parts[0].chars().count() > parts[1].chars().count());
    }

    #[test]
    fn long_rows_split_within_three_rounds() {
        let config = SubtitleConfig::default();
        let long_text = format!("{}, {}", "word ".repeat(12).trim(), "tail ".repeat(12).trim());
        assert!(long_text.len() > config.max_source_len);
        let rows = split_long_rows(vec![sentence(0.0, 6.0, &long_text, "")], &config);
        assert!(rows.len() >= 2);
        for row in &rows {
            assert!(row.text.chars().count() <= config.max_source_len);
        }
        // Children cover the parent's span exactly
        assert!((rows.first().unwrap().start - 0.0).abs() < 1e-9);
        assert!((rows.last().unwrap().end - 6.0).abs() < 1e-9);
    }

    #[test]
    fn split_children_respect_minimum_duration() {
        let config = SubtitleConfig::default();
        let long_text = format!("{}, {}", "a".repeat(50), "b".repeat(50));
        let rows = split_long_rows(vec![sentence(1.0, 1.05, &long_text, "")], &config);
        assert!(rows.len() >= 2);
        for row in &rows {
            assert!(row.end - row.start >= config.min_child_duration - 1e-9);
        }
    }

    #[test]
    fn normalize_enforces_non_overlap() {
        let rows = normalize_timeline(vec![
            sentence(0.0, 2.0, "a", ""),
            sentence(1.5, 3.0, "b", ""),
            sentence(2.9, 2.0, "c", ""),
            sentence(3.0, 3.5, "  ", ""),
        ]);
        assert_eq!(rows.len(), 3);
        assert!((rows[1].start - 2.0).abs() < 1e-9);
        for pair in rows.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        // Clamped end >= start
        assert!(rows[2].end >= rows[2].start);
    }

    #[test]
    fn srt_formatting() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(1.5), "00:00:01,500");
        assert_eq!(format_srt_time(3661.042), "01:01:01,042");
    }

    #[test]
    fn srt_emission_mono_and_bilingual() {
        let rows = vec![
            sentence(0.0, 1.5, "Hello world", "你好世界"),
            sentence(1.6, 3.0, "How are you", ""),
        ];
        let mono = build_srt(&rows, false);
        assert!(mono.starts_with("1\n00:00:00,000 --> 00:00:01,500\nHello world"));
        assert!(!mono.contains("你好世界"));

        let bilingual = build_srt(&rows, true);
        assert!(bilingual.contains("Hello world\n你好世界"));
        // Second row has no translation, stays single-line
        assert!(bilingual.contains("2\n00:00:01,600 --> 00:00:03,000\nHow are you"));
    }
}
