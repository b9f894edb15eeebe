//! Partial-result salvage.
//!
//! When the LLM stage breaks its JSON contract the sentences themselves
//! are still good; this module rebuilds a best-effort `PipelineOutput`
//! with empty translations, either from the work dir's ASR logs (full
//! jobs) or from the resume inputs.

use std::path::Path;

use sublingo_core::{
    PipelineOutput, PipelineStats, Sentence, Subtitle, SyncDiagnostics, WordSegment, round3,
};
use sublingo_pipeline::subtitle::{build_srt, normalize_timeline};

/// Rebuild subtitles from sentence rows with whatever translations exist.
fn output_from_sentences(
    sentences: Vec<Sentence>,
    word_segments: Vec<WordSegment>,
) -> Option<PipelineOutput> {
    let rows = normalize_timeline(sentences);
    if rows.is_empty() {
        return None;
    }

    let source_srt = build_srt(&rows, false);
    let bilingual_srt = build_srt(&rows, true);
    let subtitles = Subtitle::from_sentences(&rows);
    let duration_sec = subtitles.iter().map(|s| s.end).fold(0.0f64, f64::max);

    let stats = PipelineStats {
        duration_sec: round3(duration_sec),
        subtitle_count: subtitles.len(),
        word_count: word_segments.len(),
        ..PipelineStats::default()
    };

    Some(PipelineOutput {
        subtitles,
        source_srt,
        bilingual_srt,
        word_segments,
        diagnostics: SyncDiagnostics::default(),
        stats,
        partial: false,
        partial_stage: None,
        partial_error: None,
    })
}

/// Salvage from resume inputs.
#[must_use]
pub fn build_partial_from_sentences(
    sentences: &[Sentence],
    word_segments: &[WordSegment],
) -> Option<PipelineOutput> {
    let rows: Vec<Sentence> = sentences
        .iter()
        .filter(|row| !row.text.trim().is_empty())
        .cloned()
        .collect();
    output_from_sentences(rows, word_segments.to_vec())
}

/// Salvage from a full job's work-dir logs
/// (`log/asr_segments.json` + `log/word_segments.json`).
pub async fn build_partial_from_work_dir(work_dir: &Path) -> Option<PipelineOutput> {
    let work = sublingo_core::WorkDir::new(work_dir);
    let segments_blob = tokio::fs::read_to_string(work.asr_segments_json())
        .await
        .ok()?;
    let segments_log: serde_json::Value = serde_json::from_str(&segments_blob).ok()?;
    let segments = segments_log.get("segments")?.as_array()?;

    let mut sentences: Vec<Sentence> = Vec::with_capacity(segments.len());
    for segment in segments {
        let text = segment["text"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            continue;
        }
        let start = segment["start"].as_f64().unwrap_or(0.0).max(0.0);
        let end = segment["end"].as_f64().unwrap_or(start);
        sentences.push(Sentence {
            start: round3(start),
            end: round3(end.max(start)),
            text,
            translation: String::new(),
        });
    }

    let word_segments: Vec<WordSegment> = tokio::fs::read_to_string(work.word_segments_json())
        .await
        .ok()
        .and_then(|blob| serde_json::from_str::<serde_json::Value>(&blob).ok())
        .and_then(|log| serde_json::from_value(log.get("word_segments")?.clone()).ok())
        .unwrap_or_default();

    output_from_sentences(sentences, word_segments)
}
