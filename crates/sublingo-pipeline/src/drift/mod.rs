//! Drift synchronizer.
//!
//! Detects a global timing offset and linear drift between the reference
//! word stream and the aligned sentence stream, and corrects the sentence
//! timeline when the mismatch is worth fixing. FFT cross-correlation first;
//! a boundary-span estimate as fallback when the FFT score is weak.

mod boundary;
mod fftsync;

use serde::{Deserialize, Serialize};

use sublingo_core::{CancelCheck, PipelineError, Sentence, StageResult, WordSegment, round3, stage};

pub use boundary::estimate_offset_scale_boundary;
pub use fftsync::estimate_offset_scale_fft;

/// Tunable thresholds. Defaults mirror acceptance-tested values; deployers
/// override through the pipeline config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Trigger when `|start_gap|` reaches this many seconds.
    pub start_gap_threshold: f64,
    /// Trigger when `|end_gap|` reaches this many seconds.
    pub end_gap_threshold: f64,
    /// Trigger when alignment quality falls below this score.
    pub quality_threshold: f64,
    /// Rasterization rate for activity arrays.
    pub sample_rate_hz: u32,
    /// Lag search bound.
    pub max_offset_seconds: f64,
    /// Below this FFT score the boundary fallback takes over.
    pub fft_score_floor: f64,
    /// Corrections smaller than this offset are skipped.
    pub min_offset_applied: f64,
    /// Corrections closer to scale 1.0 than this are skipped.
    pub min_scale_delta: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            start_gap_threshold: 0.12,
            end_gap_threshold: 0.18,
            quality_threshold: 0.92,
            sample_rate_hz: 100,
            max_offset_seconds: 12.0,
            fft_score_floor: 0.35,
            min_offset_applied: 0.08,
            min_scale_delta: 0.002,
        }
    }
}

/// One offset/scale estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct DriftEstimate {
    pub ok: bool,
    pub offset_seconds: f64,
    pub drift_scale: f64,
    pub score: f64,
    pub method: &'static str,
    pub reason: Option<&'static str>,
}

impl DriftEstimate {
    pub(crate) const fn not_ok(method: &'static str, reason: &'static str) -> Self {
        Self {
            ok: false,
            offset_seconds: 0.0,
            drift_scale: 1.0,
            score: 0.0,
            method,
            reason: Some(reason),
        }
    }
}

/// Correction diagnostics surfaced into the job's sync snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftDiagnostics {
    pub triggered: bool,
    pub correction_applied: bool,
    pub correction_method: String,
    pub global_offset_ms: i64,
    pub drift_scale: f64,
    pub correction_score: f64,
    pub boundary_start_gap_before: f64,
    pub boundary_end_gap_before: f64,
    pub boundary_start_gap_after: f64,
    pub boundary_end_gap_after: f64,
}

/// Valid `(start, end)` activity ranges from sentences.
#[must_use]
pub fn sentence_ranges(rows: &[Sentence]) -> Vec<(f64, f64)> {
    rows.iter()
        .filter(|row| row.start.is_finite() && row.end.is_finite() && row.end > row.start)
        .map(|row| (row.start.max(0.0), row.end.max(0.0)))
        .collect()
}

/// Valid `(start, end)` activity ranges from the word stream.
#[must_use]
pub fn word_ranges(words: &[WordSegment]) -> Vec<(f64, f64)> {
    words
        .iter()
        .filter(|word| word.has_valid_timing())
        .map(|word| (word.start.max(0.0), word.end.max(0.0)))
        .collect()
}

/// `(first_query - first_ref, last_query - last_ref)`.
fn boundary_gaps(reference: &[(f64, f64)], query: &[(f64, f64)]) -> (f64, f64) {
    if reference.is_empty() || query.is_empty() {
        return (0.0, 0.0);
    }
    let first_ref = reference.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let last_ref = reference.iter().map(|r| r.1).fold(f64::NEG_INFINITY, f64::max);
    let first_query = query.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let last_query = query.iter().map(|r| r.1).fold(f64::NEG_INFINITY, f64::max);
    (first_query - first_ref, last_query - last_ref)
}

/// Apply `new = old * scale + offset`, clamped monotonic and non-overlapping.
fn apply_transform(rows: &[Sentence], offset_seconds: f64, drift_scale: f64) -> Vec<Sentence> {
    let mut corrected = Vec::with_capacity(rows.len());
    let mut prev_end = 0.0f64;
    for row in rows {
        let mut start = (row.start.mul_add(drift_scale, offset_seconds)).max(0.0);
        let mut end = (row.end.mul_add(drift_scale, offset_seconds)).max(start);
        if start < prev_end {
            start = prev_end;
        }
        if end < start {
            end = start;
        }
        let next = Sentence {
            start: round3(start),
            end: round3(end),
            text: row.text.clone(),
            translation: row.translation.clone(),
        };
        prev_end = next.end;
        corrected.push(next);
    }
    corrected
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Detect and, when warranted, correct timeline drift.
///
/// Returns the (possibly corrected) sentences plus diagnostics. A run below
/// every trigger threshold is a no-op by construction.
pub fn apply_adaptive_drift_correction(
    sentences: Vec<Sentence>,
    word_segments: &[WordSegment],
    alignment_quality_score: f64,
    config: &DriftConfig,
    cancel: &CancelCheck,
) -> StageResult<(Vec<Sentence>, DriftDiagnostics)> {
    let query = sentence_ranges(&sentences);
    let reference = word_ranges(word_segments);
    let (start_gap_before, end_gap_before) = boundary_gaps(&reference, &query);

    let should_trigger = start_gap_before.abs() >= config.start_gap_threshold
        || end_gap_before.abs() >= config.end_gap_threshold
        || alignment_quality_score < config.quality_threshold;

    let mut diagnostics = DriftDiagnostics {
        triggered: should_trigger,
        correction_method: "none".to_string(),
        drift_scale: 1.0,
        boundary_start_gap_before: round4(start_gap_before),
        boundary_end_gap_before: round4(end_gap_before),
        boundary_start_gap_after: round4(start_gap_before),
        boundary_end_gap_after: round4(end_gap_before),
        ..DriftDiagnostics::default()
    };

    if !should_trigger || query.is_empty() || reference.is_empty() {
        return Ok((sentences, diagnostics));
    }

    let fft = estimate_offset_scale_fft(&reference, &query, config, cancel)?;
    let chosen = if fft.ok && fft.score >= config.fft_score_floor {
        fft
    } else {
        estimate_offset_scale_boundary(&reference, &query)
    };

    if !chosen.ok {
        return Ok((sentences, diagnostics));
    }

    diagnostics.correction_method = chosen.method.to_string();
    #[allow(clippy::cast_possible_truncation)]
    {
        diagnostics.global_offset_ms = (chosen.offset_seconds * 1000.0).round() as i64;
    }
    diagnostics.drift_scale = (chosen.drift_scale * 1_000_000.0).round() / 1_000_000.0;
    diagnostics.correction_score = round4(chosen.score);

    let small_adjust = chosen.offset_seconds.abs() < config.min_offset_applied
        && (chosen.drift_scale - 1.0).abs() < config.min_scale_delta;
    if small_adjust {
        return Ok((sentences, diagnostics));
    }

    if cancel() {
        return Err(PipelineError::cancel_requested(stage::ALIGN_AND_BUILD));
    }

    let corrected = apply_transform(&sentences, chosen.offset_seconds, chosen.drift_scale);
    let corrected_ranges = sentence_ranges(&corrected);
    let (start_gap_after, end_gap_after) = boundary_gaps(&reference, &corrected_ranges);
    diagnostics.correction_applied = true;
    diagnostics.boundary_start_gap_after = round4(start_gap_after);
    diagnostics.boundary_end_gap_after = round4(end_gap_after);

    tracing::debug!(
        target: "sublingo.drift",
        method = %diagnostics.correction_method,
        offset_ms = diagnostics.global_offset_ms,
        scale = diagnostics.drift_scale,
        score = diagnostics.correction_score,
        "drift correction applied"
    );

    Ok((corrected, diagnostics))
}
