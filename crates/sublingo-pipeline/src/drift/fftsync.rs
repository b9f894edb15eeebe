//! FFT cross-correlation offset/scale estimation.
//!
//! Both streams are rasterized into binary activity arrays; for each
//! candidate scale factor the sentence timeline is stretched, correlated
//! against the reference via FFT, and the best lag inside the offset bound
//! is scored by L2-normalized correlation.

use realfft::RealFftPlanner;

use sublingo_core::{CancelCheck, PipelineError, StageResult, stage};

use super::{DriftConfig, DriftEstimate};

/// Candidate linear drift factors.
const SCALE_CANDIDATES: [f64; 7] = [0.985, 0.99, 0.995, 1.0, 1.005, 1.01, 1.015];

/// Estimate offset and scale via FFT cross-correlation.
///
/// The cancel predicate is read between scale candidates. Returns a
/// not-ok estimate (never an error) when the inputs are unusable.
pub fn estimate_offset_scale_fft(
    reference_ranges: &[(f64, f64)],
    query_ranges: &[(f64, f64)],
    config: &DriftConfig,
    cancel: &CancelCheck,
) -> StageResult<DriftEstimate> {
    let reference = safe_ranges(reference_ranges);
    let query = safe_ranges(query_ranges);
    if reference.is_empty() || query.is_empty() {
        return Ok(DriftEstimate::not_ok("fftsync", "empty_input"));
    }

    let sample_rate = f64::from(config.sample_rate_hz.max(1));
    let ref_last = reference.iter().map(|r| r.1).fold(0.0f64, f64::max);

    let mut best = DriftEstimate {
        ok: false,
        offset_seconds: 0.0,
        drift_scale: 1.0,
        score: -1.0,
        method: "fftsync",
        reason: Some("no_match"),
    };

    let mut planner = RealFftPlanner::<f64>::new();

    for scale in SCALE_CANDIDATES {
        if cancel() {
            return Err(PipelineError::cancel_requested(stage::ALIGN_AND_BUILD));
        }

        let scaled_query: Vec<(f64, f64)> =
            query.iter().map(|(s, e)| (s * scale, e * scale)).collect();
        let query_last = scaled_query.iter().map(|r| r.1).fold(0.0f64, f64::max);
        let total_seconds = ref_last.max(query_last) + config.max_offset_seconds + 1.0;

        let ref_series = build_activity_array(&reference, sample_rate, total_seconds);
        let query_series = build_activity_array(&scaled_query, sample_rate, total_seconds);
        if ref_series.iter().all(|&v| v == 0.0) || query_series.iter().all(|&v| v == 0.0) {
            continue;
        }

        let Some(corr) = fft_cross_correlation(&mut planner, &ref_series, &query_series) else {
            continue;
        };

        #[allow(clippy::cast_possible_truncation)]
        let max_lag = (config.max_offset_seconds * sample_rate).round().max(0.0) as i64;
        let size = corr.len() as i64;
        let mut best_lag = 0i64;
        let mut best_value = f64::NEG_INFINITY;
        for lag in -max_lag..=max_lag {
            #[allow(clippy::cast_sign_loss)]
            let idx = lag.rem_euclid(size) as usize;
            let value = corr[idx];
            if value > best_value {
                best_value = value;
                best_lag = lag;
            }
        }
        if !best_value.is_finite() {
            continue;
        }

        let denom = l2_norm(&ref_series) * l2_norm(&query_series) + 1e-6;
        let score = best_value / denom;
        if score > best.score {
            #[allow(clippy::cast_precision_loss)]
            let offset_seconds = best_lag as f64 / sample_rate;
            best = DriftEstimate {
                ok: true,
                offset_seconds,
                drift_scale: scale,
                score,
                method: "fftsync",
                reason: None,
            };
        }
    }

    best.score = if best.ok {
        best.score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(best)
}

/// Drop non-finite and zero/negative-length ranges, clamp to `t >= 0`.
fn safe_ranges(items: &[(f64, f64)]) -> Vec<(f64, f64)> {
    items
        .iter()
        .filter(|(start, end)| start.is_finite() && end.is_finite() && end > start)
        .map(|(start, end)| (start.max(0.0), end.max(0.0)))
        .collect()
}

/// Rasterize ranges into a binary activity array.
fn build_activity_array(ranges: &[(f64, f64)], sample_rate: f64, total_seconds: f64) -> Vec<f64> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total_len = ((total_seconds.max(0.1) * sample_rate).ceil() as usize).max(1) + 1;
    let mut series = vec![0.0f64; total_len];
    for (start, end) in ranges {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let s_idx = ((start * sample_rate).floor().max(0.0)) as usize;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let e_idx = (((end * sample_rate).ceil()) as usize).min(total_len);
        if e_idx <= s_idx {
            continue;
        }
        for value in &mut series[s_idx..e_idx] {
            *value = 1.0;
        }
    }
    series
}

/// Circular cross-correlation `IFFT(FFT(ref) * conj(FFT(query)))`.
///
/// Index `lag mod size` holds the correlation at that lag.
fn fft_cross_correlation(
    planner: &mut RealFftPlanner<f64>,
    reference: &[f64],
    query: &[f64],
) -> Option<Vec<f64>> {
    let n = reference.len() + query.len() - 1;
    let size = n.max(2).next_power_of_two();

    let r2c = planner.plan_fft_forward(size);
    let c2r = planner.plan_fft_inverse(size);

    let mut ref_buf = vec![0.0f64; size];
    ref_buf[..reference.len()].copy_from_slice(reference);
    let mut ref_spectrum = r2c.make_output_vec();
    r2c.process(&mut ref_buf, &mut ref_spectrum).ok()?;

    let mut query_buf = vec![0.0f64; size];
    query_buf[..query.len()].copy_from_slice(query);
    let mut query_spectrum = r2c.make_output_vec();
    r2c.process(&mut query_buf, &mut query_spectrum).ok()?;

    for (r, q) in ref_spectrum.iter_mut().zip(query_spectrum.iter()) {
        *r *= q.conj();
    }

    let mut corr = c2r.make_output_vec();
    c2r.process(&mut ref_spectrum, &mut corr).ok()?;

    // realfft's inverse is unscaled
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / size as f64;
    for value in &mut corr {
        *value *= scale;
    }
    Some(corr)
}

fn l2_norm(series: &[f64]) -> f64 {
    series.iter().map(|v| v * v).sum::<f64>().sqrt()
}
