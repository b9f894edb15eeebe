//! Boundary-span fallback estimator.
//!
//! When the FFT score is weak the overall spans still carry signal: the
//! scale is the ratio of the reference span to the query span (clamped),
//! the offset maps the query start onto the reference start, and the
//! confidence is derived from the residual boundary error.

use super::DriftEstimate;

/// Scale clamp bounds for the boundary estimate.
const SCALE_MIN: f64 = 0.90;
const SCALE_MAX: f64 = 1.10;

/// Estimate offset/scale from stream boundaries alone.
#[must_use]
pub fn estimate_offset_scale_boundary(
    reference_ranges: &[(f64, f64)],
    query_ranges: &[(f64, f64)],
) -> DriftEstimate {
    let reference: Vec<(f64, f64)> = reference_ranges
        .iter()
        .filter(|(s, e)| s.is_finite() && e.is_finite() && e > s)
        .map(|(s, e)| (s.max(0.0), e.max(0.0)))
        .collect();
    let query: Vec<(f64, f64)> = query_ranges
        .iter()
        .filter(|(s, e)| s.is_finite() && e.is_finite() && e > s)
        .map(|(s, e)| (s.max(0.0), e.max(0.0)))
        .collect();
    if reference.is_empty() || query.is_empty() {
        return DriftEstimate::not_ok("alass_fallback", "empty_input");
    }

    let ref_start = reference.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let ref_end = reference.iter().map(|r| r.1).fold(f64::NEG_INFINITY, f64::max);
    let query_start = query.iter().map(|r| r.0).fold(f64::INFINITY, f64::min);
    let query_end = query.iter().map(|r| r.1).fold(f64::NEG_INFINITY, f64::max);

    let query_span = (query_end - query_start).max(0.001);
    let ref_span = (ref_end - ref_start).max(0.001);
    let drift_scale = (ref_span / query_span).clamp(SCALE_MIN, SCALE_MAX);
    let offset_seconds = query_start.mul_add(-drift_scale, ref_start);

    // Residual boundary error backs a simple confidence in [0, 1].
    let mapped_end = query_end.mul_add(drift_scale, offset_seconds);
    let mapped_start = query_start.mul_add(drift_scale, offset_seconds);
    let err = (mapped_end - ref_end).abs() + (mapped_start - ref_start).abs();
    let score = (1.0 - err / 2.5).clamp(0.0, 1.0);

    DriftEstimate {
        ok: true,
        offset_seconds,
        drift_scale,
        score,
        method: "alass_fallback",
        reason: None,
    }
}
