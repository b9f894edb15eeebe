//! Stage progress band mapping.
//!
//! Each stage owns a global percent band; stage-local `(done, total)`
//! counters are re-projected into it so observers see one monotone
//! percentage across the whole run.

use sublingo_core::{ProgressFn, ProgressUpdate, StageDetail, now_ms};

/// A stage's slice of the global percent range.
#[derive(Clone, Copy, Debug)]
pub struct StageBand {
    pub start: u8,
    pub end: u8,
}

impl StageBand {
    #[must_use]
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Project a stage-local percent into this band.
    #[must_use]
    pub fn project(self, percent_in_stage: u8) -> u8 {
        let span = f64::from(self.end.saturating_sub(self.start));
        let fraction = f64::from(percent_in_stage.min(100)) / 100.0;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mapped = self.start + (span * fraction).round() as u8;
        mapped.min(self.end)
    }
}

/// Emit a simple stage-level progress update.
pub fn emit(progress: &ProgressFn, percent: u8, stage: &str, message: &str) {
    progress(ProgressUpdate::new(percent, stage, message));
}

/// Emit a step-detail update projected into the stage's band.
///
/// `done/total` drive both the in-band percent and an ETA derived from the
/// elapsed time per completed unit.
#[allow(clippy::too_many_arguments)]
pub fn emit_step(
    progress: &ProgressFn,
    band: StageBand,
    stage: &str,
    step_key: &str,
    step_label: &str,
    message: &str,
    done: u64,
    total: u64,
    unit: &str,
    started_at_ms: i64,
) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let percent_in_stage = ((done as f64 / total.max(1) as f64) * 100.0).round() as u8;
    let percent = band.project(percent_in_stage);

    let eta_seconds = if done > 0 && done < total {
        let elapsed_ms = (now_ms() - started_at_ms).max(0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let eta = ((elapsed_ms as f64 / done as f64) * (total - done) as f64 / 1000.0).round() as u64;
        Some(eta)
    } else {
        None
    };

    let detail = StageDetail {
        stage: stage.to_string(),
        step_key: step_key.to_string(),
        step_label: step_label.to_string(),
        done: Some(done),
        total: Some(total),
        unit: Some(unit.to_string()),
        percent_in_stage: Some(percent_in_stage.min(100)),
        eta_seconds,
        updated_at_ms: now_ms(),
    };
    progress(ProgressUpdate::new(percent, stage, message).with_detail(detail));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn band_projection() {
        let band = StageBand::new(72, 90);
        assert_eq!(band.project(0), 72);
        assert_eq!(band.project(50), 81);
        assert_eq!(band.project(100), 90);
        assert_eq!(band.project(200), 90);
    }

    #[test]
    fn emit_step_builds_detail() {
        let seen: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |update| sink.lock().unwrap().push(update));

        emit_step(
            &progress,
            StageBand::new(30, 42),
            "asr",
            "asr_rows",
            "speech recognition",
            "running",
            5,
            10,
            "row",
            now_ms() - 2_000,
        );

        let updates = seen.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.stage, "asr");
        assert_eq!(update.percent, 36);
        let detail = update.detail.as_ref().unwrap();
        assert_eq!(detail.done, Some(5));
        assert_eq!(detail.total, Some(10));
        assert_eq!(detail.percent_in_stage, Some(50));
        assert!(detail.eta_seconds.is_some());
    }
}
