//! Progress and cancellation callback contracts.
//!
//! The pipeline holds no cancellation token machinery: workers supply a
//! `should_cancel()` predicate that is read at explicit checkpoints, and a
//! progress callback that re-projects stage-local progress into the job's
//! global percent.

use std::sync::Arc;

use crate::domain::StageDetail;

/// Cancellation predicate checked at cooperative checkpoints.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Progress callback. Delivered in-order per job (single worker per job).
pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// One progress report.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
    /// Global percent in [0, 100].
    pub percent: u8,
    pub stage: String,
    pub message: String,
    pub detail: Option<StageDetail>,
}

impl ProgressUpdate {
    pub fn new(percent: u8, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            stage: stage.into(),
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: StageDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Predicate that never cancels.
#[must_use]
pub fn never_cancel() -> CancelCheck {
    Arc::new(|| false)
}

/// Callback that discards every update.
#[must_use]
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}
