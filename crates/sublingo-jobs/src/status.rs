//! Derived status read-model.
//!
//! `JobStatusView` is the stable JSON shape clients poll. It folds in the
//! live delta of the running stage, the recent progress events, the
//! monotonic revision for long-poll comparison, and remaps the internal
//! `llm_translate` stage to `translate_chunks` when the user selected the
//! dedicated translation model.

use std::collections::BTreeMap;

use serde::Serialize;

use sublingo_core::{
    EventLevel, JobRecord, JobStatus, PROGRESS_EVENT_RETURN_LIMIT, PipelineOutput, StageDetail,
    SyncDiagnostics, now_ms,
};

/// Stage label shown instead of `llm_translate` on the qwen-mt path.
pub const TRANSLATE_CHUNKS_STAGE: &str = "translate_chunks";

/// One serialized progress event.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEventView {
    pub at_ms: i64,
    pub stage: String,
    pub percent: u8,
    pub message: String,
    pub level: EventLevel,
}

/// The status payload served to pollers.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    pub updated_at_ms: i64,
    pub cancel_requested: bool,
    pub whisper_runtime: String,
    pub whisper_model_requested: String,
    pub whisper_model_effective: String,
    pub asr_provider_effective: String,
    pub asr_fallback_used: bool,
    /// Queued/running jobs created before this one.
    pub queue_ahead: usize,
    pub worker_alive: bool,
    pub stage_durations_ms: BTreeMap<String, u64>,
    pub stage_order: Vec<String>,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_detail: Option<StageDetail>,
    pub recent_progress_events: Vec<ProgressEventView>,
    pub status_revision: u64,
    pub poll_interval_ms_hint: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_diagnostics: Option<SyncDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<PipelineOutput>,
}

/// Remap an internal stage tag for display.
#[must_use]
pub fn map_stage_for_display(stage: &str, translation_model_requested: bool) -> String {
    if translation_model_requested && stage == sublingo_core::stage::LLM_TRANSLATE {
        TRANSLATE_CHUNKS_STAGE.to_string()
    } else {
        stage.to_string()
    }
}

/// Remap message wording for display on the qwen-mt path.
#[must_use]
pub fn map_message_for_display(message: &str, translation_model_requested: bool) -> String {
    if translation_model_requested {
        message.replace("LLM translation", "chunked translation")
    } else {
        message.to_string()
    }
}

/// Build the view from a record snapshot.
///
/// `queue_ahead` and `worker_alive` come from the manager, which holds the
/// registry lock while snapshotting.
#[must_use]
pub fn build_status_view(
    record: &JobRecord,
    queue_ahead: usize,
    worker_alive: bool,
    poll_interval_ms_hint: u64,
) -> JobStatusView {
    let translation_model = record.options.llm.is_translation_model();
    let current_stage = map_stage_for_display(&record.current_stage, translation_model);

    // Stage order, display-mapped, first occurrence wins
    let mut stage_order: Vec<String> = Vec::new();
    for raw_stage in &record.stage_order {
        let mapped = map_stage_for_display(raw_stage, translation_model);
        if !stage_order.contains(&mapped) {
            stage_order.push(mapped);
        }
    }
    if !stage_order.contains(&current_stage) {
        stage_order.push(current_stage.clone());
    }

    // Durations fold under the mapped labels, plus the running stage's
    // live delta
    let mut stage_durations_ms: BTreeMap<String, u64> = BTreeMap::new();
    for (raw_stage, duration) in &record.stage_durations_ms {
        let mapped = map_stage_for_display(raw_stage, translation_model);
        *stage_durations_ms.entry(mapped).or_insert(0) += duration;
    }
    for stage in &stage_order {
        stage_durations_ms.entry(stage.clone()).or_insert(0);
    }
    if record.status.is_active() {
        if let Some(started) = record.stage_started_at_ms {
            let live = u64::try_from((now_ms() - started).max(0)).unwrap_or(0);
            if live > 0 {
                *stage_durations_ms.entry(current_stage.clone()).or_insert(0) += live;
            }
        }
    }

    let completed_at = record.completed_at_ms.unwrap_or_else(now_ms);
    let total_duration_ms = u64::try_from((completed_at - record.created_at_ms).max(0)).unwrap_or(0);

    let stage_detail = record.stage_detail.as_ref().map(|detail| {
        let mut mapped = detail.clone();
        mapped.stage = map_stage_for_display(&mapped.stage, translation_model);
        if translation_model && mapped.step_key == "llm_translate" {
            mapped.step_key = TRANSLATE_CHUNKS_STAGE.to_string();
        }
        mapped.step_label = map_message_for_display(&mapped.step_label, translation_model);
        mapped
    });

    let recent_progress_events: Vec<ProgressEventView> = record
        .recent_progress_events
        .iter()
        .rev()
        .take(PROGRESS_EVENT_RETURN_LIMIT)
        .rev()
        .map(|event| ProgressEventView {
            at_ms: event.at_ms,
            stage: map_stage_for_display(&event.stage, translation_model),
            percent: event.percent,
            message: map_message_for_display(&event.message, translation_model),
            level: event.level,
        })
        .collect();

    let partial_result = if record.status == JobStatus::Failed {
        record.partial_result.clone()
    } else {
        None
    };

    JobStatusView {
        job_id: record.job_id.clone(),
        status: record.status,
        progress_percent: record.progress_percent,
        current_stage,
        message: map_message_for_display(&record.message, translation_model),
        error: record.error.clone(),
        error_code: record.error_code.clone(),
        error_detail: record.error_detail.clone(),
        started_at_ms: record.started_at_ms,
        updated_at_ms: record.updated_at_ms,
        cancel_requested: record.cancel_requested,
        whisper_runtime: record.whisper_runtime.clone(),
        whisper_model_requested: record.whisper_model_requested.clone(),
        whisper_model_effective: record.whisper_model_effective.clone(),
        asr_provider_effective: record.asr_provider_effective.clone(),
        asr_fallback_used: record.asr_fallback_used,
        queue_ahead,
        worker_alive,
        stage_durations_ms,
        stage_order,
        total_duration_ms,
        stage_detail,
        recent_progress_events,
        status_revision: record.status_revision,
        poll_interval_ms_hint,
        sync_diagnostics: record.sync_diagnostics.clone(),
        partial_result,
    }
}
