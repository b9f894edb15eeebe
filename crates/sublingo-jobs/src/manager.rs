//! The job manager.
//!
//! Owns the in-memory registry, the FIFO queue, and N worker tasks. All
//! state transitions happen under a single registry lock; pipeline I/O
//! runs outside it and reports back through callbacks that re-acquire the
//! lock only to mutate the record. Every externally visible mutation is
//! persisted as one JSON blob through a dedicated persister task.
//!
//! # Concurrency Model
//!
//! - Worker count = `global_concurrency_limit`; workers never share a job
//! - A worker may start a job only while both the global and the per-user
//!   running counters are below their caps; otherwise the job re-enqueues
//!   and the worker backs off ~200 ms
//! - Cancellation is a flag observed at pipeline checkpoints
//! - Startup rewrites any persisted `queued`/`running` row to
//!   `failed(service_restarted)`; prior work is never assumed resumable

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use sublingo_core::{
    CancelCheck, ErrorCode, EventLevel, JobKind, JobRecord, JobStatus, JobStorePort,
    PipelineError, PipelineOptions, PipelineOutput, ProgressEvent, ProgressFn, ProgressUpdate,
    Sentence, ServiceSettings, SourceMode, StageDetail, StageResult, StoredJobRow, UsageRecord,
    UsageSinkPort, WordSegment, new_job_id, now_ms, safe_remove_tree, stage,
};
use sublingo_ingest::normalize_source_url;

use crate::executor::{JobExecutionInput, JobExecutionOutput, JobExecutorPort};
use crate::partial::{build_partial_from_sentences, build_partial_from_work_dir};
use crate::status::{JobStatusView, build_status_view};

/// Back-off while a dequeued job cannot start under the concurrency caps.
const CAP_RETRY_SLEEP: Duration = Duration::from_millis(200);

/// Idle worker wake-up interval (also drives the retention sweep).
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Admission check result.
#[derive(Clone, Debug, Serialize)]
pub struct CapacityCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CapacityLimit>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_job_status: Option<JobStatus>,
    pub active_count: usize,
    pub user_active_count: usize,
}

/// Which cap rejected the submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityLimit {
    UserConcurrencyLimit,
    GlobalConcurrencyLimit,
}

/// What a cancellation request did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Running job: flag set, worker finalizes at the next checkpoint.
    CancelRequested,
    /// Queued job: cancelled synchronously.
    Cancelled,
    /// Terminal job: row and work dir purged.
    Purged,
}

enum PersistOp {
    Upsert(StoredJobRow),
    Delete(String),
}

struct ManagerState {
    jobs: HashMap<String, JobRecord>,
    queue: VecDeque<String>,
    active_total: usize,
    active_by_user: HashMap<String, usize>,
}

struct ManagerInner {
    settings: ServiceSettings,
    executor: Arc<dyn JobExecutorPort>,
    usage_sink: Arc<dyn UsageSinkPort>,
    state: Mutex<ManagerState>,
    queue_notify: Notify,
    persist_tx: mpsc::UnboundedSender<PersistOp>,
    shutdown: CancellationToken,
}

/// Handle to the running manager. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

enum Claim {
    /// Queue empty; wait for work.
    Idle,
    /// Dequeued entry was stale; try again immediately.
    Skip,
    /// Caps exhausted; the job was re-enqueued, back off.
    Busy,
    /// Job claimed and marked running.
    Started {
        input: JobExecutionInput,
        user_id: String,
    },
}

impl JobManager {
    /// Load persisted jobs, recover stale rows, and start the workers.
    pub async fn start(
        settings: ServiceSettings,
        store: Arc<dyn JobStorePort>,
        executor: Arc<dyn JobExecutorPort>,
        usage_sink: Arc<dyn UsageSinkPort>,
    ) -> Result<Self, sublingo_core::StoreError> {
        let mut jobs: HashMap<String, JobRecord> = HashMap::new();
        for row in store.load_all().await? {
            let Ok(mut record) = serde_json::from_str::<JobRecord>(&row.payload_json) else {
                tracing::warn!(
                    target: "sublingo.jobs",
                    job_id = %row.job_id,
                    "dropping undecodable persisted job row"
                );
                continue;
            };
            if record.status.is_active() {
                // In-flight work is never resumed across restarts
                let now = now_ms();
                record.status = JobStatus::Failed;
                record.error_code = ErrorCode::ServiceRestarted.as_str().to_string();
                record.error = Some("the service restarted while this job was in flight".into());
                record.message =
                    "the service restarted while this job was in flight, please resubmit".into();
                record.progress_percent = 100;
                record.cancel_requested = false;
                record.completed_at_ms = Some(now);
                record.updated_at_ms = now;
                record.close_active_stage(now);
                record.bump_revision();
                store.upsert(&to_row(&record)).await?;
                tracing::info!(
                    target: "sublingo.jobs",
                    job_id = %record.job_id,
                    "recovered stale job as failed(service_restarted)"
                );
            }
            jobs.insert(record.job_id.clone(), record);
        }

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        spawn_persister(Arc::clone(&store), persist_rx, shutdown.clone());

        let worker_count = settings.global_concurrency_limit.max(1);
        let inner = Arc::new(ManagerInner {
            settings,
            executor,
            usage_sink,
            state: Mutex::new(ManagerState {
                jobs,
                queue: VecDeque::new(),
                active_total: 0,
                active_by_user: HashMap::new(),
            }),
            queue_notify: Notify::new(),
            persist_tx,
            shutdown,
        });

        for worker_index in 0..worker_count {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                worker_loop(inner, worker_index).await;
            });
        }

        Ok(Self { inner })
    }

    /// Stop the workers and the persister. In-flight jobs abort at their
    /// next checkpoint on restart recovery.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    // -- submission ----------------------------------------------------------

    /// Submit a job over an uploaded artifact.
    pub fn submit_file_job(
        &self,
        user_id: &str,
        video_path: PathBuf,
        work_dir: PathBuf,
        options: PipelineOptions,
    ) -> StageResult<String> {
        options.whisper.validate_local_model()?;
        let record = self.base_record(
            user_id,
            JobKind::Full,
            SourceMode::File,
            work_dir,
            options,
            |record| record.video_path = video_path,
        );
        Ok(self.register_and_enqueue(record))
    }

    /// Submit a job over a remote URL. The URL is validated and
    /// normalized here; the download happens on the worker.
    pub fn submit_url_job(
        &self,
        user_id: &str,
        source_url: &str,
        work_dir: PathBuf,
        options: PipelineOptions,
    ) -> StageResult<String> {
        options.whisper.validate_local_model()?;
        let normalized = normalize_source_url(source_url)?;
        let record = self.base_record(
            user_id,
            JobKind::Url,
            SourceMode::Url,
            work_dir,
            options,
            |record| record.source_url = normalized,
        );
        Ok(self.register_and_enqueue(record))
    }

    /// Submit a translate/align resume over previously produced sentences.
    pub fn submit_resume_job(
        &self,
        user_id: &str,
        sentences: Vec<Sentence>,
        word_segments: Vec<WordSegment>,
        work_dir: PathBuf,
        options: PipelineOptions,
    ) -> StageResult<String> {
        let record = self.base_record(
            user_id,
            JobKind::Resume,
            SourceMode::Resume,
            work_dir,
            options,
            |record| {
                record.resume_sentences = sentences;
                record.resume_word_segments = word_segments;
            },
        );
        Ok(self.register_and_enqueue(record))
    }

    fn base_record(
        &self,
        user_id: &str,
        kind: JobKind,
        source_mode: SourceMode,
        work_dir: PathBuf,
        options: PipelineOptions,
        customize: impl FnOnce(&mut JobRecord),
    ) -> JobRecord {
        let now = now_ms();
        let mut record = JobRecord {
            job_id: new_job_id(),
            user_id: normalize_user_id(user_id),
            kind,
            source_mode,
            work_dir,
            options,
            status: JobStatus::Queued,
            message: "job queued".into(),
            created_at_ms: now,
            updated_at_ms: now,
            whisper_model_requested: String::new(),
            ..JobRecord::default()
        };
        record.whisper_model_requested = record.options.whisper.model.trim().to_string();
        record.whisper_runtime = record.options.whisper.runtime.as_str().to_string();
        record.transition_stage(stage::QUEUED, now);
        record.bump_revision();
        customize(&mut record);
        record
    }

    fn register_and_enqueue(&self, record: JobRecord) -> String {
        let job_id = record.job_id.clone();
        {
            let mut state = self.lock_state();
            self.persist(&record);
            state.jobs.insert(job_id.clone(), record);
            state.queue.push_back(job_id.clone());
        }
        self.inner.queue_notify.notify_one();
        tracing::info!(target: "sublingo.jobs", job_id = %job_id, "job submitted");
        job_id
    }

    // -- reads ---------------------------------------------------------------

    /// Admission precheck: per-user cap first, then the global cap.
    pub fn check_submit_capacity(&self, user_id: &str) -> CapacityCheck {
        let user_id = normalize_user_id(user_id);
        let mut state = self.lock_state();
        cleanup_expired_locked(&self.inner, &mut state);

        let active: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.status.is_active())
            .collect();
        let user_active: Vec<&JobRecord> = active
            .iter()
            .copied()
            .filter(|job| job.user_id == user_id)
            .collect();

        if user_active.len() >= self.inner.settings.per_user_concurrency_limit {
            let latest = user_active
                .iter()
                .max_by_key(|job| (job.created_at_ms, &job.job_id))
                .map(|job| (job.job_id.clone(), job.status));
            return CapacityCheck {
                ok: false,
                code: Some(CapacityLimit::UserConcurrencyLimit),
                message: format!(
                    "at most {} active job(s) per user",
                    self.inner.settings.per_user_concurrency_limit
                ),
                active_job_id: latest.as_ref().map(|(id, _)| id.clone()),
                active_job_status: latest.map(|(_, status)| status),
                active_count: active.len(),
                user_active_count: user_active.len(),
            };
        }

        if active.len() >= self.inner.settings.global_concurrency_limit {
            return CapacityCheck {
                ok: false,
                code: Some(CapacityLimit::GlobalConcurrencyLimit),
                message: format!(
                    "global job capacity reached ({})",
                    self.inner.settings.global_concurrency_limit
                ),
                active_job_id: None,
                active_job_status: None,
                active_count: active.len(),
                user_active_count: user_active.len(),
            };
        }

        CapacityCheck {
            ok: true,
            code: None,
            message: String::new(),
            active_job_id: None,
            active_job_status: None,
            active_count: active.len(),
            user_active_count: user_active.len(),
        }
    }

    /// Status read model. Owner-scoped when `user_id` is supplied. Lazily
    /// attaches a salvaged partial result to already-failed jobs.
    pub async fn get_status(&self, job_id: &str, user_id: Option<&str>) -> Option<JobStatusView> {
        let snapshot = {
            let mut state = self.lock_state();
            cleanup_expired_locked(&self.inner, &mut state);
            let record = state.jobs.get(job_id)?;
            if !owner_matches(record, user_id) {
                return None;
            }
            record.clone()
        };

        let snapshot = if snapshot.status == JobStatus::Failed && snapshot.partial_result.is_none()
        {
            self.attach_lazy_partial(snapshot).await
        } else {
            snapshot
        };

        let (queue_ahead, worker_alive) = {
            let state = self.lock_state();
            (queue_ahead_locked(&state, &snapshot), !self.inner.shutdown.is_cancelled())
        };
        Some(build_status_view(
            &snapshot,
            queue_ahead,
            worker_alive,
            self.inner.settings.poll_interval_ms_hint,
        ))
    }

    /// Most recent queued/running job, optionally scoped to one user.
    pub fn find_active_job(&self, user_id: Option<&str>) -> Option<JobStatusView> {
        let state = self.lock_state();
        let record = state
            .jobs
            .values()
            .filter(|job| job.status.is_active())
            .filter(|job| owner_matches(job, user_id))
            .max_by_key(|job| (job.created_at_ms, job.job_id.clone()))?;
        Some(build_status_view(
            record,
            queue_ahead_locked(&state, record),
            !self.inner.shutdown.is_cancelled(),
            self.inner.settings.poll_interval_ms_hint,
        ))
    }

    /// Exactly-once result delivery from the consumer's perspective.
    ///
    /// Non-URL work dirs are removed on consumption; URL work dirs stay
    /// until the retention sweep so the downloaded video stays fetchable.
    pub fn consume_result(&self, job_id: &str, user_id: Option<&str>) -> Option<PipelineOutput> {
        let (payload, work_dir_to_remove) = {
            let mut state = self.lock_state();
            let record = state.jobs.get_mut(job_id)?;
            if !owner_matches(record, user_id)
                || record.status != JobStatus::Completed
                || record.result_consumed
            {
                return None;
            }
            let payload = record.result.clone()?;
            record.result_consumed = true;
            record.updated_at_ms = now_ms();
            self.persist(record);
            let work_dir = (record.source_mode != SourceMode::Url)
                .then(|| record.work_dir.clone());
            (payload, work_dir)
        };
        if let Some(work_dir) = work_dir_to_remove {
            safe_remove_tree(&work_dir);
        }
        Some(payload)
    }

    // -- cancellation --------------------------------------------------------

    /// Cancel (or purge) a job. See [`CancelOutcome`].
    pub fn cancel_job(&self, job_id: &str, user_id: Option<&str>) -> Option<CancelOutcome> {
        let mut state = self.lock_state();
        let record = state.jobs.get_mut(job_id)?;
        if !owner_matches(record, user_id) {
            return None;
        }
        let now = now_ms();
        match record.status {
            JobStatus::Running => {
                record.cancel_requested = true;
                record.transition_stage(stage::CANCELLING, now);
                record.message = "cancelling, waiting for the current step to finish".into();
                record.updated_at_ms = now;
                set_stage_detail(record, stage::CANCELLING, "cancelling", "cancelling", now);
                append_event(
                    record,
                    stage::CANCELLING,
                    record.progress_percent,
                    "cancelling, waiting for the current step to finish",
                    EventLevel::Warning,
                    now,
                );
                record.bump_revision();
                self.persist(record);
                Some(CancelOutcome::CancelRequested)
            }
            JobStatus::Queued => {
                record.status = JobStatus::Cancelled;
                record.cancel_requested = false;
                record.error_code = ErrorCode::CancelRequested.as_str().to_string();
                record.transition_stage(stage::CANCELLED, now);
                record.message = "job cancelled".into();
                record.completed_at_ms = Some(now);
                record.updated_at_ms = now;
                set_stage_detail(record, stage::CANCELLED, "cancelled", "job cancelled", now);
                append_event(
                    record,
                    stage::CANCELLED,
                    record.progress_percent,
                    "job cancelled",
                    EventLevel::Warning,
                    now,
                );
                record.bump_revision();
                record.close_active_stage(now);
                self.persist(record);
                let job_id = record.job_id.clone();
                state.queue.retain(|queued| queued != &job_id);
                Some(CancelOutcome::Cancelled)
            }
            _ => {
                let work_dir = record.work_dir.clone();
                let job_id = record.job_id.clone();
                state.jobs.remove(&job_id);
                let _ = self.inner.persist_tx.send(PersistOp::Delete(job_id));
                safe_remove_tree(&work_dir);
                Some(CancelOutcome::Purged)
            }
        }
    }

    // -- internals -----------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.inner.state.lock().expect("job registry lock")
    }

    fn persist(&self, record: &JobRecord) {
        let _ = self.inner.persist_tx.send(PersistOp::Upsert(to_row(record)));
    }

    async fn attach_lazy_partial(&self, snapshot: JobRecord) -> JobRecord {
        let partial = match snapshot.kind {
            JobKind::Resume => build_partial_from_sentences(
                &snapshot.resume_sentences,
                &snapshot.resume_word_segments,
            ),
            _ => build_partial_from_work_dir(&snapshot.work_dir).await,
        };
        let Some(partial) = partial else {
            return snapshot;
        };
        let partial = partial.into_partial(
            snapshot.current_stage.clone(),
            snapshot
                .error
                .clone()
                .unwrap_or_else(|| snapshot.message.clone()),
        );

        let mut state = self.lock_state();
        if let Some(record) = state.jobs.get_mut(&snapshot.job_id) {
            if record.status == JobStatus::Failed && record.partial_result.is_none() {
                record.partial_result = Some(partial);
                self.persist(record);
                tracing::debug!(
                    target: "sublingo.jobs",
                    job_id = %record.job_id,
                    "lazily attached partial result to failed job"
                );
            }
            return record.clone();
        }
        snapshot
    }

}

/// Retention sweep: terminal jobs past their window lose their row and
/// work dir.
fn cleanup_expired_locked(inner: &ManagerInner, state: &mut ManagerState) {
    let now = now_ms();
    let terminal_cutoff = now
        - i64::try_from(inner.settings.retention.terminal_days * 86_400_000).unwrap_or(i64::MAX);
    let consumed_cutoff =
        now - i64::try_from(inner.settings.retention.consumed_minutes * 60_000).unwrap_or(i64::MAX);

    let expired: Vec<String> = state
        .jobs
        .values()
        .filter(|job| {
            let finished_at = job.completed_at_ms.unwrap_or(job.updated_at_ms);
            let stale_terminal = matches!(job.status, JobStatus::Failed | JobStatus::Cancelled)
                && finished_at < terminal_cutoff;
            let stale_consumed = job.result_consumed && job.updated_at_ms < consumed_cutoff;
            stale_terminal || stale_consumed
        })
        .map(|job| job.job_id.clone())
        .collect();

    for job_id in expired {
        if let Some(record) = state.jobs.remove(&job_id) {
            safe_remove_tree(&record.work_dir);
            let _ = inner.persist_tx.send(PersistOp::Delete(job_id.clone()));
            tracing::debug!(target: "sublingo.jobs", job_id = %job_id, "expired job swept");
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn worker_loop(inner: Arc<ManagerInner>, worker_index: usize) {
    tracing::debug!(target: "sublingo.jobs", worker = worker_index, "worker started");
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match claim_next(&inner) {
            Claim::Idle => {
                tokio::select! {
                    () = inner.queue_notify.notified() => {}
                    () = tokio::time::sleep(IDLE_POLL) => {}
                    () = inner.shutdown.cancelled() => break,
                }
            }
            Claim::Skip => {}
            Claim::Busy => tokio::time::sleep(CAP_RETRY_SLEEP).await,
            Claim::Started { input, user_id } => {
                let job_id = input.job_id.clone();
                let progress = progress_callback(&inner, &job_id);
                let cancel = cancel_predicate(&inner, &job_id);
                let result = inner.executor.execute(input, progress, cancel).await;
                finalize_job(&inner, &job_id, &user_id, result).await;
                inner.queue_notify.notify_one();
            }
        }
    }
    tracing::debug!(target: "sublingo.jobs", worker = worker_index, "worker stopped");
}

fn claim_next(inner: &Arc<ManagerInner>) -> Claim {
    let mut state = inner.state.lock().expect("job registry lock");
    let Some(job_id) = state.queue.pop_front() else {
        return Claim::Idle;
    };
    let Some(record) = state.jobs.get(&job_id) else {
        return Claim::Skip;
    };
    if record.status != JobStatus::Queued || record.cancel_requested {
        return Claim::Skip;
    }

    let user_id = record.user_id.clone();
    let user_active = state.active_by_user.get(&user_id).copied().unwrap_or(0);
    let can_start = state.active_total < inner.settings.global_concurrency_limit
        && user_active < inner.settings.per_user_concurrency_limit;
    if !can_start {
        state.queue.push_back(job_id);
        return Claim::Busy;
    }

    state.active_total += 1;
    *state.active_by_user.entry(user_id.clone()).or_insert(0) += 1;

    let record = state.jobs.get_mut(&job_id).expect("record present");
    let now = now_ms();
    record.status = JobStatus::Running;
    record.transition_stage(stage::RUNNING, now);
    record.message = "job started".into();
    record.error = None;
    record.error_code = String::new();
    record.error_detail = None;
    record.sync_diagnostics = None;
    record.partial_result = None;
    record.result = None;
    record.result_consumed = false;
    record.started_at_ms = Some(now);
    record.updated_at_ms = now;
    set_stage_detail(record, stage::RUNNING, "running", "job started", now);
    append_event(record, stage::RUNNING, record.progress_percent, "job started", EventLevel::Info, now);
    record.bump_revision();
    let _ = inner.persist_tx.send(PersistOp::Upsert(to_row(record)));
    let _ = std::fs::create_dir_all(&record.work_dir);

    Claim::Started {
        input: JobExecutionInput {
            job_id: record.job_id.clone(),
            kind: record.kind,
            work_dir: record.work_dir.clone(),
            video_path: record.video_path.clone(),
            source_url: record.source_url.clone(),
            options: record.options.clone(),
            resume_sentences: record.resume_sentences.clone(),
            resume_word_segments: record.resume_word_segments.clone(),
        },
        user_id,
    }
}

fn progress_callback(inner: &Arc<ManagerInner>, job_id: &str) -> ProgressFn {
    let inner = Arc::clone(inner);
    let job_id = job_id.to_string();
    Arc::new(move |update: ProgressUpdate| {
        let mut state = inner.state.lock().expect("job registry lock");
        let Some(record) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if record.status == JobStatus::Cancelled || record.cancel_requested {
            return;
        }
        let now = now_ms();
        record.transition_stage(&update.stage, now);
        // Monotone except across re-submissions, which are new jobs
        record.progress_percent = record.progress_percent.max(update.percent.min(100));
        record.message = update.message.clone();
        record.updated_at_ms = now;
        if let Some(detail) = &update.detail {
            let mut detail = detail.clone();
            detail.stage = update.stage.clone();
            detail.updated_at_ms = now;
            record.stage_detail = Some(detail);
        } else {
            set_stage_detail(record, &update.stage, &update.stage, &update.message, now);
        }
        append_event(
            record,
            &update.stage,
            record.progress_percent,
            &update.message,
            EventLevel::Info,
            now,
        );
        record.bump_revision();
        let _ = inner.persist_tx.send(PersistOp::Upsert(to_row(record)));
    })
}

fn cancel_predicate(inner: &Arc<ManagerInner>, job_id: &str) -> CancelCheck {
    let inner = Arc::clone(inner);
    let job_id = job_id.to_string();
    Arc::new(move || {
        let state = inner.state.lock().expect("job registry lock");
        state.jobs.get(&job_id).is_none_or(|record| {
            record.cancel_requested || record.status == JobStatus::Cancelled
        })
    })
}

async fn finalize_job(
    inner: &Arc<ManagerInner>,
    job_id: &str,
    user_id: &str,
    result: StageResult<JobExecutionOutput>,
) {
    // Salvage needs disk reads, so snapshot what it needs before locking
    let salvage_snapshot = {
        let state = inner.state.lock().expect("job registry lock");
        state.jobs.get(job_id).map(|record| {
            (
                record.kind,
                record.work_dir.clone(),
                record.resume_sentences.clone(),
                record.resume_word_segments.clone(),
            )
        })
    };

    let salvaged = match (&result, &salvage_snapshot) {
        (Err(error), Some((kind, work_dir, sentences, words))) if !error.is_cancel() => {
            match kind {
                JobKind::Resume => build_partial_from_sentences(sentences, words),
                _ => build_partial_from_work_dir(work_dir).await,
            }
        }
        _ => None,
    };

    let sink_records = {
        let mut state = inner.state.lock().expect("job registry lock");
        let mut sink_records: Vec<UsageRecord> = Vec::new();
        if let Some(record) = state.jobs.get_mut(job_id) {
            let now = now_ms();
            match result {
                _ if record.cancel_requested || record.status == JobStatus::Cancelled => {
                    finalize_cancelled(record, now);
                }
                Err(error) if error.is_cancel() => {
                    finalize_cancelled(record, now);
                }
                Ok(execution) => {
                    finalize_completed(record, execution, now);
                    sink_records = usage_records_for(record);
                }
                Err(error) if error.code == ErrorCode::LlmInvalidJson && salvaged.is_some() => {
                    let partial = salvaged
                        .expect("salvaged checked above")
                        .into_partial(error.stage.clone(), error.message.clone());
                    finalize_completed_with_partial(record, partial, &error, now);
                }
                Err(error) => {
                    finalize_failed(record, &error, salvaged, now);
                }
            }
            let _ = inner.persist_tx.send(PersistOp::Upsert(to_row(record)));
        }

        state.active_total = state.active_total.saturating_sub(1);
        if let Some(count) = state.active_by_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active_by_user.remove(user_id);
            }
        }
        sink_records
    };

    for record in sink_records {
        inner.usage_sink.append(&record).await;
    }

    // Sweep opportunistically after each job
    let mut state = inner.state.lock().expect("job registry lock");
    cleanup_expired_locked(inner, &mut state);
}

fn finalize_cancelled(record: &mut JobRecord, now: i64) {
    record.status = JobStatus::Cancelled;
    record.transition_stage(stage::CANCELLED, now);
    record.message = "job cancelled".into();
    record.error = None;
    record.error_code = ErrorCode::CancelRequested.as_str().to_string();
    record.error_detail = None;
    record.sync_diagnostics = None;
    record.progress_percent = 100;
    record.completed_at_ms = Some(now);
    record.updated_at_ms = now;
    set_stage_detail(record, stage::CANCELLED, "cancelled", "job cancelled", now);
    append_event(record, stage::CANCELLED, 100, "job cancelled", EventLevel::Warning, now);
    record.bump_revision();
    record.close_active_stage(now);
    tracing::info!(target: "sublingo.jobs", job_id = %record.job_id, "job cancelled");
}

fn finalize_completed(record: &mut JobRecord, execution: JobExecutionOutput, now: i64) {
    let stats = &execution.output.stats;
    if !stats.whisper_runtime.is_empty() {
        record.whisper_runtime = stats.whisper_runtime.clone();
    }
    if !stats.whisper_model_effective.is_empty() {
        record.whisper_model_effective = stats.whisper_model_effective.clone();
    }
    if !stats.asr_provider_effective.is_empty() {
        record.asr_provider_effective = stats.asr_provider_effective.clone();
    }
    record.asr_fallback_used = stats.asr_fallback_used;
    if let Some(video) = execution.downloaded_video {
        record.video_path = video;
    }

    record.status = JobStatus::Completed;
    record.progress_percent = 100;
    record.transition_stage(stage::COMPLETED, now);
    record.message = "job completed".into();
    record.error = None;
    record.error_code = String::new();
    record.error_detail = None;
    record.sync_diagnostics = Some(execution.output.diagnostics.clone());
    record.result = Some(execution.output);
    record.partial_result = None;
    record.completed_at_ms = Some(now);
    record.updated_at_ms = now;
    set_stage_detail(record, stage::COMPLETED, "completed", "job completed", now);
    append_event(record, stage::COMPLETED, 100, "job completed", EventLevel::Success, now);
    record.bump_revision();
    record.close_active_stage(now);
    tracing::info!(target: "sublingo.jobs", job_id = %record.job_id, "job completed");
}

fn finalize_completed_with_partial(
    record: &mut JobRecord,
    partial: PipelineOutput,
    error: &PipelineError,
    now: i64,
) {
    record.status = JobStatus::Completed;
    record.progress_percent = 100;
    record.transition_stage(stage::COMPLETED, now);
    record.message = "job completed (LLM output invalid, base subtitles kept)".into();
    record.error = None;
    record.error_code = error.code.as_str().to_string();
    record.error_detail = serde_json::to_value(error).ok();
    record.sync_diagnostics = Some(partial.diagnostics.clone());
    record.result = Some(partial);
    record.partial_result = None;
    record.completed_at_ms = Some(now);
    record.updated_at_ms = now;
    set_stage_detail(
        record,
        stage::COMPLETED,
        "completed_with_partial",
        "job completed (base subtitles kept)",
        now,
    );
    append_event(
        record,
        stage::COMPLETED,
        100,
        "job completed (LLM output invalid, base subtitles kept)",
        EventLevel::Warning,
        now,
    );
    record.bump_revision();
    record.close_active_stage(now);
    tracing::info!(
        target: "sublingo.jobs",
        job_id = %record.job_id,
        "job completed with partial result after llm_invalid_json"
    );
}

fn finalize_failed(
    record: &mut JobRecord,
    error: &PipelineError,
    salvaged: Option<PipelineOutput>,
    now: i64,
) {
    record.status = JobStatus::Failed;
    record.transition_stage(&error.stage, now);
    record.message = error.message.clone();
    record.error = Some(error.message.clone());
    record.error_code = error.code.as_str().to_string();
    record.error_detail = serde_json::to_value(error).ok();
    match salvaged {
        Some(partial) => {
            record.sync_diagnostics = Some(partial.diagnostics.clone());
            record.partial_result =
                Some(partial.into_partial(error.stage.clone(), error.message.clone()));
        }
        None => {
            record.sync_diagnostics = None;
            record.partial_result = None;
        }
    }
    record.progress_percent = 100;
    record.completed_at_ms = Some(now);
    record.updated_at_ms = now;
    set_stage_detail(record, &error.stage, "failed", &error.message, now);
    append_event(
        record,
        &error.stage,
        record.progress_percent,
        &error.message,
        EventLevel::Error,
        now,
    );
    record.bump_revision();
    record.close_active_stage(now);
    tracing::warn!(
        target: "sublingo.jobs",
        job_id = %record.job_id,
        code = error.code.as_str(),
        "job failed"
    );
}

/// Metered usage records forwarded on successful completion.
fn usage_records_for(record: &JobRecord) -> Vec<UsageRecord> {
    let Some(result) = &record.result else {
        return Vec::new();
    };
    let stats = &result.stats;
    let now = now_ms();
    let mut records = vec![
        UsageRecord {
            scene: "subtitle_asr".into(),
            owner_id: record.job_id.clone(),
            provider_effective: stats.asr_provider_effective.clone(),
            model_effective: stats.whisper_model_effective.clone(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            provider_request_id: String::new(),
            timestamp_ms: now,
        },
        UsageRecord {
            scene: "subtitle_pipeline".into(),
            owner_id: record.job_id.clone(),
            provider_effective: stats.llm_provider_effective.clone(),
            model_effective: stats.llm_model_effective.clone(),
            prompt_tokens: stats.prompt_tokens,
            completion_tokens: stats.completion_tokens,
            total_tokens: stats.total_tokens,
            provider_request_id: stats.provider_request_id.clone(),
            timestamp_ms: now,
        },
    ];
    if stats.translation.mode_effective == "translation_model" {
        records.push(UsageRecord {
            scene: "subtitle_translation".into(),
            owner_id: record.job_id.clone(),
            provider_effective: stats.translation.provider_effective.clone(),
            model_effective: stats.translation.model_effective.clone(),
            prompt_tokens: stats.translation.prompt_tokens,
            completion_tokens: stats.translation.completion_tokens,
            total_tokens: stats.translation.total_tokens,
            provider_request_id: String::new(),
            timestamp_ms: now,
        });
    }
    records
}

// =============================================================================
// Helpers
// =============================================================================

fn spawn_persister(
    store: Arc<dyn JobStorePort>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let op = tokio::select! {
                op = rx.recv() => op,
                () = shutdown.cancelled() => None,
            };
            let Some(op) = op else { break };
            let result = match &op {
                PersistOp::Upsert(row) => store.upsert(row).await,
                PersistOp::Delete(job_id) => store.delete(job_id).await,
            };
            if let Err(error) = result {
                tracing::warn!(
                    target: "sublingo.jobs",
                    error = %error,
                    "job persistence operation failed"
                );
            }
        }
    });
}

fn to_row(record: &JobRecord) -> StoredJobRow {
    StoredJobRow {
        job_id: record.job_id.clone(),
        user_id: record.user_id.clone(),
        payload_json: serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string()),
        created_at_ms: record.created_at_ms,
        updated_at_ms: record.updated_at_ms,
    }
}

fn normalize_user_id(user_id: &str) -> String {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        "anonymous".to_string()
    } else {
        trimmed.to_string()
    }
}

fn owner_matches(record: &JobRecord, user_id: Option<&str>) -> bool {
    user_id.is_none_or(|user_id| record.user_id == normalize_user_id(user_id))
}

fn queue_ahead_locked(state: &ManagerState, record: &JobRecord) -> usize {
    if record.status != JobStatus::Queued {
        return 0;
    }
    state
        .jobs
        .values()
        .filter(|job| job.status.is_active() && job.job_id != record.job_id)
        .filter(|job| (job.created_at_ms, &job.job_id) < (record.created_at_ms, &record.job_id))
        .count()
}

fn set_stage_detail(record: &mut JobRecord, stage: &str, step_key: &str, step_label: &str, now: i64) {
    record.stage_detail = Some(StageDetail {
        stage: stage.to_string(),
        step_key: step_key.to_string(),
        step_label: step_label.to_string(),
        done: None,
        total: None,
        unit: None,
        percent_in_stage: None,
        eta_seconds: None,
        updated_at_ms: now,
    });
}

fn append_event(
    record: &mut JobRecord,
    stage: &str,
    percent: u8,
    message: &str,
    level: EventLevel,
    now: i64,
) {
    record.push_progress_event(ProgressEvent {
        at_ms: now,
        stage: stage.to_string(),
        percent,
        message: message.to_string(),
        level,
    });
}
