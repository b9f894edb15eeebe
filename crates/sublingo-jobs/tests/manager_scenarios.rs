//! End-to-end job manager scenarios against a real SQLite store and a
//! scriptable fake executor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use sublingo_core::{
    CancelCheck, ErrorCode, JobStatus, JobStorePort, NoopUsageSink, PipelineError,
    PipelineOptions, PipelineOutput, PipelineStats, ProgressFn, ProgressUpdate, Sentence,
    ServiceSettings, StageResult, StoredJobRow, Subtitle, SyncDiagnostics, UsageSinkPort, stage,
};
use sublingo_db::{SqliteJobRepository, setup_test_database};
use sublingo_jobs::{
    CancelOutcome, CapacityLimit, JobExecutionInput, JobExecutionOutput, JobExecutorPort,
    JobManager,
};

/// What the fake executor should do per run.
#[derive(Clone)]
enum Script {
    /// Emit staged progress, then succeed with a canned output.
    Succeed(Box<PipelineOutput>),
    /// Fail with the given error.
    Fail(PipelineError),
    /// Poll the cancel predicate until it fires (or the release flag is
    /// set), emitting progress while waiting.
    BlockUntilCancelled { release: Arc<AtomicBool> },
}

struct FakeExecutor {
    script: Script,
}

#[async_trait]
impl JobExecutorPort for FakeExecutor {
    async fn execute(
        &self,
        _input: JobExecutionInput,
        progress: ProgressFn,
        cancel: CancelCheck,
    ) -> StageResult<JobExecutionOutput> {
        match &self.script {
            Script::Succeed(output) => {
                progress(ProgressUpdate::new(8, stage::EXTRACT_AUDIO, "extracting audio"));
                progress(ProgressUpdate::new(30, stage::ASR, "running speech recognition"));
                progress(ProgressUpdate::new(72, stage::LLM_TRANSLATE, "running LLM translation"));
                progress(ProgressUpdate::new(92, stage::ALIGN_AND_BUILD, "aligning"));
                Ok(JobExecutionOutput {
                    output: (**output).clone(),
                    downloaded_video: None,
                })
            }
            Script::Fail(error) => Err(error.clone()),
            Script::BlockUntilCancelled { release } => {
                progress(ProgressUpdate::new(30, stage::ASR, "running speech recognition"));
                loop {
                    if cancel() {
                        return Err(PipelineError::cancel_requested(stage::ASR));
                    }
                    if release.load(Ordering::SeqCst) {
                        return Ok(JobExecutionOutput {
                            output: happy_output(),
                            downloaded_video: None,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

fn happy_output() -> PipelineOutput {
    let subtitles = vec![
        Subtitle {
            id: 1,
            start: 0.0,
            end: 1.5,
            text: "Hello world".into(),
            translation: "你好世界".into(),
            index: 0,
        },
        Subtitle {
            id: 2,
            start: 1.6,
            end: 3.0,
            text: "How are you".into(),
            translation: "你好吗".into(),
            index: 1,
        },
    ];
    PipelineOutput {
        subtitles,
        source_srt: "1\n00:00:00,000 --> 00:00:01,500\nHello world".into(),
        bilingual_srt: "1\n00:00:00,000 --> 00:00:01,500\nHello world\n你好世界".into(),
        word_segments: Vec::new(),
        diagnostics: SyncDiagnostics {
            alignment_quality_score: 1.0,
            drift_scale: 1.0,
            correction_method: "none".into(),
            alignment_mode: "strict".into(),
            ..SyncDiagnostics::default()
        },
        stats: PipelineStats {
            subtitle_count: 2,
            whisper_runtime: "cloud".into(),
            whisper_model_effective: "paraformer-v2".into(),
            asr_provider_effective: "cloud_paraformer_v2".into(),
            asr_fallback_used: false,
            timing_ms: BTreeMap::new(),
            ..PipelineStats::default()
        },
        partial: false,
        partial_stage: None,
        partial_error: None,
    }
}

async fn manager_with(
    script: Script,
    settings: ServiceSettings,
) -> (JobManager, Arc<dyn JobStorePort>) {
    let pool = setup_test_database().await.unwrap();
    let store: Arc<dyn JobStorePort> = Arc::new(SqliteJobRepository::new(pool));
    let manager = JobManager::start(
        settings,
        Arc::clone(&store),
        Arc::new(FakeExecutor { script }),
        Arc::new(NoopUsageSink),
    )
    .await
    .unwrap();
    (manager, store)
}

fn settings() -> ServiceSettings {
    ServiceSettings {
        global_concurrency_limit: 3,
        per_user_concurrency_limit: 1,
        ..ServiceSettings::default()
    }
}

async fn wait_for_status(
    manager: &JobManager,
    job_id: &str,
    wanted: JobStatus,
) -> sublingo_jobs::JobStatusView {
    for _ in 0..300 {
        if let Some(view) = manager.get_status(job_id, None).await {
            if view.status == wanted {
                return view;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached {wanted:?}");
}

fn work_dir(tmp: &tempfile::TempDir, name: &str) -> PathBuf {
    tmp.path().join(name)
}

#[tokio::test]
async fn happy_path_completes_and_delivers_result_once() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("video.mp4"),
            work_dir(&tmp, "job"),
            PipelineOptions::default(),
        )
        .unwrap();

    let view = wait_for_status(&manager, &job_id, JobStatus::Completed).await;
    assert_eq!(view.progress_percent, 100);
    assert_eq!(view.asr_provider_effective, "cloud_paraformer_v2");
    assert!(!view.asr_fallback_used);
    assert!(view.status_revision > 0);
    assert!(!view.recent_progress_events.is_empty());

    let result = manager.consume_result(&job_id, Some("alice")).unwrap();
    assert_eq!(result.subtitles.len(), 2);
    assert_eq!(result.subtitles[0].text, "Hello world");
    assert_eq!(result.subtitles[0].translation, "你好世界");

    // Exactly-once from the consumer's perspective
    assert!(manager.consume_result(&job_id, Some("alice")).is_none());
    manager.shutdown();
}

#[tokio::test]
async fn status_is_owner_scoped() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("video.mp4"),
            work_dir(&tmp, "job"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &job_id, JobStatus::Completed).await;

    assert!(manager.get_status(&job_id, Some("alice")).await.is_some());
    assert!(manager.get_status(&job_id, Some("mallory")).await.is_none());
    assert!(manager.consume_result(&job_id, Some("mallory")).is_none());
    manager.shutdown();
}

#[tokio::test]
async fn per_user_gate_rejects_second_submission_until_cancel() {
    let tmp = tempfile::tempdir().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (manager, _store) = manager_with(
        Script::BlockUntilCancelled {
            release: Arc::clone(&release),
        },
        settings(),
    )
    .await;

    let first = manager
        .submit_file_job(
            "user-x",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-a"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &first, JobStatus::Running).await;

    let check = manager.check_submit_capacity("user-x");
    assert!(!check.ok);
    assert_eq!(check.code, Some(CapacityLimit::UserConcurrencyLimit));
    assert_eq!(check.active_job_id.as_deref(), Some(first.as_str()));

    // A different user is not blocked by X's cap
    assert!(manager.check_submit_capacity("user-y").ok);

    assert_eq!(
        manager.cancel_job(&first, Some("user-x")),
        Some(CancelOutcome::CancelRequested)
    );
    wait_for_status(&manager, &first, JobStatus::Cancelled).await;

    let check = manager.check_submit_capacity("user-x");
    assert!(check.ok, "capacity should free up after cancellation");
    manager.shutdown();
}

#[tokio::test]
async fn global_gate_rejects_when_capacity_reached() {
    let tmp = tempfile::tempdir().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (manager, _store) = manager_with(
        Script::BlockUntilCancelled {
            release: Arc::clone(&release),
        },
        ServiceSettings {
            global_concurrency_limit: 1,
            per_user_concurrency_limit: 1,
            ..ServiceSettings::default()
        },
    )
    .await;

    let first = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-a"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &first, JobStatus::Running).await;

    let check = manager.check_submit_capacity("bob");
    assert!(!check.ok);
    assert_eq!(check.code, Some(CapacityLimit::GlobalConcurrencyLimit));

    release.store(true, Ordering::SeqCst);
    wait_for_status(&manager, &first, JobStatus::Completed).await;
    assert!(manager.check_submit_capacity("bob").ok);
    manager.shutdown();
}

#[tokio::test]
async fn queued_job_cancels_synchronously() {
    let tmp = tempfile::tempdir().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    // One worker; the second job stays queued behind the first
    let (manager, _store) = manager_with(
        Script::BlockUntilCancelled {
            release: Arc::clone(&release),
        },
        ServiceSettings {
            global_concurrency_limit: 1,
            per_user_concurrency_limit: 2,
            ..ServiceSettings::default()
        },
    )
    .await;

    let first = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-a"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &first, JobStatus::Running).await;

    // Distinct creation timestamps keep the queue-ahead ordering stable
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = manager
        .submit_file_job(
            "alice",
            tmp.path().join("b.mp4"),
            work_dir(&tmp, "job-b"),
            PipelineOptions::default(),
        )
        .unwrap();
    let queued_view = manager.get_status(&second, None).await.unwrap();
    assert_eq!(queued_view.status, JobStatus::Queued);
    assert_eq!(queued_view.queue_ahead, 1);

    assert_eq!(
        manager.cancel_job(&second, Some("alice")),
        Some(CancelOutcome::Cancelled)
    );
    let cancelled = manager.get_status(&second, None).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.error_code, "cancel_requested");

    release.store(true, Ordering::SeqCst);
    manager.shutdown();
}

#[tokio::test]
async fn running_cancel_reaches_terminal_within_checkpoint_latency() {
    let tmp = tempfile::tempdir().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (manager, _store) = manager_with(
        Script::BlockUntilCancelled { release },
        settings(),
    )
    .await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-a"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &job_id, JobStatus::Running).await;

    assert_eq!(
        manager.cancel_job(&job_id, None),
        Some(CancelOutcome::CancelRequested)
    );
    let view = wait_for_status(&manager, &job_id, JobStatus::Cancelled).await;
    assert_eq!(view.error_code, "cancel_requested");
    assert_eq!(view.progress_percent, 100);
    manager.shutdown();
}

#[tokio::test]
async fn llm_invalid_json_salvages_to_completed_with_base_subtitles() {
    let tmp = tempfile::tempdir().unwrap();
    let job_dir = work_dir(&tmp, "job-salvage");

    // Seed the work-dir ASR logs the salvage path reads
    let work = sublingo_core::WorkDir::new(&job_dir);
    work.ensure().await.unwrap();
    tokio::fs::write(
        work.asr_segments_json(),
        serde_json::json!({
            "segments": [
                {"start": 0.0, "end": 1.5, "text": "Hello world", "words": []},
                {"start": 1.6, "end": 3.0, "text": "How are you", "words": []},
            ],
        })
        .to_string(),
    )
    .await
    .unwrap();

    let error = PipelineError::new(
        stage::LLM,
        ErrorCode::LlmInvalidJson,
        "LLM returned non-JSON content",
    )
    .with_detail("content_preview=...");
    let (manager, _store) = manager_with(Script::Fail(error), settings()).await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            job_dir,
            PipelineOptions::default(),
        )
        .unwrap();

    let view = wait_for_status(&manager, &job_id, JobStatus::Completed).await;
    assert_eq!(view.error_code, "llm_invalid_json");
    assert!(view.error_detail.is_some());

    let result = manager.consume_result(&job_id, Some("alice")).unwrap();
    assert!(result.partial);
    assert_eq!(result.subtitles.len(), 2);
    assert!(result.subtitles.iter().all(|s| s.translation.is_empty()));
    manager.shutdown();
}

#[tokio::test]
async fn failed_job_attaches_partial_lazily_in_status() {
    let tmp = tempfile::tempdir().unwrap();
    let job_dir = work_dir(&tmp, "job-fail");
    let work = sublingo_core::WorkDir::new(&job_dir);
    work.ensure().await.unwrap();
    tokio::fs::write(
        work.asr_segments_json(),
        serde_json::json!({
            "segments": [{"start": 0.0, "end": 1.0, "text": "salvage me", "words": []}],
        })
        .to_string(),
    )
    .await
    .unwrap();

    let error = PipelineError::new(
        stage::ALIGN_AND_BUILD,
        ErrorCode::TimestampAlignmentFailed,
        "alignment failed",
    );
    let (manager, _store) = manager_with(Script::Fail(error), settings()).await;

    let job_id = manager
        .submit_file_job("alice", tmp.path().join("a.mp4"), job_dir, PipelineOptions::default())
        .unwrap();
    let view = wait_for_status(&manager, &job_id, JobStatus::Failed).await;

    assert_eq!(view.error_code, "timestamp_alignment_failed");
    let partial = view.partial_result.expect("partial attached");
    assert!(partial.partial);
    assert_eq!(partial.subtitles.len(), 1);
    manager.shutdown();
}

#[tokio::test]
async fn startup_recovery_marks_stale_rows_failed() {
    let pool = setup_test_database().await.unwrap();
    let store: Arc<dyn JobStorePort> = Arc::new(SqliteJobRepository::new(pool));

    // Persist a job that claims to be running from a previous process
    let stale = sublingo_core::JobRecord {
        job_id: "stale-1".into(),
        user_id: "alice".into(),
        status: JobStatus::Running,
        created_at_ms: 1_000,
        updated_at_ms: 2_000,
        ..sublingo_core::JobRecord::default()
    };
    store
        .upsert(&StoredJobRow {
            job_id: stale.job_id.clone(),
            user_id: stale.user_id.clone(),
            payload_json: serde_json::to_string(&stale).unwrap(),
            created_at_ms: stale.created_at_ms,
            updated_at_ms: stale.updated_at_ms,
        })
        .await
        .unwrap();

    let manager = JobManager::start(
        settings(),
        Arc::clone(&store),
        Arc::new(FakeExecutor {
            script: Script::Succeed(Box::new(happy_output())),
        }),
        Arc::new(NoopUsageSink),
    )
    .await
    .unwrap();

    let view = manager.get_status("stale-1", Some("alice")).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error_code, "service_restarted");

    // The rewrite is durable, not just in-memory
    let rows = store.load_all().await.unwrap();
    assert!(rows[0].payload_json.contains("service_restarted"));
    manager.shutdown();
}

#[tokio::test]
async fn invalid_url_submission_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;
    let err = manager
        .submit_url_job(
            "alice",
            "definitely not a url",
            work_dir(&tmp, "job-url"),
            PipelineOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidSourceUrl);
    manager.shutdown();
}

#[tokio::test]
async fn status_revision_strictly_increases_across_transitions() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-rev"),
            PipelineOptions::default(),
        )
        .unwrap();
    let queued_revision = manager.get_status(&job_id, None).await.unwrap().status_revision;
    let final_view = wait_for_status(&manager, &job_id, JobStatus::Completed).await;
    assert!(final_view.status_revision > queued_revision);
    manager.shutdown();
}

#[tokio::test]
async fn consume_removes_non_url_work_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let job_dir = work_dir(&tmp, "job-consume");
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            job_dir.clone(),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &job_id, JobStatus::Completed).await;
    assert!(job_dir.exists());

    manager.consume_result(&job_id, Some("alice")).unwrap();
    assert!(!job_dir.exists());
    manager.shutdown();
}

#[tokio::test]
async fn usage_records_are_forwarded_on_completion() {
    struct RecordingSink {
        scenes: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UsageSinkPort for RecordingSink {
        async fn append(&self, record: &sublingo_core::UsageRecord) {
            self.scenes.lock().unwrap().push(record.scene.clone());
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let pool = setup_test_database().await.unwrap();
    let store: Arc<dyn JobStorePort> = Arc::new(SqliteJobRepository::new(pool));
    let sink = Arc::new(RecordingSink {
        scenes: std::sync::Mutex::new(Vec::new()),
    });
    let manager = JobManager::start(
        settings(),
        store,
        Arc::new(FakeExecutor {
            script: Script::Succeed(Box::new(happy_output())),
        }),
        Arc::clone(&sink) as Arc<dyn UsageSinkPort>,
    )
    .await
    .unwrap();

    let job_id = manager
        .submit_file_job(
            "alice",
            tmp.path().join("a.mp4"),
            work_dir(&tmp, "job-sink"),
            PipelineOptions::default(),
        )
        .unwrap();
    wait_for_status(&manager, &job_id, JobStatus::Completed).await;

    // The sink runs just after finalize; give it a beat
    tokio::time::sleep(Duration::from_millis(50)).await;
    let scenes = sink.scenes.lock().unwrap().clone();
    assert!(scenes.contains(&"subtitle_asr".to_string()));
    assert!(scenes.contains(&"subtitle_pipeline".to_string()));
    manager.shutdown();
}

// Resume jobs go through the same lifecycle with supplied inputs
#[tokio::test]
async fn resume_job_runs_with_supplied_sentences() {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, _store) =
        manager_with(Script::Succeed(Box::new(happy_output())), settings()).await;

    let job_id = manager
        .submit_resume_job(
            "alice",
            vec![Sentence::new(0.0, 1.5, "Hello world")],
            Vec::new(),
            work_dir(&tmp, "job-resume"),
            PipelineOptions::default(),
        )
        .unwrap();
    let view = wait_for_status(&manager, &job_id, JobStatus::Completed).await;
    assert_eq!(view.status, JobStatus::Completed);
    manager.shutdown();
}
