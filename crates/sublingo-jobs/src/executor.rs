//! Job execution port and the default pipeline-backed executor.
//!
//! The job manager never touches the pipeline directly: work goes through
//! `JobExecutorPort`, so scheduling and state management stay testable
//! with a fake executor.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use sublingo_core::{
    CancelCheck, JobKind, PipelineOptions, PipelineOutput, ProgressFn, ProgressUpdate, Sentence,
    StageResult, WordSegment, WorkDir, stage,
};
use sublingo_ingest::UrlIngestor;
use sublingo_pipeline::{PipelineRunner, validate_media_file};

/// Immutable inputs handed to the executor for one run.
#[derive(Clone, Debug)]
pub struct JobExecutionInput {
    pub job_id: String,
    pub kind: JobKind,
    pub work_dir: PathBuf,
    pub video_path: PathBuf,
    pub source_url: String,
    pub options: PipelineOptions,
    pub resume_sentences: Vec<Sentence>,
    pub resume_word_segments: Vec<WordSegment>,
}

/// What a finished execution hands back to the manager.
#[derive(Clone, Debug)]
pub struct JobExecutionOutput {
    pub output: PipelineOutput,
    /// Set for URL jobs once the fetch completed.
    pub downloaded_video: Option<PathBuf>,
}

/// The seam between scheduling and pipeline work.
#[async_trait]
pub trait JobExecutorPort: Send + Sync {
    async fn execute(
        &self,
        input: JobExecutionInput,
        progress: ProgressFn,
        cancel: CancelCheck,
    ) -> StageResult<JobExecutionOutput>;
}

/// Production executor: URL ingestion plus the pipeline engine.
pub struct PipelineJobExecutor {
    runner: PipelineRunner,
    ingestor: UrlIngestor,
}

impl PipelineJobExecutor {
    #[must_use]
    pub const fn new(runner: PipelineRunner, ingestor: UrlIngestor) -> Self {
        Self { runner, ingestor }
    }
}

#[async_trait]
impl JobExecutorPort for PipelineJobExecutor {
    async fn execute(
        &self,
        input: JobExecutionInput,
        progress: ProgressFn,
        cancel: CancelCheck,
    ) -> StageResult<JobExecutionOutput> {
        let work_dir = WorkDir::new(&input.work_dir);
        match input.kind {
            JobKind::Resume => {
                let output = self
                    .runner
                    .run_resume(
                        input.resume_sentences,
                        input.resume_word_segments,
                        &input.options,
                        &progress,
                        &cancel,
                    )
                    .await?;
                Ok(JobExecutionOutput {
                    output,
                    downloaded_video: None,
                })
            }
            JobKind::Full => {
                validate_media_file(&input.video_path).await?;
                let output = self
                    .runner
                    .run(&input.video_path, &work_dir, &input.options, &progress, &cancel)
                    .await?;
                Ok(JobExecutionOutput {
                    output,
                    downloaded_video: None,
                })
            }
            JobKind::Url => {
                // download_source occupies the 3-12% band
                progress(ProgressUpdate::new(
                    3,
                    stage::DOWNLOAD_SOURCE,
                    "resolving and downloading source media",
                ));
                let download_progress = progress.clone();
                let cancel_for_download = cancel.clone();
                let downloaded = self
                    .ingestor
                    .fetch(
                        &input.source_url,
                        &work_dir.input_dir(),
                        &move || cancel_for_download(),
                        &move |download_percent, message| {
                            let mapped =
                                3 + ((f64::from(download_percent.min(100)) / 100.0) * 9.0).round()
                                    as u8;
                            download_progress(ProgressUpdate::new(
                                mapped,
                                stage::DOWNLOAD_SOURCE,
                                message,
                            ));
                        },
                    )
                    .await?;
                progress(ProgressUpdate::new(
                    12,
                    stage::DOWNLOAD_SOURCE,
                    "source media downloaded, preparing audio extraction",
                ));

                validate_media_file(&downloaded).await?;
                // The inner pipeline's 0-100 re-projects into 12-100
                let outer = progress.clone();
                let remapped: ProgressFn = Arc::new(move |update: ProgressUpdate| {
                    let percent = remap_url_pipeline_percent(update.percent);
                    let mut update = update;
                    update.percent = percent;
                    outer(update);
                });
                let output = self
                    .runner
                    .run(&downloaded, &work_dir, &input.options, &remapped, &cancel)
                    .await?;
                Ok(JobExecutionOutput {
                    output,
                    downloaded_video: Some(downloaded),
                })
            }
        }
    }
}

/// `p <= 8` maps to 12, the rest stretches linearly onto 12-100.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn remap_url_pipeline_percent(percent: u8) -> u8 {
    let normalized = f64::from(percent.min(100));
    if normalized <= 8.0 {
        12
    } else {
        (12.0 + ((normalized - 8.0) / 92.0) * 88.0).round() as u8
    }
}
