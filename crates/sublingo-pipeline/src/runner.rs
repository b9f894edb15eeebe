//! Pipeline engine: stage sequencing, progress bands, cancellation
//! checkpoints, work-dir artifacts, and result assembly.
//!
//! ```text
//! extract_audio -> asr -> llm_translate -> align_and_build -> completed
//! ```
//!
//! URL jobs run `download_source` before this engine is entered (the job
//! manager owns the download); resume jobs skip straight to translation.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde_json::json;

use sublingo_core::{
    AlignmentDiagnostics, AsrSegment, CancelCheck, ErrorCode, PipelineError, PipelineOptions,
    PipelineOutput, PipelineStats, ProgressFn, Sentence, StageResult, Subtitle, SyncDiagnostics,
    WhisperRuntime, WordSegment, WordSource, WorkDir, round3, stage,
};

use crate::align::{AlignOutcome, AlignRequest, align_sentences};
use crate::asr::{
    AsrDispatchOutcome, AsrDispatchRequest, AsrDispatcher, PROVIDER_CLOUD_PARAFORMER,
    PROVIDER_CLOUD_QWEN_FILETRANS, PROVIDER_LOCAL_FASTER_WHISPER, flatten_word_segments,
};
use crate::drift::{DriftConfig, DriftDiagnostics, apply_adaptive_drift_correction};
use crate::llm::{LlmUsageSnapshot, ProbeCache, probe_llm_access};
use crate::media::{FfmpegProbe, extract_audio, validate_media_file};
use crate::progress::{StageBand, emit, emit_step};
use crate::subtitle::{SubtitleConfig, build_srt, normalize_timeline, split_long_rows};
use crate::translate::{TranslationLimits, TranslationRequest, select_strategy};

/// Hard gate on the qwen file-trans fallback share.
pub const QWEN_FALLBACK_RATIO_THRESHOLD: f64 = 0.10;

/// Injected pipeline configuration.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub drift: DriftConfig,
    pub subtitle: SubtitleConfig,
    pub translation: TranslationLimits,
}

/// The per-process pipeline engine. Stateless across jobs apart from the
/// bounded caches it owns (FFmpeg verdict, LLM probe results, ASR model
/// handles inside the dispatcher).
pub struct PipelineRunner {
    config: PipelineConfig,
    ffmpeg: FfmpegProbe,
    dispatcher: AsrDispatcher,
    probe_cache: ProbeCache,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(config: PipelineConfig, dispatcher: AsrDispatcher) -> Self {
        Self {
            config,
            ffmpeg: FfmpegProbe::new(),
            dispatcher,
            probe_cache: ProbeCache::default(),
        }
    }

    /// Full pipeline over a media file in `work_dir`.
    pub async fn run(
        &self,
        video_path: &Path,
        work_dir: &WorkDir,
        options: &PipelineOptions,
        progress: &ProgressFn,
        cancel: &CancelCheck,
    ) -> StageResult<PipelineOutput> {
        let pipeline_started = Instant::now();
        let mut timing_ms: BTreeMap<String, u64> = BTreeMap::new();

        check_cancel(cancel, stage::EXTRACT_AUDIO)?;
        self.ffmpeg.ensure_available().await?;
        work_dir.ensure().await.map_err(|e| {
            PipelineError::unexpected(stage::EXTRACT_AUDIO, format!("work dir: {e}"))
        })?;

        // -- extract_audio ---------------------------------------------------
        let stage_started = Instant::now();
        emit(progress, 8, stage::EXTRACT_AUDIO, "extracting audio from media");
        validate_media_file(video_path).await?;
        check_cancel(cancel, stage::EXTRACT_AUDIO)?;
        let audio_path = work_dir.audio_wav();
        extract_audio(video_path, &audio_path).await?;
        check_cancel(cancel, stage::ASR)?;
        record_ms(&mut timing_ms, "extract_audio", stage_started);

        // -- asr -------------------------------------------------------------
        let stage_started = Instant::now();
        emit(progress, 30, stage::ASR, "running speech recognition");
        let dispatch_request = AsrDispatchRequest {
            audio_path,
            whisper: options.whisper.clone(),
            profile: options.asr_profile,
            fallback_enabled: options.fallback_enabled,
            allow_cloud_fallback: options.allow_cloud_fallback,
            allow_local_fallback: options.allow_local_fallback,
            enable_diarization: options.enable_diarization,
        };
        let progress_for_asr = progress.clone();
        let dispatch = self
            .dispatcher
            .dispatch(&dispatch_request, cancel, &move |percent, message| {
                emit(&progress_for_asr, percent, stage::ASR, message);
            })
            .await?;
        check_cancel(cancel, stage::ASR)?;

        if dispatch.segments.is_empty() {
            return Err(PipelineError::new(
                stage::ASR,
                ErrorCode::AsrEmptySegments,
                "speech recognition returned no usable segments",
            ));
        }
        let source = match dispatch.runtime_effective {
            WhisperRuntime::Cloud => WordSource::Cloud,
            WhisperRuntime::Local => WordSource::Local,
        };
        let word_segments = flatten_word_segments(&dispatch.segments, source);
        if word_segments.is_empty() {
            return Err(PipelineError::new(
                stage::ASR,
                ErrorCode::WordTimestampsMissing,
                "ASR returned no word-level timestamps, cannot align subtitles",
            )
            .with_detail_json(&json!({
                "provider": dispatch.provider_effective,
                "runtime": dispatch.runtime_effective.as_str(),
                "reason": "word_segments_empty",
            })));
        }
        record_ms(&mut timing_ms, "asr", stage_started);
        emit(
            progress,
            42,
            stage::ASR,
            &format!(
                "speech recognition complete, {} segments, entering translation",
                dispatch.segments.len()
            ),
        );
        self.write_asr_logs(work_dir, &dispatch, &word_segments).await;

        // -- llm_translate ---------------------------------------------------
        let sentences = sentences_from_segments(&dispatch.segments)?;
        let (sentences, translation_batch_count, llm_usage, translation_usage) = self
            .translate_stage(sentences, options, progress, cancel, &mut timing_ms)
            .await?;

        // -- align_and_build -------------------------------------------------
        let allow_fallback = dispatch.provider_effective == PROVIDER_CLOUD_QWEN_FILETRANS;
        let build = self
            .align_and_build(
                sentences,
                &word_segments,
                allow_fallback,
                &dispatch.provider_effective,
                Some(work_dir),
                progress,
                cancel,
                &mut timing_ms,
            )
            .await?;

        record_total(&mut timing_ms, pipeline_started);
        check_cancel(cancel, stage::COMPLETED)?;
        emit(progress, 100, stage::COMPLETED, "subtitle processing complete");

        let duration_sec = build
            .subtitles
            .iter()
            .map(|s| s.end)
            .fold(0.0f64, f64::max);
        let stats = PipelineStats {
            duration_sec: round3(duration_sec),
            subtitle_count: build.subtitles.len(),
            word_count: word_segments.len(),
            whisper_runtime: dispatch.runtime_effective.as_str().to_string(),
            whisper_model_requested: options.whisper.model.trim().to_string(),
            whisper_model_effective: dispatch.model_effective.clone(),
            asr_profile: options.asr_profile.as_str().to_string(),
            asr_provider_effective: dispatch.provider_effective.clone(),
            asr_provider_attempts: dispatch.attempts.clone(),
            asr_fallback_used: dispatch.fallback_used,
            llm_base_url: llm_usage.base_url.clone(),
            llm_provider_effective: llm_usage.provider_effective.clone(),
            llm_model_effective: llm_usage.model_effective.clone(),
            prompt_tokens: llm_usage.prompt_tokens,
            completion_tokens: llm_usage.completion_tokens,
            total_tokens: llm_usage.total_tokens,
            llm_request_count: llm_usage.request_count,
            provider_request_id: llm_usage.provider_request_id.clone(),
            translation_batch_count,
            translation: translation_usage,
            timing_ms,
            stages: vec![
                "extract_audio".to_string(),
                "asr".to_string(),
                "llm_translate".to_string(),
                "align_and_build".to_string(),
            ],
        };

        Ok(PipelineOutput {
            subtitles: build.subtitles,
            source_srt: build.source_srt,
            bilingual_srt: build.bilingual_srt,
            word_segments,
            diagnostics: build.diagnostics,
            stats,
            partial: false,
            partial_stage: None,
            partial_error: None,
        })
    }

    /// Resume pipeline: translate and re-align previously produced
    /// sentences against a supplied word stream. Alignment runs strict.
    pub async fn run_resume(
        &self,
        sentences: Vec<Sentence>,
        word_segments: Vec<WordSegment>,
        options: &PipelineOptions,
        progress: &ProgressFn,
        cancel: &CancelCheck,
    ) -> StageResult<PipelineOutput> {
        let pipeline_started = Instant::now();
        let mut timing_ms: BTreeMap<String, u64> = BTreeMap::new();

        let normalized: Vec<Sentence> = sentences
            .into_iter()
            .filter(|row| !row.text.trim().is_empty())
            .collect();
        if normalized.is_empty() {
            return Err(PipelineError::new(
                stage::LLM_TRANSLATE,
                ErrorCode::AsrTextEmpty,
                "no usable sentences to resume from",
            ));
        }

        let (translated, translation_batch_count, llm_usage, translation_usage) = self
            .translate_stage(normalized, options, progress, cancel, &mut timing_ms)
            .await?;

        let provider_effective = infer_resume_provider(&word_segments);
        let build = self
            .align_and_build(
                translated,
                &word_segments,
                false,
                &provider_effective,
                None,
                progress,
                cancel,
                &mut timing_ms,
            )
            .await?;

        record_total(&mut timing_ms, pipeline_started);
        check_cancel(cancel, stage::COMPLETED)?;
        emit(progress, 100, stage::COMPLETED, "subtitle processing complete");

        let duration_sec = build
            .subtitles
            .iter()
            .map(|s| s.end)
            .fold(0.0f64, f64::max);
        let stats = PipelineStats {
            duration_sec: round3(duration_sec),
            subtitle_count: build.subtitles.len(),
            word_count: word_segments.len(),
            whisper_runtime: String::new(),
            whisper_model_requested: options.whisper.model.trim().to_string(),
            whisper_model_effective: String::new(),
            asr_profile: options.asr_profile.as_str().to_string(),
            asr_provider_effective: provider_effective,
            asr_provider_attempts: Vec::new(),
            asr_fallback_used: false,
            llm_base_url: llm_usage.base_url.clone(),
            llm_provider_effective: llm_usage.provider_effective.clone(),
            llm_model_effective: llm_usage.model_effective.clone(),
            prompt_tokens: llm_usage.prompt_tokens,
            completion_tokens: llm_usage.completion_tokens,
            total_tokens: llm_usage.total_tokens,
            llm_request_count: llm_usage.request_count,
            provider_request_id: llm_usage.provider_request_id.clone(),
            translation_batch_count,
            translation: translation_usage,
            timing_ms,
            stages: vec!["llm_translate".to_string(), "align_and_build".to_string()],
        };

        Ok(PipelineOutput {
            subtitles: build.subtitles,
            source_srt: build.source_srt,
            bilingual_srt: build.bilingual_srt,
            word_segments,
            diagnostics: build.diagnostics,
            stats,
            partial: false,
            partial_stage: None,
            partial_error: None,
        })
    }

    async fn translate_stage(
        &self,
        mut sentences: Vec<Sentence>,
        options: &PipelineOptions,
        progress: &ProgressFn,
        cancel: &CancelCheck,
        timing_ms: &mut BTreeMap<String, u64>,
    ) -> StageResult<(Vec<Sentence>, usize, LlmUsageSnapshot, sublingo_core::TranslationUsage)>
    {
        let stage_started = Instant::now();
        check_cancel(cancel, stage::LLM_TRANSLATE)?;
        emit(progress, 72, stage::LLM_TRANSLATE, "running LLM translation");

        if !options.llm.is_translation_model() {
            let client =
                crate::llm::LlmClient::new(options.llm.clone(), crate::llm::LLM_REQUEST_TIMEOUT)?;
            probe_llm_access(&client, &self.probe_cache).await?;
        }

        let strategy = select_strategy(&options.llm, self.config.translation)?;
        let request = TranslationRequest {
            texts: sentences.iter().map(|row| row.text.clone()).collect(),
            source_language: options.source_language.clone(),
            target_language: options.target_language.clone(),
        };
        let progress_for_step = progress.clone();
        let step_started_ms = sublingo_core::now_ms();
        let outcome = strategy
            .translate(&request, cancel, &move |done, total| {
                emit_step(
                    &progress_for_step,
                    StageBand::new(72, 90),
                    stage::LLM_TRANSLATE,
                    "llm_translate",
                    "LLM translation",
                    "running LLM translation",
                    done as u64,
                    total as u64,
                    "row",
                    step_started_ms,
                );
            })
            .await?;

        for (row, translation) in sentences.iter_mut().zip(outcome.translations.iter()) {
            row.translation = translation.trim().to_string();
        }
        record_ms(timing_ms, "llm_translate", stage_started);
        emit(
            progress,
            90,
            stage::LLM_TRANSLATE,
            &format!("translation complete, {} sentences", sentences.len()),
        );

        Ok((
            sentences,
            outcome.batch_count,
            outcome.llm_usage,
            outcome.translation_usage,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn align_and_build(
        &self,
        sentences: Vec<Sentence>,
        word_segments: &[WordSegment],
        allow_word_stream_fallback: bool,
        provider_effective: &str,
        work_dir: Option<&WorkDir>,
        progress: &ProgressFn,
        cancel: &CancelCheck,
        timing_ms: &mut BTreeMap<String, u64>,
    ) -> StageResult<BuildOutcome> {
        let stage_started = Instant::now();
        check_cancel(cancel, stage::ALIGN_AND_BUILD)?;
        emit(progress, 92, stage::ALIGN_AND_BUILD, "aligning and building subtitles");

        let request = AlignRequest {
            stage: stage::ALIGN_AND_BUILD.to_string(),
            allow_word_stream_fallback,
        };
        let progress_for_rows = progress.clone();
        let row_started_ms = sublingo_core::now_ms();
        let AlignOutcome { rows, diagnostics } =
            align_sentences(&sentences, word_segments, &request, cancel, |done, total| {
                emit_step(
                    &progress_for_rows,
                    StageBand::new(92, 96),
                    stage::ALIGN_AND_BUILD,
                    "align_rows",
                    "timestamp alignment",
                    "aligning and building subtitles",
                    done as u64,
                    total as u64,
                    "row",
                    row_started_ms,
                );
            })?;

        if allow_word_stream_fallback {
            tracing::debug!(
                target: "sublingo.pipeline",
                mode = diagnostics.alignment_mode.as_str(),
                fallback_rows = diagnostics.fallback_rows,
                fallback_ratio = diagnostics.fallback_ratio,
                "qwen word-stream alignment diagnostics"
            );
            enforce_qwen_fallback_gate(&diagnostics, provider_effective)?;
        }
        record_ms(timing_ms, "align_timestamps", stage_started);

        let (rows, drift) = apply_adaptive_drift_correction(
            rows,
            word_segments,
            diagnostics.alignment_quality_score,
            &self.config.drift,
            cancel,
        )?;

        let rows = normalize_timeline(rows);
        let rows = split_long_rows(rows, &self.config.subtitle);
        let rows = normalize_timeline(rows);

        check_cancel(cancel, stage::ALIGN_AND_BUILD)?;
        emit(progress, 97, stage::ALIGN_AND_BUILD, "generating subtitle files");
        let source_srt = build_srt(&rows, false);
        let bilingual_srt = build_srt(&rows, true);
        if let Some(work_dir) = work_dir {
            write_text(&work_dir.source_srt(), &source_srt).await;
            write_text(&work_dir.bilingual_srt(), &bilingual_srt).await;
        }

        let subtitles = Subtitle::from_sentences(&rows);
        record_ms(timing_ms, "align_and_build", stage_started);

        Ok(BuildOutcome {
            subtitles,
            source_srt,
            bilingual_srt,
            diagnostics: merge_diagnostics(&diagnostics, &drift),
        })
    }

    async fn write_asr_logs(
        &self,
        work_dir: &WorkDir,
        dispatch: &AsrDispatchOutcome,
        word_segments: &[WordSegment],
    ) {
        let segments_log = json!({
            "segments": dispatch.segments,
            "provider_effective": dispatch.provider_effective,
            "provider_attempts": dispatch.attempts,
            "fallback_used": dispatch.fallback_used,
        });
        write_json(&work_dir.asr_segments_json(), &segments_log).await;
        write_json(
            &work_dir.word_segments_json(),
            &json!({ "word_segments": word_segments }),
        )
        .await;
    }
}

/// Hard failure when the qwen file-trans fallback share exceeds the gate.
pub fn enforce_qwen_fallback_gate(
    diagnostics: &AlignmentDiagnostics,
    provider_effective: &str,
) -> StageResult<()> {
    if diagnostics.fallback_ratio <= QWEN_FALLBACK_RATIO_THRESHOLD {
        return Ok(());
    }
    Err(PipelineError::new(
        stage::ALIGN_AND_BUILD,
        ErrorCode::TimestampAlignmentFailed,
        "word-level alignment quality below the acceptance gate",
    )
    .with_detail_json(&json!({
        "reason": "fallback_ratio_exceeded",
        "fallback_ratio": diagnostics.fallback_ratio,
        "threshold": QWEN_FALLBACK_RATIO_THRESHOLD,
        "fallback_rows": diagnostics.fallback_rows,
        "total_rows": diagnostics.total_rows,
        "provider": provider_effective,
    })))
}

/// Result of the align/build stage, before stats assembly.
struct BuildOutcome {
    subtitles: Vec<Subtitle>,
    source_srt: String,
    bilingual_srt: String,
    diagnostics: SyncDiagnostics,
}

fn check_cancel(cancel: &CancelCheck, at_stage: &str) -> StageResult<()> {
    if cancel() {
        Err(PipelineError::cancel_requested(at_stage))
    } else {
        Ok(())
    }
}

fn record_ms(timing_ms: &mut BTreeMap<String, u64>, key: &str, started: Instant) {
    #[allow(clippy::cast_possible_truncation)]
    let elapsed = started.elapsed().as_millis() as u64;
    *timing_ms.entry(key.to_string()).or_insert(0) += elapsed;
}

fn record_total(timing_ms: &mut BTreeMap<String, u64>, started: Instant) {
    #[allow(clippy::cast_possible_truncation)]
    let elapsed = started.elapsed().as_millis() as u64;
    timing_ms.insert("total".to_string(), elapsed);
}

/// Sentences from ASR segments: keep non-empty text, repair degenerate
/// timings.
fn sentences_from_segments(segments: &[AsrSegment]) -> StageResult<Vec<Sentence>> {
    let mut sentences = Vec::with_capacity(segments.len());
    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        let start = if segment.start.is_finite() { segment.start } else { 0.0 }.max(0.0);
        let end = if segment.end.is_finite() && segment.end > start {
            segment.end
        } else {
            start + 0.5
        };
        sentences.push(Sentence {
            start: round3(start),
            end: round3(end),
            text: text.to_string(),
            translation: String::new(),
        });
    }
    if sentences.is_empty() {
        return Err(PipelineError::new(
            stage::LLM_TRANSLATE,
            ErrorCode::AsrTextEmpty,
            "speech recognition produced no translatable text",
        ));
    }
    Ok(sentences)
}

/// Best-effort provider label for resume stats, from the word stream.
fn infer_resume_provider(word_segments: &[WordSegment]) -> String {
    if word_segments.is_empty() {
        return String::new();
    }
    if word_segments
        .iter()
        .any(|word| word.source == WordSource::Cloud)
    {
        PROVIDER_CLOUD_PARAFORMER.to_string()
    } else {
        PROVIDER_LOCAL_FASTER_WHISPER.to_string()
    }
}

fn merge_diagnostics(
    alignment: &AlignmentDiagnostics,
    drift: &DriftDiagnostics,
) -> SyncDiagnostics {
    SyncDiagnostics {
        alignment_quality_score: alignment.alignment_quality_score,
        global_offset_ms: drift.global_offset_ms,
        drift_scale: if drift.drift_scale == 0.0 { 1.0 } else { drift.drift_scale },
        correction_applied: drift.correction_applied,
        correction_method: if drift.correction_method.is_empty() {
            "none".to_string()
        } else {
            drift.correction_method.clone()
        },
        triggered: drift.triggered,
        correction_score: drift.correction_score,
        fallback_rows: alignment.fallback_rows,
        fallback_ratio: alignment.fallback_ratio,
        alignment_mode: alignment.alignment_mode.as_str().to_string(),
        quality_gate_triggered: false,
    }
}

async fn write_json(path: &Path, payload: &serde_json::Value) {
    let rendered = serde_json::to_string_pretty(payload).unwrap_or_default();
    write_text(path, &rendered).await;
}

async fn write_text(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(error) = tokio::fs::write(path, content).await {
        tracing::warn!(
            target: "sublingo.pipeline",
            path = %path.display(),
            error = %error,
            "work-dir artifact write failed"
        );
    }
}
