//! ASR dispatcher.
//!
//! Builds the ordered provider chain from runtime/profile/fallback flags,
//! then executes it: first success wins, every failure is recorded, and a
//! fully failed chain surfaces `asr_all_providers_failed` with per-attempt
//! error codes.

pub mod cache;
pub mod cloud;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use sublingo_core::{
    AsrProfile, AsrSegment, CancelCheck, ErrorCode, LocalAsrBackend, LocalAsrRequest,
    PipelineError, StageResult, WhisperOptions, WhisperRuntime, WordSegment, WordSource, round3,
    stage,
};

pub use cache::{AsrModelCaches, ModelCacheKind, ModelHandle};
pub use cloud::{CLOUD_ASR_TIMEOUT, CloudAsrClient};

/// Provider ids.
pub const PROVIDER_CLOUD_PARAFORMER: &str = "cloud_paraformer_v2";
pub const PROVIDER_CLOUD_QWEN_FILETRANS: &str = "cloud_qwen3_asr_flash_filetrans";
pub const PROVIDER_LOCAL_FASTER_WHISPER: &str = "local_faster_whisper";
pub const PROVIDER_LOCAL_WHISPERX: &str = "local_whisperx";

/// Cloud model ids.
pub const CLOUD_MODEL_PARAFORMER: &str = "paraformer-v2";
pub const CLOUD_MODEL_QWEN_FILETRANS: &str = "qwen3-asr-flash-filetrans";

/// Resolve the effective cloud model id; unknown names default to
/// paraformer.
#[must_use]
pub fn resolve_cloud_model(requested_model: &str) -> &'static str {
    match requested_model.trim().to_lowercase().as_str() {
        CLOUD_MODEL_QWEN_FILETRANS => CLOUD_MODEL_QWEN_FILETRANS,
        _ => CLOUD_MODEL_PARAFORMER,
    }
}

/// Provider id for the effective cloud model.
#[must_use]
pub fn resolve_cloud_provider(requested_model: &str) -> &'static str {
    match resolve_cloud_model(requested_model) {
        CLOUD_MODEL_QWEN_FILETRANS => PROVIDER_CLOUD_QWEN_FILETRANS,
        _ => PROVIDER_CLOUD_PARAFORMER,
    }
}

/// Build the ordered, deduplicated provider chain.
pub fn resolve_provider_chain(
    whisper: &WhisperOptions,
    profile: AsrProfile,
    fallback_enabled: bool,
    allow_cloud_fallback: bool,
    allow_local_fallback: bool,
) -> StageResult<Vec<String>> {
    let cloud_provider = resolve_cloud_provider(&whisper.model);

    let mut providers: Vec<&str> = Vec::new();
    match whisper.runtime {
        WhisperRuntime::Local => {
            match (profile, fallback_enabled) {
                (AsrProfile::Accurate, true) => {
                    providers.push(PROVIDER_LOCAL_WHISPERX);
                    providers.push(PROVIDER_LOCAL_FASTER_WHISPER);
                }
                (AsrProfile::Accurate, false) => providers.push(PROVIDER_LOCAL_WHISPERX),
                _ => providers.push(PROVIDER_LOCAL_FASTER_WHISPER),
            }
            if fallback_enabled && allow_cloud_fallback {
                providers.push(cloud_provider);
            }
        }
        WhisperRuntime::Cloud => {
            providers.push(cloud_provider);
            if fallback_enabled && allow_local_fallback {
                if profile == AsrProfile::Accurate {
                    providers.push(PROVIDER_LOCAL_WHISPERX);
                }
                providers.push(PROVIDER_LOCAL_FASTER_WHISPER);
            }
        }
    }

    let mut deduped: Vec<String> = Vec::new();
    for provider in providers {
        if !deduped.iter().any(|existing| existing == provider) {
            deduped.push(provider.to_string());
        }
    }
    Ok(deduped)
}

/// One dispatch invocation.
#[derive(Clone, Debug)]
pub struct AsrDispatchRequest {
    pub audio_path: PathBuf,
    pub whisper: WhisperOptions,
    pub profile: AsrProfile,
    pub fallback_enabled: bool,
    pub allow_cloud_fallback: bool,
    pub allow_local_fallback: bool,
    pub enable_diarization: bool,
}

/// First-success result of walking the chain.
#[derive(Clone, Debug)]
pub struct AsrDispatchOutcome {
    pub segments: Vec<AsrSegment>,
    pub provider_effective: String,
    pub attempts: Vec<String>,
    pub fallback_used: bool,
    pub runtime_effective: WhisperRuntime,
    pub model_effective: String,
}

/// Executes the provider chain. Local runtimes plug in as
/// [`LocalAsrBackend`] ports; the model-handle caches are shared with them
/// through [`AsrModelCaches`].
pub struct AsrDispatcher {
    cloud: CloudAsrClient,
    backends: Vec<Arc<dyn LocalAsrBackend>>,
    caches: Arc<AsrModelCaches>,
}

impl AsrDispatcher {
    pub fn new(
        cloud: CloudAsrClient,
        backends: Vec<Arc<dyn LocalAsrBackend>>,
    ) -> Self {
        Self {
            cloud,
            backends,
            caches: Arc::new(AsrModelCaches::new()),
        }
    }

    /// Shared model-handle caches, for backend construction.
    #[must_use]
    pub fn caches(&self) -> Arc<AsrModelCaches> {
        Arc::clone(&self.caches)
    }

    fn backend(&self, provider_id: &str) -> Option<&Arc<dyn LocalAsrBackend>> {
        self.backends
            .iter()
            .find(|backend| backend.provider_id() == provider_id)
    }

    /// Walk the chain; first success returns, every failure is recorded.
    pub async fn dispatch(
        &self,
        request: &AsrDispatchRequest,
        cancel: &CancelCheck,
        progress: &(dyn Fn(u8, &str) + Send + Sync),
    ) -> StageResult<AsrDispatchOutcome> {
        let providers = resolve_provider_chain(
            &request.whisper,
            request.profile,
            request.fallback_enabled,
            request.allow_cloud_fallback,
            request.allow_local_fallback,
        )?;
        if providers.is_empty() {
            return Err(PipelineError::new(
                stage::ASR,
                ErrorCode::AsrProviderChainEmpty,
                "no usable ASR provider chain could be built",
            ));
        }

        let mut attempt_errors: Vec<serde_json::Value> = Vec::new();
        for (index, provider) in providers.iter().enumerate() {
            if cancel() {
                return Err(PipelineError::cancel_requested(stage::ASR));
            }
            progress(30, &format!("preparing recognition engine: {provider}"));

            let attempt = self.run_provider(provider, request).await;
            match attempt {
                Ok((segments, runtime_effective, model_effective)) => {
                    return Ok(AsrDispatchOutcome {
                        segments,
                        provider_effective: provider.clone(),
                        attempts: providers[..=index].to_vec(),
                        fallback_used: index > 0,
                        runtime_effective,
                        model_effective,
                    });
                }
                Err(error) => {
                    if error.is_cancel() {
                        return Err(error);
                    }
                    tracing::warn!(
                        target: "sublingo.asr",
                        provider = %provider,
                        code = error.code.as_str(),
                        message = %error.message,
                        "asr provider attempt failed"
                    );
                    attempt_errors.push(json!({
                        "provider": provider,
                        "code": error.code.as_str(),
                        "message": error.message,
                    }));
                }
            }
        }

        let detail = json!({
            "attempts": providers,
            "errors": attempt_errors,
        });
        Err(PipelineError::new(
            stage::ASR,
            ErrorCode::AsrAllProvidersFailed,
            "every ASR provider in the chain failed",
        )
        .with_detail(crate::llm::client::truncate(&detail.to_string(), 4_000)))
    }

    async fn run_provider(
        &self,
        provider: &str,
        request: &AsrDispatchRequest,
    ) -> StageResult<(Vec<AsrSegment>, WhisperRuntime, String)> {
        match provider {
            PROVIDER_CLOUD_PARAFORMER | PROVIDER_CLOUD_QWEN_FILETRANS => {
                let model = resolve_cloud_model(&request.whisper.model);
                let label = if model == CLOUD_MODEL_QWEN_FILETRANS {
                    "Qwen ASR"
                } else {
                    "Paraformer"
                };
                let segments = self
                    .cloud
                    .transcribe(&request.audio_path, &request.whisper, model, label)
                    .await?;
                Ok((segments, WhisperRuntime::Cloud, model.to_string()))
            }
            PROVIDER_LOCAL_FASTER_WHISPER => {
                let backend = self.backend(provider).ok_or_else(|| {
                    PipelineError::new(
                        stage::ASR,
                        ErrorCode::LocalRuntimeMissing,
                        "faster-whisper runtime is not available",
                    )
                })?;
                let segments = self.run_local(backend, request).await?;
                let model = request
                    .whisper
                    .effective_local_model(request.profile);
                Ok((segments, WhisperRuntime::Local, model))
            }
            PROVIDER_LOCAL_WHISPERX => {
                let backend = self.backend(provider).ok_or_else(|| {
                    PipelineError::new(
                        stage::ASR,
                        ErrorCode::LocalWhisperxMissing,
                        "whisperx runtime is not available",
                    )
                })?;
                let segments = self.run_local(backend, request).await?;
                if segments.is_empty() {
                    return Err(PipelineError::new(
                        stage::ASR,
                        ErrorCode::LocalWhisperxEmptySegments,
                        "whisperx returned no segments",
                    ));
                }
                let model = request
                    .whisper
                    .effective_local_model(request.profile);
                Ok((segments, WhisperRuntime::Local, model))
            }
            other => Err(PipelineError::new(
                stage::ASR,
                ErrorCode::AsrProviderUnknown,
                format!("unknown ASR provider: {other}"),
            )),
        }
    }

    async fn run_local(
        &self,
        backend: &Arc<dyn LocalAsrBackend>,
        request: &AsrDispatchRequest,
    ) -> StageResult<Vec<AsrSegment>> {
        request.whisper.validate_local_model()?;
        let local_request = LocalAsrRequest {
            audio_path: request.audio_path.clone(),
            model: request.whisper.effective_local_model(request.profile),
            language: request.whisper.language.trim().to_string(),
            enable_diarization: request.enable_diarization,
            hf_token: {
                let token = request.whisper.hf_token.trim();
                (!token.is_empty()).then(|| token.to_string())
            },
        };
        backend.transcribe(&local_request).await
    }
}

/// Flatten segment words into the global word stream, dropping empty or
/// invalid entries and assigning 1-based ids.
#[must_use]
pub fn flatten_word_segments(segments: &[AsrSegment], source: WordSource) -> Vec<WordSegment> {
    let mut flattened: Vec<WordSegment> = Vec::new();
    for (segment_index, segment) in segments.iter().enumerate() {
        for word in &segment.words {
            let text = word.word.trim();
            if text.is_empty()
                || !word.start.is_finite()
                || !word.end.is_finite()
                || word.start < 0.0
                || word.end <= word.start
            {
                continue;
            }
            flattened.push(WordSegment {
                id: u32::try_from(flattened.len() + 1).unwrap_or(u32::MAX),
                start: round3(word.start),
                end: round3(word.end),
                word: text.to_string(),
                confidence: word.confidence,
                asr_segment_index: u32::try_from(segment_index).unwrap_or(u32::MAX),
                source,
            });
        }
    }
    flattened
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sublingo_core::{AsrWord, never_cancel};

    fn whisper(runtime: WhisperRuntime, model: &str) -> WhisperOptions {
        WhisperOptions {
            runtime,
            model: model.to_string(),
            ..WhisperOptions::default()
        }
    }

    fn chain(
        runtime: WhisperRuntime,
        model: &str,
        profile: AsrProfile,
        fallback: bool,
        allow_cloud: bool,
        allow_local: bool,
    ) -> Vec<String> {
        resolve_provider_chain(
            &whisper(runtime, model),
            profile,
            fallback,
            allow_cloud,
            allow_local,
        )
        .unwrap()
    }

    #[test]
    fn cloud_chain_variants() {
        assert_eq!(
            chain(WhisperRuntime::Cloud, "paraformer-v2", AsrProfile::Balanced, false, false, false),
            vec![PROVIDER_CLOUD_PARAFORMER]
        );
        assert_eq!(
            chain(WhisperRuntime::Cloud, "paraformer-v2", AsrProfile::Balanced, true, false, true),
            vec![PROVIDER_CLOUD_PARAFORMER, PROVIDER_LOCAL_FASTER_WHISPER]
        );
        assert_eq!(
            chain(WhisperRuntime::Cloud, "qwen3-asr-flash-filetrans", AsrProfile::Accurate, true, false, true),
            vec![
                PROVIDER_CLOUD_QWEN_FILETRANS,
                PROVIDER_LOCAL_WHISPERX,
                PROVIDER_LOCAL_FASTER_WHISPER,
            ]
        );
        // Fallback disabled: local never appended
        assert_eq!(
            chain(WhisperRuntime::Cloud, "paraformer-v2", AsrProfile::Accurate, false, false, true),
            vec![PROVIDER_CLOUD_PARAFORMER]
        );
    }

    #[test]
    fn local_chain_variants() {
        assert_eq!(
            chain(WhisperRuntime::Local, "small", AsrProfile::Balanced, false, false, false),
            vec![PROVIDER_LOCAL_FASTER_WHISPER]
        );
        assert_eq!(
            chain(WhisperRuntime::Local, "large-v3", AsrProfile::Accurate, false, false, false),
            vec![PROVIDER_LOCAL_WHISPERX]
        );
        assert_eq!(
            chain(WhisperRuntime::Local, "large-v3", AsrProfile::Accurate, true, false, false),
            vec![PROVIDER_LOCAL_WHISPERX, PROVIDER_LOCAL_FASTER_WHISPER]
        );
        assert_eq!(
            chain(WhisperRuntime::Local, "small", AsrProfile::Fast, true, true, false),
            vec![PROVIDER_LOCAL_FASTER_WHISPER, PROVIDER_CLOUD_PARAFORMER]
        );
    }

    #[test]
    fn unknown_cloud_model_defaults_to_paraformer() {
        assert_eq!(resolve_cloud_model("whisper-1"), CLOUD_MODEL_PARAFORMER);
        assert_eq!(
            resolve_cloud_provider("qwen3-asr-flash-filetrans"),
            PROVIDER_CLOUD_QWEN_FILETRANS
        );
    }

    #[test]
    fn flatten_assigns_ids_and_drops_invalid() {
        let segments = vec![
            AsrSegment {
                start: 0.0,
                end: 1.5,
                text: "hello world".into(),
                words: vec![
                    AsrWord { word: "hello".into(), start: 0.0, end: 0.5, confidence: Some(0.9) },
                    AsrWord { word: "  ".into(), start: 0.5, end: 0.6, confidence: None },
                    AsrWord { word: "world".into(), start: 0.6, end: 0.5, confidence: None },
                ],
            },
            AsrSegment {
                start: 1.6,
                end: 2.0,
                text: "how".into(),
                words: vec![AsrWord { word: "how".into(), start: 1.6, end: 2.0, confidence: None }],
            },
        ];
        let words = flatten_word_segments(&segments, WordSource::Cloud);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].id, 1);
        assert_eq!(words[0].asr_segment_index, 0);
        assert_eq!(words[1].id, 2);
        assert_eq!(words[1].asr_segment_index, 1);
        assert_eq!(words[1].source, WordSource::Cloud);
    }

    struct FakeBackend {
        id: &'static str,
        calls: AtomicUsize,
        result: StageResult<Vec<AsrSegment>>,
    }

    #[async_trait]
    impl LocalAsrBackend for FakeBackend {
        fn provider_id(&self) -> &'static str {
            self.id
        }

        async fn transcribe(
            &self,
            _request: &LocalAsrRequest,
        ) -> Result<Vec<AsrSegment>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn segment() -> AsrSegment {
        AsrSegment {
            start: 0.0,
            end: 1.0,
            text: "hi".into(),
            words: vec![AsrWord { word: "hi".into(), start: 0.0, end: 1.0, confidence: None }],
        }
    }

    fn dispatcher_with(backends: Vec<Arc<dyn LocalAsrBackend>>) -> AsrDispatcher {
        AsrDispatcher::new(CloudAsrClient::new(CLOUD_ASR_TIMEOUT).unwrap(), backends)
    }

    fn local_request(model: &str, profile: AsrProfile, fallback: bool) -> AsrDispatchRequest {
        AsrDispatchRequest {
            audio_path: PathBuf::from("/tmp/raw.wav"),
            whisper: whisper(WhisperRuntime::Local, model),
            profile,
            fallback_enabled: fallback,
            allow_cloud_fallback: false,
            allow_local_fallback: false,
            enable_diarization: false,
        }
    }

    #[tokio::test]
    async fn first_success_wins_without_fallback_flag() {
        let backend = Arc::new(FakeBackend {
            id: PROVIDER_LOCAL_FASTER_WHISPER,
            calls: AtomicUsize::new(0),
            result: Ok(vec![segment()]),
        });
        let dispatcher = dispatcher_with(vec![backend.clone()]);
        let outcome = dispatcher
            .dispatch(
                &local_request("small", AsrProfile::Balanced, false),
                &never_cancel(),
                &|_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(outcome.provider_effective, PROVIDER_LOCAL_FASTER_WHISPER);
        assert!(!outcome.fallback_used);
        assert_eq!(outcome.runtime_effective, WhisperRuntime::Local);
        assert_eq!(outcome.model_effective, "small");
        assert_eq!(outcome.attempts, vec![PROVIDER_LOCAL_FASTER_WHISPER]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_chain_reports_attempts() {
        let whisperx = Arc::new(FakeBackend {
            id: PROVIDER_LOCAL_WHISPERX,
            calls: AtomicUsize::new(0),
            result: Err(PipelineError::new(
                stage::ASR,
                ErrorCode::LocalWhisperxFailed,
                "alignment model crashed",
            )),
        });
        let faster = Arc::new(FakeBackend {
            id: PROVIDER_LOCAL_FASTER_WHISPER,
            calls: AtomicUsize::new(0),
            result: Ok(vec![segment()]),
        });
        let dispatcher = dispatcher_with(vec![whisperx, faster]);
        let outcome = dispatcher
            .dispatch(
                &local_request("large-v3", AsrProfile::Accurate, true),
                &never_cancel(),
                &|_, _| {},
            )
            .await
            .unwrap();

        assert!(outcome.fallback_used);
        assert_eq!(outcome.provider_effective, PROVIDER_LOCAL_FASTER_WHISPER);
        assert_eq!(
            outcome.attempts,
            vec![PROVIDER_LOCAL_WHISPERX, PROVIDER_LOCAL_FASTER_WHISPER]
        );
    }

    #[tokio::test]
    async fn all_failed_aggregates_attempt_errors() {
        let whisperx = Arc::new(FakeBackend {
            id: PROVIDER_LOCAL_WHISPERX,
            calls: AtomicUsize::new(0),
            result: Err(PipelineError::new(
                stage::ASR,
                ErrorCode::LocalWhisperxFailed,
                "boom",
            )),
        });
        // faster-whisper backend absent entirely
        let dispatcher = dispatcher_with(vec![whisperx]);
        let err = dispatcher
            .dispatch(
                &local_request("large-v3", AsrProfile::Accurate, true),
                &never_cancel(),
                &|_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::AsrAllProvidersFailed);
        let detail = err.detail.unwrap();
        assert!(detail.contains("local_whisperx_failed"));
        assert!(detail.contains("local_runtime_missing"));
    }

    #[tokio::test]
    async fn invalid_local_model_rejected_before_backend_runs() {
        let backend = Arc::new(FakeBackend {
            id: PROVIDER_LOCAL_FASTER_WHISPER,
            calls: AtomicUsize::new(0),
            result: Ok(vec![segment()]),
        });
        let dispatcher = dispatcher_with(vec![backend.clone()]);
        let err = dispatcher
            .dispatch(
                &local_request("paraformer-v2", AsrProfile::Balanced, false),
                &never_cancel(),
                &|_, _| {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::AsrAllProvidersFailed);
        assert!(err.detail.unwrap().contains("invalid_whisper_model"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_chain() {
        let dispatcher = dispatcher_with(vec![]);
        let cancel: CancelCheck = Arc::new(|| true);
        let err = dispatcher
            .dispatch(
                &local_request("small", AsrProfile::Balanced, false),
                &cancel,
                &|_, _| {},
            )
            .await
            .unwrap_err();
        assert!(err.is_cancel());
    }
}
