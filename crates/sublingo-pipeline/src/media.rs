//! FFmpeg health probe and audio extraction.

use std::path::Path;

use tokio::process::Command;
use tokio::sync::Mutex;

use sublingo_core::{ErrorCode, PipelineError, StageResult, stage};

use crate::llm::client::truncate;

/// Checked-once FFmpeg availability probe.
///
/// The check runs at most once per probe instance; later calls reuse the
/// cached verdict.
#[derive(Debug, Default)]
pub struct FfmpegProbe {
    checked: Mutex<Option<Result<(), String>>>,
}

impl FfmpegProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `ffmpeg` answers `-version`. Missing binary is
    /// `ffmpeg_missing`.
    pub async fn ensure_available(&self) -> StageResult<()> {
        let mut checked = self.checked.lock().await;
        if let Some(verdict) = checked.as_ref() {
            return verdict.clone().map_err(|message| {
                PipelineError::new(stage::EXTRACT_AUDIO, ErrorCode::FfmpegMissing, message)
            });
        }

        let verdict = match Command::new("ffmpeg").arg("-version").output().await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(format!(
                "ffmpeg -version exited with {}",
                output.status.code().unwrap_or(-1)
            )),
            Err(error) => Err(format!("ffmpeg not found on PATH: {error}")),
        };
        *checked = Some(verdict.clone());
        verdict.map_err(|message| {
            PipelineError::new(stage::EXTRACT_AUDIO, ErrorCode::FfmpegMissing, message)
        })
    }
}

/// Extract mono 16 kHz WAV from the source media.
pub async fn extract_audio(video_path: &Path, audio_path: &Path) -> StageResult<()> {
    if let Some(parent) = audio_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            PipelineError::new(
                stage::EXTRACT_AUDIO,
                ErrorCode::FfmpegExtractFailed,
                "could not create audio directory",
            )
            .with_detail(e.to_string())
        })?;
    }

    let output = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(video_path)
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg("16000")
        .arg("-f")
        .arg("wav")
        .arg(audio_path)
        .output()
        .await
        .map_err(|error| {
            PipelineError::new(
                stage::EXTRACT_AUDIO,
                ErrorCode::FfmpegExtractFailed,
                "could not launch ffmpeg",
            )
            .with_detail(error.to_string())
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::new(
            stage::EXTRACT_AUDIO,
            ErrorCode::FfmpegExtractFailed,
            "audio extraction failed",
        )
        .with_detail(truncate(&stderr, 700)));
    }

    let usable = tokio::fs::metadata(audio_path)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false);
    if !usable {
        return Err(PipelineError::new(
            stage::EXTRACT_AUDIO,
            ErrorCode::FfmpegExtractFailed,
            "ffmpeg produced no audio output",
        ));
    }

    tracing::debug!(
        target: "sublingo.media",
        video = %video_path.display(),
        audio = %audio_path.display(),
        "audio extracted"
    );
    Ok(())
}

/// The source media must exist and be non-empty before extraction starts.
pub async fn validate_media_file(path: &Path) -> StageResult<()> {
    let usable = tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false);
    if usable {
        Ok(())
    } else {
        Err(PipelineError::new(
            stage::EXTRACT_AUDIO,
            ErrorCode::FfmpegExtractFailed,
            "source media file is missing or empty",
        )
        .with_detail(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validate_rejects_missing_and_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing.mp4");
        assert!(validate_media_file(&missing).await.is_err());

        let empty = tmp.path().join("empty.mp4");
        tokio::fs::write(&empty, b"").await.unwrap();
        assert!(validate_media_file(&empty).await.is_err());

        let ok = tmp.path().join("ok.mp4");
        tokio::fs::write(&ok, b"data").await.unwrap();
        assert!(validate_media_file(&ok).await.is_ok());
    }

    #[tokio::test]
    async fn probe_caches_its_verdict() {
        let probe = FfmpegProbe::new();
        let first = probe.ensure_available().await;
        let second = probe.ensure_available().await;
        // Identical verdicts regardless of whether ffmpeg exists here
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
