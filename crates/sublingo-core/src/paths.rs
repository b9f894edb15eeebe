//! Job work-directory layout.
//!
//! ```text
//! <work_dir>/
//!   input/<sanitized-filename>     uploaded artifact (file jobs)
//!   <downloaded>.mp4               fetched media (url jobs)
//!   audio/raw.wav                  16 kHz mono
//!   log/asr_segments.json
//!   log/word_segments.json
//!   output/src.srt
//!   output/src_trans.srt
//! ```

use std::path::{Path, PathBuf};

/// Typed view over one job's work directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    #[must_use]
    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    #[must_use]
    pub fn audio_wav(&self) -> PathBuf {
        self.audio_dir().join("raw.wav")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    #[must_use]
    pub fn asr_segments_json(&self) -> PathBuf {
        self.log_dir().join("asr_segments.json")
    }

    #[must_use]
    pub fn word_segments_json(&self) -> PathBuf {
        self.log_dir().join("word_segments.json")
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    #[must_use]
    pub fn source_srt(&self) -> PathBuf {
        self.output_dir().join("src.srt")
    }

    #[must_use]
    pub fn bilingual_srt(&self) -> PathBuf {
        self.output_dir().join("src_trans.srt")
    }

    /// Create the standard subdirectories.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.input_dir()).await?;
        tokio::fs::create_dir_all(self.audio_dir()).await?;
        tokio::fs::create_dir_all(self.log_dir()).await?;
        tokio::fs::create_dir_all(self.output_dir()).await?;
        Ok(())
    }
}

/// Remove a directory tree, ignoring every error. Retention sweeps and
/// consume-time cleanup must never fail the caller.
pub fn safe_remove_tree(path: &Path) {
    if path.as_os_str().is_empty() || !path.exists() {
        return;
    }
    if let Err(error) = std::fs::remove_dir_all(path) {
        tracing::debug!(
            target: "sublingo.paths",
            path = %path.display(),
            error = %error,
            "work dir removal failed"
        );
    }
}

/// Keep only filename-safe characters in an uploaded name.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
    let name = Path::new(raw)
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let work = WorkDir::new("/tmp/job-1");
        assert_eq!(work.audio_wav(), PathBuf::from("/tmp/job-1/audio/raw.wav"));
        assert_eq!(
            work.source_srt(),
            PathBuf::from("/tmp/job-1/output/src.srt")
        );
        assert_eq!(
            work.bilingual_srt(),
            PathBuf::from("/tmp/job-1/output/src_trans.srt")
        );
    }

    #[tokio::test]
    async fn ensure_creates_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let work = WorkDir::new(tmp.path().join("job"));
        work.ensure().await.unwrap();
        assert!(work.input_dir().is_dir());
        assert!(work.log_dir().is_dir());
        assert!(work.output_dir().is_dir());
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_filename("My Video (1).mp4"), "My_Video__1_.mp4");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("???"), "upload");
    }

    #[test]
    fn safe_remove_ignores_missing() {
        safe_remove_tree(Path::new("/nonexistent/sublingo-test-dir"));
    }
}
