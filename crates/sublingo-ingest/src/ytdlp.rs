//! yt-dlp discovery and subprocess driving.
//!
//! Discovery order: explicit entry script, auto-discovered checkouts under
//! the configured search roots, explicit executable, PATH, python-module
//! invocation. The download loop polls the child so cancellation and the
//! timeout are observed without interrupting a blocked read.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use sublingo_core::{ErrorCode, PipelineError, StageResult, YtDlpSettings, now_ms, stage};

/// Bound on auto-discovered entry scripts.
const AUTO_DISCOVER_LIMIT: usize = 20;

/// Bound on directory recursion while scanning a search root.
const AUTO_DISCOVER_MAX_DEPTH: usize = 4;

/// Poll interval for the child process.
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Output extensions that are sidecars, never the downloaded media.
const SIDECAR_SUFFIXES: [&str; 13] = [
    "part", "ytdl", "json", "description", "jpg", "jpeg", "png", "webp", "vtt", "srt", "ass",
    "lrc", "txt",
];

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// One way to invoke yt-dlp, with a human-readable source tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YtDlpCommand {
    pub argv: Vec<String>,
    pub source: String,
}

fn python_executable() -> Option<PathBuf> {
    which::which("python3").or_else(|_| which::which("python")).ok()
}

/// Scan a root for `yt_dlp/__main__.py`, bounded by depth and count.
fn discover_entries_under(root: &Path, found: &mut Vec<PathBuf>) {
    fn walk(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
        if depth > AUTO_DISCOVER_MAX_DEPTH || found.len() >= AUTO_DISCOVER_LIMIT {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if found.len() >= AUTO_DISCOVER_LIMIT {
                return;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if path.file_name().is_some_and(|name| name == "yt_dlp") {
                let main = path.join("__main__.py");
                if main.is_file() && !found.contains(&main) {
                    found.push(main);
                    continue;
                }
            }
            walk(&path, depth + 1, found);
        }
    }

    // Common checkout layout first, then the bounded scan
    let direct = root.join("yt-dlp").join("yt_dlp").join("__main__.py");
    if direct.is_file() && !found.contains(&direct) {
        found.push(direct);
    }
    walk(root, 0, found);
}

/// Build the ordered, deduplicated invocation list.
#[must_use]
pub fn resolve_commands(settings: &YtDlpSettings) -> Vec<YtDlpCommand> {
    let mut commands: Vec<YtDlpCommand> = Vec::new();
    let python = python_executable();

    let explicit_entry = settings
        .local_entry
        .as_ref()
        .filter(|entry| entry.is_file());
    if let (Some(entry), Some(python)) = (explicit_entry, python.as_ref()) {
        commands.push(YtDlpCommand {
            argv: vec![
                python.display().to_string(),
                entry.display().to_string(),
            ],
            source: format!("local-entry:{}", entry.display()),
        });
    } else if let Some(python) = python.as_ref() {
        let mut discovered = Vec::new();
        for root in &settings.search_roots {
            if !root.is_dir() {
                continue;
            }
            discover_entries_under(root, &mut discovered);
            if discovered.len() >= AUTO_DISCOVER_LIMIT {
                break;
            }
        }
        for entry in discovered {
            commands.push(YtDlpCommand {
                argv: vec![
                    python.display().to_string(),
                    entry.display().to_string(),
                ],
                source: format!("auto-discovered:{}", entry.display()),
            });
        }
    }

    if let Some(executable) = &settings.executable {
        let value = executable.display().to_string();
        if !value.trim().is_empty() {
            commands.push(YtDlpCommand {
                argv: vec![value.clone()],
                source: format!("env-exec:{value}"),
            });
        }
    }

    if let Ok(path_exec) = which::which("yt-dlp") {
        commands.push(YtDlpCommand {
            argv: vec![path_exec.display().to_string()],
            source: format!("path-exec:{}", path_exec.display()),
        });
    }

    if let Some(python) = python {
        commands.push(YtDlpCommand {
            argv: vec![
                python.display().to_string(),
                "-m".to_string(),
                "yt_dlp".to_string(),
            ],
            source: "python-module:yt_dlp".to_string(),
        });
    }

    let mut deduped: Vec<YtDlpCommand> = Vec::new();
    for command in commands {
        if !deduped.iter().any(|existing| existing.argv == command.argv) {
            deduped.push(command);
        }
    }
    deduped
}

/// Run one yt-dlp invocation until completion, cancellation, or timeout.
///
/// Progress is a time-based pseudo-percent (5 + 3·elapsed_sec, clamped to
/// 95) so observers see motion even when yt-dlp's own progress cannot be
/// parsed reliably.
pub async fn run_download(
    command: &YtDlpCommand,
    source_url: &str,
    output_root: &Path,
    cancel: &(dyn Fn() -> bool + Send + Sync),
    on_progress: &(dyn Fn(u8, &str) + Send + Sync),
    timeout: Duration,
) -> StageResult<PathBuf> {
    tokio::fs::create_dir_all(output_root).await.map_err(|e| {
        PipelineError::new(
            stage::DOWNLOAD_SOURCE,
            ErrorCode::DownloadFailed,
            "could not create download directory",
        )
        .with_detail(e.to_string())
    })?;

    let marker = format!("source_{}", now_ms());
    let output_template = output_root.join(format!("{marker}.%(ext)s"));

    let (program, prefix_args) = command
        .argv
        .split_first()
        .ok_or_else(|| {
            PipelineError::new(
                stage::DOWNLOAD_SOURCE,
                ErrorCode::YtDlpLaunchFailed,
                "empty yt-dlp invocation",
            )
        })?;

    let mut child = Command::new(program)
        .args(prefix_args)
        .arg("--no-playlist")
        .arg("--no-progress")
        .arg("--newline")
        .arg("--restrict-filenames")
        .arg("--format")
        .arg("bv*+ba/b")
        .arg("--merge-output-format")
        .arg("mp4")
        .arg("--output")
        .arg(&output_template)
        .arg("--")
        .arg(source_url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| {
            PipelineError::new(
                stage::DOWNLOAD_SOURCE,
                ErrorCode::YtDlpLaunchFailed,
                "could not launch the yt-dlp download process",
            )
            .with_detail(truncate(&error.to_string(), 500))
        })?;

    // Drain the pipes concurrently so the child never blocks on them
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let started = std::time::Instant::now();
    let mut last_progress_second = u64::MAX;
    let exit_status = loop {
        if cancel() {
            terminate(&mut child).await;
            return Err(PipelineError::new(
                stage::DOWNLOAD_SOURCE,
                ErrorCode::CancelRequested,
                "cancellation requested, download stopped",
            ));
        }

        if let Ok(Some(status)) = child.try_wait() {
            break status;
        }

        let elapsed = started.elapsed();
        let elapsed_sec = elapsed.as_secs();
        if elapsed_sec != last_progress_second {
            #[allow(clippy::cast_possible_truncation)]
            let pseudo_percent = (5 + elapsed_sec.saturating_mul(3)).min(95) as u8;
            on_progress(pseudo_percent, "resolving and downloading source media");
            last_progress_second = elapsed_sec;
        }
        if elapsed > timeout {
            terminate(&mut child).await;
            return Err(PipelineError::new(
                stage::DOWNLOAD_SOURCE,
                ErrorCode::DownloadTimeout,
                "download timed out, try again later",
            )
            .with_detail(format!("timeout_seconds={}", timeout.as_secs())));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if !exit_status.success() {
        return Err(PipelineError::new(
            stage::DOWNLOAD_SOURCE,
            ErrorCode::YtDlpCommandFailed,
            "the yt-dlp download command failed",
        )
        .with_detail(build_failure_detail(&stdout, &stderr)));
    }

    let Some(resolved) = resolve_downloaded_file(output_root, &marker).await else {
        return Err(PipelineError::new(
            stage::DOWNLOAD_SOURCE,
            ErrorCode::DownloadOutputMissing,
            "download finished but no usable media file was produced",
        )
        .with_detail(build_failure_detail(&stdout, &stderr)));
    };

    on_progress(100, "download complete, preparing audio extraction");
    Ok(resolved)
}

fn spawn_reader(
    stream: Option<impl AsyncReadExt + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer).await;
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

async fn terminate(child: &mut tokio::process::Child) {
    if child.start_kill().is_err() {
        return;
    }
    let _ = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
}

/// Pick the newest non-empty, non-sidecar `marker.*` file.
async fn resolve_downloaded_file(output_root: &Path, marker: &str) -> Option<PathBuf> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    let mut entries = tokio::fs::read_dir(output_root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&format!("{marker}.")) {
            continue;
        }
        let suffix = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if SIDECAR_SUFFIXES.contains(&suffix.as_str()) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() || metadata.len() == 0 {
            continue;
        }
        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(stamp, _)| modified > *stamp) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, path)| path)
}

fn build_failure_detail(stdout: &str, stderr: &str) -> String {
    let merged = format!("{}\n{}", stderr.trim(), stdout.trim());
    let collapsed = WHITESPACE_RUN.replace_all(merged.trim(), " ").into_owned();
    if collapsed.is_empty() {
        "yt-dlp command failed without diagnostic output".to_string()
    } else {
        truncate(&collapsed, 700)
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_executable_is_listed() {
        let settings = YtDlpSettings {
            executable: Some(PathBuf::from("/opt/tools/yt-dlp")),
            ..YtDlpSettings::default()
        };
        let commands = resolve_commands(&settings);
        assert!(commands.iter().any(|c| c.source.starts_with("env-exec:")));
    }

    #[test]
    fn commands_are_deduplicated() {
        let settings = YtDlpSettings::default();
        let commands = resolve_commands(&settings);
        for (i, a) in commands.iter().enumerate() {
            for b in commands.iter().skip(i + 1) {
                assert_ne!(a.argv, b.argv);
            }
        }
    }

    #[test]
    fn discovery_finds_checkout_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let entry_dir = tmp.path().join("yt-dlp").join("yt_dlp");
        std::fs::create_dir_all(&entry_dir).unwrap();
        std::fs::write(entry_dir.join("__main__.py"), "#").unwrap();

        let mut found = Vec::new();
        discover_entries_under(tmp.path(), &mut found);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("yt_dlp/__main__.py"));
    }

    #[test]
    fn failure_detail_collapses_whitespace() {
        let detail = build_failure_detail("line one\n\nline two", "ERROR:   something\nbad");
        assert!(!detail.contains('\n'));
        assert!(detail.starts_with("ERROR: something bad"));
    }

    #[tokio::test]
    async fn resolve_skips_sidecars_and_empty_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        tokio::fs::write(root.join("source_1.mp4.part"), b"x").await.unwrap();
        tokio::fs::write(root.join("source_1.json"), b"{}").await.unwrap();
        tokio::fs::write(root.join("source_1.webm"), b"").await.unwrap();
        tokio::fs::write(root.join("source_1.mp4"), b"media").await.unwrap();
        tokio::fs::write(root.join("other_2.mp4"), b"media").await.unwrap();

        let resolved = resolve_downloaded_file(root, "source_1").await.unwrap();
        assert!(resolved.ends_with("source_1.mp4"));

        assert!(resolve_downloaded_file(root, "source_9").await.is_none());
    }

    #[tokio::test]
    async fn run_download_reports_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let command = YtDlpCommand {
            argv: vec!["/nonexistent/definitely-not-yt-dlp".to_string()],
            source: "test".to_string(),
        };
        let err = run_download(
            &command,
            "https://example.com/v",
            tmp.path(),
            &|| false,
            &|_, _| {},
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::YtDlpLaunchFailed);
    }

    #[tokio::test]
    async fn run_download_observes_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        // `sh -c 'sleep 30'` stands in for a long-running downloader; the
        // appended yt-dlp arguments land in the script's positional params
        let command = YtDlpCommand {
            argv: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            source: "test".to_string(),
        };
        let err = run_download(
            &command,
            "https://example.com/v",
            tmp.path(),
            &|| true,
            &|_, _| {},
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::CancelRequested);
    }

    #[tokio::test]
    async fn run_download_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let command = YtDlpCommand {
            argv: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            source: "test".to_string(),
        };
        let err = run_download(
            &command,
            "https://example.com/v",
            tmp.path(),
            &|| false,
            &|_, _| {},
            Duration::from_millis(400),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::DownloadTimeout);
    }

    #[tokio::test]
    async fn run_download_surfaces_command_failure() {
        let tmp = tempfile::tempdir().unwrap();
        // `false` exits non-zero immediately; extra args are ignored
        let command = YtDlpCommand {
            argv: vec!["false".to_string()],
            source: "test".to_string(),
        };
        let err = run_download(
            &command,
            "https://example.com/v",
            tmp.path(),
            &|| false,
            &|_, _| {},
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::YtDlpCommandFailed);
    }
}
