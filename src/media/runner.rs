//! C1 — MediaProcessRunner. Spawns the transcoder/prober as subprocesses,
//! streams stderr line-by-line, parses progress, and enforces the
//! graceful-then-kill cancellation contract (SPEC_FULL.md §4.1).
//!
//! Grounded on the teacher's `audio::progress_monitor` (process lifecycle,
//! `check_cancellation_and_kill_context`) and `audio::progress`
//! (`parse_ffmpeg_progress`), and `audio::cleanup::ProcessGuard` for the
//! registry/termination shape.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::constants::{MEDIA_TOOL_SENTINEL_EXIT_CODES, PROCESS_TERMINATION_CHECK_DELAY_MS, PROCESS_TERMINATION_MAX_ATTEMPTS};

pub struct Transcoder;
impl MediaTool for Transcoder {
    fn binary_name(&self) -> &str {
        "ffmpeg"
    }
}

pub struct Prober;
impl MediaTool for Prober {
    fn binary_name(&self) -> &str {
        "ffprobe"
    }
}

/// Supervisor-owned registry of in-flight subprocess ids, so cancellation
/// and crash cleanup can account for every spawned process even across
/// concurrent stages. Mirrors the teacher's `ProcessGuard` registration
/// pattern, generalized from a single guarded child to a shared table.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<u32, &'static str>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        ProcessRegistry::default()
    }

    async fn register(&self, pid: u32, label: &'static str) {
        self.inner.lock().await.insert(pid, label);
    }

    async fn deregister(&self, pid: u32) {
        self.inner.lock().await.remove(&pid);
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Outcome of a stderr-captured subprocess run.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub success: bool,
    pub cancelled: bool,
    pub stderr_tail: String,
}

/// A single parsed line of the media tool's progress output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    SilenceStart(f64),
    SilenceEnd(f64),
    OutTimeMs(u64),
    ProgressEnd,
    Other,
}

/// Parses a single stderr/progress line. Recognizes `silence_start:`/
/// `silence_end:` (silencedetect filter) and the structured `key=value`
/// progress channel's `out_time_ms=`/`progress=end` entries
/// (SPEC_FULL.md §4.1).
pub fn parse_progress_line(line: &str) -> ProgressLine {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("silence_start:") {
        if let Ok(value) = rest.trim().parse::<f64>() {
            return ProgressLine::SilenceStart(value);
        }
    }
    if let Some(rest) = line.strip_prefix("silence_end:") {
        // silence_end lines are sometimes followed by "| silence_duration: X"
        let first_token = rest.trim().split('|').next().unwrap_or("").trim();
        if let Ok(value) = first_token.parse::<f64>() {
            return ProgressLine::SilenceEnd(value);
        }
    }
    if let Some(rest) = line.strip_prefix("out_time_ms=") {
        if let Ok(value) = rest.trim().parse::<u64>() {
            return ProgressLine::OutTimeMs(value);
        }
    }
    if line == "progress=end" {
        return ProgressLine::ProgressEnd;
    }

    ProgressLine::Other
}

/// True if `status` matches one of the tool's reserved "terminated"/"missing
/// input" sentinel exits, or if the process was killed by signal with no
/// exit code at all — both are surfaced as `Cancelled`, never a generic
/// failure (SPEC_FULL.md §6: "sentinel values reserved for termination and
/// missing input are treated as `Cancelled`").
fn is_sentinel_exit(status: &std::process::ExitStatus) -> bool {
    match status.code() {
        Some(code) => MEDIA_TOOL_SENTINEL_EXIT_CODES.contains(&code),
        None => true,
    }
}

/// Runs `argv[0]` with `argv[1..]`, capturing stderr line by line and
/// invoking `on_line` for each. Cancellation-aware: if `cancel` fires before
/// the process exits, it is terminated gracefully then force-killed after
/// ~2s (SPEC_FULL.md §4.1, §5).
pub async fn run_capture<F>(
    argv: &[String],
    mut on_line: F,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
    label: &'static str,
) -> Result<ExitInfo>
where
    F: FnMut(&str),
{
    if argv.is_empty() {
        return Err(AppError::ToolFailed("empty command line".to_string()));
    }

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| AppError::ToolFailed(format!("failed to spawn {}: {e}", argv[0])))?;

    if let (Some(pid), Some(registry)) = (child.id(), registry) {
        registry.register(pid, label).await;
    }

    let stderr = child.stderr.take().expect("stderr was piped");
    let mut lines = BufReader::new(stderr).lines();
    let mut stderr_tail = String::new();

    loop {
        if cancel.is_cancelled() {
            terminate(&mut child).await?;
            if let (Some(pid), Some(registry)) = (child.id(), registry) {
                registry.deregister(pid).await;
            }
            return Ok(ExitInfo { success: false, cancelled: true, stderr_tail });
        }

        let next = tokio::select! {
            line = lines.next_line() => line.map_err(AppError::Io)?,
            _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
        };

        match next {
            Some(line) => {
                // A broken or hostile callback must never take down this
                // stage task (SPEC_FULL.md §7).
                let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_line(&line)));
                if guarded.is_err() {
                    log::warn!("stderr line callback panicked; ignoring");
                }
                stderr_tail.push_str(&line);
                stderr_tail.push('\n');
                if stderr_tail.len() > 8192 {
                    let overflow = stderr_tail.len() - 8192;
                    stderr_tail.drain(0..overflow);
                }
            }
            None => break,
        }
    }

    if let Some(pid) = child.id() {
        if let Some(registry) = registry {
            registry.deregister(pid).await;
        }
    }

    if cancel.is_cancelled() {
        let _ = child.wait().await;
        return Ok(ExitInfo { success: false, cancelled: true, stderr_tail });
    }

    let status = child.wait().await.map_err(AppError::Io)?;
    if is_sentinel_exit(&status) {
        // The tool exited with its own terminated/missing-input sentinel
        // even though our cancel token never fired (e.g. killed externally,
        // or input vanished mid-run) — still non-fatal, not a tool failure.
        return Ok(ExitInfo { success: false, cancelled: true, stderr_tail });
    }
    Ok(ExitInfo { success: status.success(), cancelled: false, stderr_tail })
}

/// Like [`run_capture`] but additionally tracks `out_time_ms` progress
/// against `duration_hint_secs` and invokes `on_progress` with a
/// percentage in `[0, 100]`.
pub async fn run_with_progress<P>(
    argv: &[String],
    duration_hint_secs: f64,
    mut on_progress: P,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
    label: &'static str,
) -> Result<ExitInfo>
where
    P: FnMut(f32),
{
    let duration_us = (duration_hint_secs * 1_000_000.0).max(1.0);
    run_capture(
        argv,
        |line| match parse_progress_line(line) {
            ProgressLine::OutTimeMs(us) => {
                let pct = ((us as f64 / duration_us) * 100.0).clamp(0.0, 100.0);
                on_progress(pct as f32);
            }
            ProgressLine::ProgressEnd => on_progress(100.0),
            _ => {}
        },
        cancel,
        registry,
        label,
    )
    .await
}

/// Graceful-then-kill: sends a terminate signal, polls `try_wait` for up to
/// `PROCESS_TERMINATION_MAX_ATTEMPTS * PROCESS_TERMINATION_CHECK_DELAY_MS`
/// (~2s), then force-kills and reaps. Never panics.
pub async fn terminate(child: &mut Child) -> Result<()> {
    let _ = child.start_kill();

    for _ in 0..PROCESS_TERMINATION_MAX_ATTEMPTS {
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(PROCESS_TERMINATION_CHECK_DELAY_MS)).await;
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeChapterTags {
    title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeChapterRaw {
    start_time: Option<serde_json::Value>,
    tags: Option<ProbeChapterTags>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProbeDocument {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    chapters: Vec<ProbeChapterRaw>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeChapter {
    pub start_secs: f64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub duration_secs: f64,
    pub has_audio_stream: bool,
    pub chapters: Vec<ProbeChapter>,
}

fn parse_time_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Probes `path` with the `Prober` tool: `-print_format json -show_format
/// -show_streams -show_chapters`. Honors `deadline` (SPEC_FULL.md §5).
pub async fn probe(prober: &Prober, path: &Path, deadline: Duration) -> Result<ProbeInfo> {
    let binary = prober.locate()?;
    let argv = vec![
        binary.to_string_lossy().to_string(),
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        "-show_chapters".to_string(),
        path.to_string_lossy().to_string(),
    ];

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());

    let child = command
        .spawn()
        .map_err(|e| AppError::ToolFailed(format!("failed to spawn prober: {e}")))?;

    let output = tokio::time::timeout(deadline, child.wait_with_output())
        .await
        .map_err(|_| AppError::ToolFailed("probe timed out".to_string()))?
        .map_err(AppError::Io)?;

    if !output.status.success() {
        return Err(AppError::InputMissing(format!(
            "probe failed for {}",
            path.display()
        )));
    }

    let document: ProbeDocument = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::ParseError(format!("invalid probe JSON: {e}")))?;

    let duration_secs = document
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let has_audio_stream = document
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let chapters = document
        .chapters
        .into_iter()
        .map(|c| ProbeChapter {
            start_secs: c.start_time.as_ref().and_then(parse_time_value).unwrap_or(0.0),
            title: c.tags.and_then(|t| t.title),
        })
        .collect();

    Ok(ProbeInfo { duration_secs, has_audio_stream, chapters })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_silence_start() {
        assert_eq!(parse_progress_line("silence_start: 12.345"), ProgressLine::SilenceStart(12.345));
    }

    #[test]
    fn parses_silence_end_with_duration_suffix() {
        assert_eq!(
            parse_progress_line("silence_end: 14.5 | silence_duration: 2.155"),
            ProgressLine::SilenceEnd(14.5)
        );
    }

    #[test]
    fn parses_out_time_ms() {
        assert_eq!(parse_progress_line("out_time_ms=1500000"), ProgressLine::OutTimeMs(1_500_000));
    }

    #[test]
    fn parses_progress_end() {
        assert_eq!(parse_progress_line("progress=end"), ProgressLine::ProgressEnd);
    }

    #[test]
    fn unrecognized_line_is_other() {
        assert_eq!(parse_progress_line("frame=  120 fps=30"), ProgressLine::Other);
    }

    #[test]
    fn parse_time_value_accepts_string_and_number() {
        assert_eq!(parse_time_value(&serde_json::json!("12.5")), Some(12.5));
        assert_eq!(parse_time_value(&serde_json::json!(12.5)), Some(12.5));
    }

    #[tokio::test]
    async fn registry_tracks_and_clears_pids() {
        let registry = ProcessRegistry::new();
        registry.register(1234, "test").await;
        assert_eq!(registry.active_count().await, 1);
        registry.deregister(1234).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn run_capture_reports_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let result = run_capture(&argv, |_| {}, cancel, None, "test").await.unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn run_capture_surfaces_stderr_lines() {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo silence_start: 1.0 1>&2".to_string(),
        ];
        let mut seen = Vec::new();
        let result = run_capture(&argv, |line| seen.push(line.to_string()), CancelToken::new(), None, "test")
            .await
            .unwrap();
        assert!(result.success);
        assert!(seen.iter().any(|l| l.contains("silence_start")));
    }

    #[tokio::test]
    async fn run_capture_surfaces_tool_sentinel_exit_as_cancelled() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 255".to_string()];
        let result = run_capture(&argv, |_| {}, CancelToken::new(), None, "test").await.unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
    }

    #[test]
    fn is_sentinel_exit_recognizes_reserved_codes() {
        assert!(MEDIA_TOOL_SENTINEL_EXIT_CODES.contains(&254));
        assert!(MEDIA_TOOL_SENTINEL_EXIT_CODES.contains(&255));
        assert!(!MEDIA_TOOL_SENTINEL_EXIT_CODES.contains(&1));
    }
}
