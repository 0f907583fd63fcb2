//! C6 — Concatenator. Gapless concatenation of an ordered list of files via
//! the transcoder's concat demuxer, with a copy-mux-first / PCM-WAV-fallback
//! chain (SPEC_FULL.md §4.6). Grounded on the teacher's
//! `ffmpeg::command::FFmpegCommand::create_concat_list` and
//! `format_concat_file_line` for the list-file escaping discipline.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::constants::{
    FALLBACK_SAMPLE_RATE_HZ, FFMPEG_CONCAT_FORMAT, FFMPEG_CONCAT_SAFE_MODE,
};
use crate::media::runner::{self, ProcessRegistry, Transcoder};

/// Escapes a path for inclusion in an ffmpeg concat-demuxer list file:
/// single quotes are the list format's only metacharacter, escaped as
/// `'\''`. Mirrors the teacher's `format_concat_file_line`.
fn format_concat_file_line(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let escaped = raw.replace('\'', r"'\''");
    format!("file '{escaped}'\n")
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("m4a")
        .to_lowercase()
}

/// Concatenates `files` in order into a new file under `out_dir`. Never
/// writes into any input's parent directory — callers must pass the
/// pipeline's own temp workspace as `out_dir` (SPEC_FULL.md §5). Returns
/// `Ok(None)` if cancelled before completion.
pub async fn concat<P>(
    files: &[PathBuf],
    total_duration_hint_secs: f64,
    out_dir: &Path,
    on_progress: P,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<PathBuf>>
where
    P: FnMut(f32),
{
    if files.is_empty() {
        return Err(AppError::InvariantViolated("concat requires at least one file".to_string()));
    }
    for file in files {
        if let Some(parent) = file.parent() {
            if parent == out_dir {
                return Err(AppError::InvariantViolated(
                    "concat source file must not live in the output directory".to_string(),
                ));
            }
        }
    }

    let list_path = out_dir.join(format!("concat_{}.txt", Uuid::new_v4()));
    let mut list_contents = String::new();
    for file in files {
        list_contents.push_str(&format_concat_file_line(file));
    }
    tokio::fs::write(&list_path, &list_contents).await.map_err(AppError::Io)?;

    let result = run_concat(files, &list_path, total_duration_hint_secs, out_dir, on_progress, cancel, registry).await;

    let _ = tokio::fs::remove_file(&list_path).await;

    result
}

async fn run_concat<P>(
    files: &[PathBuf],
    list_path: &Path,
    total_duration_hint_secs: f64,
    out_dir: &Path,
    mut on_progress: P,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<PathBuf>>
where
    P: FnMut(f32),
{
    let binary = Transcoder.locate()?;
    let extension = extension_of(&files[0]);
    let output_path = out_dir.join(format!("concatenated_{}.{extension}", Uuid::new_v4()));

    let copy_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-f".to_string(),
        FFMPEG_CONCAT_FORMAT.to_string(),
        "-safe".to_string(),
        FFMPEG_CONCAT_SAFE_MODE.to_string(),
        "-i".to_string(),
        list_path.to_string_lossy().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        output_path.to_string_lossy().to_string(),
    ];

    let outcome = runner::run_with_progress(
        &copy_argv,
        total_duration_hint_secs,
        &mut on_progress,
        cancel.clone(),
        registry,
        "concat",
    )
    .await?;

    if outcome.cancelled {
        let _ = tokio::fs::remove_file(&output_path).await;
        return Ok(None);
    }
    if outcome.success {
        return Ok(Some(output_path));
    }

    // Fallback: mono-allowed PCM WAV at 44.1kHz.
    let fallback_path = out_dir.join(format!("concatenated_{}.wav", Uuid::new_v4()));
    let fallback_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-f".to_string(),
        FFMPEG_CONCAT_FORMAT.to_string(),
        "-safe".to_string(),
        FFMPEG_CONCAT_SAFE_MODE.to_string(),
        "-i".to_string(),
        list_path.to_string_lossy().to_string(),
        "-ar".to_string(),
        FALLBACK_SAMPLE_RATE_HZ.to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        fallback_path.to_string_lossy().to_string(),
    ];

    let fallback_outcome = runner::run_with_progress(
        &fallback_argv,
        total_duration_hint_secs,
        &mut on_progress,
        cancel,
        registry,
        "concat_fallback",
    )
    .await?;

    if fallback_outcome.cancelled {
        let _ = tokio::fs::remove_file(&fallback_path).await;
        return Ok(None);
    }
    if !fallback_outcome.success {
        return Err(AppError::ToolFailed("concatenation failed (copy and fallback)".to_string()));
    }

    Ok(Some(fallback_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_single_quotes_in_path() {
        let path = Path::new("/media/book's chapter.m4a");
        let line = format_concat_file_line(path);
        assert_eq!(line, "file '/media/book'\\''s chapter.m4a'\n");
    }

    #[test]
    fn plain_path_round_trips_without_escaping() {
        let path = Path::new("/media/chapter1.m4a");
        let line = format_concat_file_line(path);
        assert_eq!(line, "file '/media/chapter1.m4a'\n");
    }

    #[tokio::test]
    async fn rejects_empty_file_list() {
        let dir = tempfile::tempdir().unwrap();
        let result = concat(&[], 100.0, dir.path(), |_| {}, CancelToken::new(), None).await;
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }

    #[tokio::test]
    async fn rejects_source_in_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.m4a");
        tokio::fs::write(&file, b"").await.unwrap();
        let result = concat(&[file], 100.0, dir.path(), |_| {}, CancelToken::new(), None).await;
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }
}
