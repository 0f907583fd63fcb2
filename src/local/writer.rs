//! C8 — LocalChapterWriter. Muxer-correct rewrite of chapter metadata into a
//! single backing file, or per-file track-title write across a grouped
//! folder (SPEC_FULL.md §4.8). Grounded on the teacher's `metadata::writer`
//! tag-rewrite style (probe-then-rewrite, `.achew.bak` backup naming is this
//! crate's analogue of the teacher's save-in-place discipline) generalized
//! from Lofty tag fields to the transcoder's ffmetadata chapter document.

use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::constants::{IPOD_INCOMPATIBLE_EXTENSIONS, PROBE_DEADLINE_QUICK_SECS};
use crate::media::runner::{self, probe, ProcessRegistry, Prober, Transcoder};

/// Tolerance within which a grouped submit's selected chapter timestamps
/// must match their file's start position (SPEC_FULL.md §4.8, §4.12).
pub const GROUPED_ALIGNMENT_TOLERANCE_SECS: f64 = 0.75;

fn extension_of(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase()
}

fn forced_muxer(extension: &str) -> Option<&'static str> {
    if IPOD_INCOMPATIBLE_EXTENSIONS.contains(&extension) {
        Some("mp4")
    } else {
        None
    }
}

fn sanitize_title(title: &str) -> String {
    title.replace(['\n', '\r'], " ").trim().to_string()
}

/// Builds the ffmetadata chapter document: a header line, then one
/// `[CHAPTER]` block per chapter with a `1/1000` timebase and integer
/// `START`/`END` in milliseconds (SPEC_FULL.md §4.8, §6).
fn build_chapter_document(chapters: &[(f64, String)], duration_secs: f64) -> String {
    let mut normalized = chapters.to_vec();
    if let Some(first) = normalized.first_mut() {
        if first.0 > 0.0 {
            first.0 = 0.0;
        }
    }

    let mut doc = String::from(";FFMETADATA1\n");
    for (i, (start, title)) in normalized.iter().enumerate() {
        let end = normalized.get(i + 1).map(|(s, _)| *s).unwrap_or(duration_secs);
        let start_ms = (start * 1000.0).round() as i64;
        let end_ms = (end * 1000.0).round() as i64;
        doc.push_str("[CHAPTER]\n");
        doc.push_str("TIMEBASE=1/1000\n");
        doc.push_str(&format!("START={start_ms}\n"));
        doc.push_str(&format!("END={end_ms}\n"));
        doc.push_str(&format!("title={}\n", sanitize_title(title)));
    }
    doc
}

async fn make_backup(path: &Path) -> Result<()> {
    let backup_path = PathBuf::from(format!("{}.achew.bak", path.display()));
    tokio::fs::copy(path, &backup_path).await.map_err(AppError::Io)?;
    Ok(())
}

/// Rewrites the chapters of a single local file in place. Probes the
/// input's duration, writes a `.achew.bak` backup if requested, then
/// invokes the transcoder to copy all streams through while replacing the
/// chapter table, writing to a sibling `.achew.tmp<ext>` before an atomic
/// rename over the original (SPEC_FULL.md §4.8).
pub async fn write_single_file(
    path: &Path,
    chapters: &[(f64, String)],
    create_backup: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<()> {
    if chapters.is_empty() {
        return Err(AppError::InvariantViolated("cannot write an empty chapter list".to_string()));
    }

    let info = probe(&Prober, path, std::time::Duration::from_secs(PROBE_DEADLINE_QUICK_SECS)).await?;
    let document = build_chapter_document(chapters, info.duration_secs);

    let metadata_path = path.with_extension("achew.chapters.txt");
    tokio::fs::write(&metadata_path, document.as_bytes()).await.map_err(AppError::Io)?;

    let cleanup_metadata = || {
        let metadata_path = metadata_path.clone();
        async move {
            let _ = tokio::fs::remove_file(&metadata_path).await;
        }
    };

    if create_backup {
        if let Err(e) = make_backup(path).await {
            cleanup_metadata().await;
            return Err(e);
        }
    }

    let extension = extension_of(path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let tmp_path = path.with_file_name(format!("{stem}.achew.tmp.{extension}"));

    let binary = match Transcoder.locate() {
        Ok(b) => b,
        Err(e) => {
            cleanup_metadata().await;
            return Err(e);
        }
    };

    let mut argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-i".to_string(),
        metadata_path.to_string_lossy().to_string(),
        "-map_metadata".to_string(),
        "1".to_string(),
        "-map_chapters".to_string(),
        "1".to_string(),
        "-codec".to_string(),
        "copy".to_string(),
    ];
    if let Some(muxer) = forced_muxer(&extension) {
        argv.push("-f".to_string());
        argv.push(muxer.to_string());
    }
    argv.push(tmp_path.to_string_lossy().to_string());

    let outcome = runner::run_capture(&argv, |_| {}, cancel, registry, "chapter_write").await;
    cleanup_metadata().await;

    let outcome = outcome?;
    if outcome.cancelled {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(AppError::Cancelled);
    }
    if !outcome.success {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(AppError::ToolFailed(format!("chapter write failed for {}", path.display())));
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(AppError::Io)?;
    Ok(())
}

/// Verifies that every selected chapter timestamp lies within
/// [`GROUPED_ALIGNMENT_TOLERANCE_SECS`] of its corresponding file's start
/// on the concatenated timeline. Must be called, and must succeed, before
/// [`write_grouped_titles`] touches any file (SPEC_FULL.md §4.8, §4.12).
pub fn verify_grouped_alignment(file_starts: &[f64], chapter_starts: &[f64]) -> Result<()> {
    if file_starts.len() != chapter_starts.len() {
        return Err(AppError::InvariantViolated(format!(
            "grouped submit needs one chapter per file: {} files, {} chapters",
            file_starts.len(),
            chapter_starts.len()
        )));
    }

    for (i, (&file_start, &chapter_start)) in file_starts.iter().zip(chapter_starts.iter()).enumerate() {
        let delta = (file_start - chapter_start).abs();
        if delta > GROUPED_ALIGNMENT_TOLERANCE_SECS {
            return Err(AppError::InvariantViolated(format!(
                "chapter {i} at {chapter_start:.3}s is {delta:.3}s from file start {file_start:.3}s, exceeding the {GROUPED_ALIGNMENT_TOLERANCE_SECS}s tolerance"
            )));
        }
    }

    Ok(())
}

/// Writes one title per file as the container's `title` tag, in lockstep.
/// Callers must call [`verify_grouped_alignment`] first; this function does
/// not re-derive file-start alignment, only the length guard.
pub async fn write_grouped_titles(
    files: &[PathBuf],
    titles: &[String],
    create_backup: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<()> {
    if files.len() != titles.len() {
        return Err(AppError::InvariantViolated(format!(
            "grouped title write needs one title per file: {} files, {} titles",
            files.len(),
            titles.len()
        )));
    }

    for (file, title) in files.iter().zip(titles.iter()) {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        if create_backup {
            make_backup(file).await?;
        }

        let extension = extension_of(file);
        let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        let tmp_path = file.with_file_name(format!("{stem}.achew.tmp.{extension}"));

        let binary = Transcoder.locate()?;
        let mut argv = vec![
            binary.to_string_lossy().to_string(),
            "-y".to_string(),
            "-i".to_string(),
            file.to_string_lossy().to_string(),
            "-map".to_string(),
            "0".to_string(),
            "-codec".to_string(),
            "copy".to_string(),
            "-metadata".to_string(),
            format!("title={}", sanitize_title(title)),
        ];
        if let Some(muxer) = forced_muxer(&extension) {
            argv.push("-f".to_string());
            argv.push(muxer.to_string());
        }
        argv.push(tmp_path.to_string_lossy().to_string());

        let outcome = runner::run_capture(&argv, |_| {}, cancel.clone(), registry, "grouped_title_write").await?;
        if outcome.cancelled {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::Cancelled);
        }
        if !outcome.success {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::ToolFailed(format!("title write failed for {}", file.display())));
        }

        tokio::fs::rename(&tmp_path, file).await.map_err(AppError::Io)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_document_normalizes_nonzero_first_start_to_zero() {
        let chapters = vec![(5.0, "Intro".to_string()), (120.0, "Chapter 1".to_string())];
        let doc = build_chapter_document(&chapters, 200.0);
        assert!(doc.contains("START=0\n"));
        assert!(doc.contains("title=Intro\n"));
    }

    #[test]
    fn chapter_document_end_of_last_chapter_is_duration() {
        let chapters = vec![(0.0, "A".to_string()), (100.0, "B".to_string())];
        let doc = build_chapter_document(&chapters, 250.0);
        let blocks: Vec<&str> = doc.split("[CHAPTER]").skip(1).collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("END=100000\n"));
        assert!(blocks[1].contains("END=250000\n"));
    }

    #[test]
    fn chapter_document_titles_collapse_newlines_and_trim() {
        let chapters = vec![(0.0, "  Chapter\nOne  \r\n".to_string())];
        let doc = build_chapter_document(&chapters, 60.0);
        assert!(doc.contains("title=Chapter One\n"));
    }

    #[test]
    fn forces_mp4_muxer_for_ipod_incompatible_extensions() {
        assert_eq!(forced_muxer("m4b"), Some("mp4"));
        assert_eq!(forced_muxer("m4a"), Some("mp4"));
        assert_eq!(forced_muxer("mp4"), Some("mp4"));
        assert_eq!(forced_muxer("mp3"), None);
    }

    #[test]
    fn grouped_alignment_accepts_within_tolerance() {
        let file_starts = vec![0.0, 600.0, 1500.0];
        let chapter_starts = vec![0.0, 600.3, 1499.5];
        assert!(verify_grouped_alignment(&file_starts, &chapter_starts).is_ok());
    }

    #[test]
    fn grouped_alignment_rejects_beyond_tolerance() {
        let file_starts = vec![0.0, 600.0, 1500.0];
        let chapter_starts = vec![0.0, 600.3, 1498.0];
        assert!(verify_grouped_alignment(&file_starts, &chapter_starts).is_err());
    }

    #[test]
    fn grouped_alignment_rejects_mismatched_counts() {
        let file_starts = vec![0.0, 600.0];
        let chapter_starts = vec![0.0];
        assert!(matches!(
            verify_grouped_alignment(&file_starts, &chapter_starts),
            Err(AppError::InvariantViolated(_))
        ));
    }

    #[tokio::test]
    async fn write_single_file_rejects_empty_chapter_list() {
        let result = write_single_file(
            Path::new("/nonexistent.m4b"),
            &[],
            false,
            CancelToken::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }

    #[tokio::test]
    async fn write_grouped_titles_rejects_mismatched_counts() {
        let result = write_grouped_titles(
            &[PathBuf::from("a.m4a")],
            &[],
            false,
            CancelToken::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }
}
