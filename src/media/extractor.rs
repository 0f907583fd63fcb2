//! C4 — SegmentExtractor. One-pass extraction at a list of cut points using
//! the transcoder's segment muxer, plus short "extended" per-cut segments
//! used as ASR input (SPEC_FULL.md §4.4). Grounded on the teacher's
//! `ffmpeg::command::FFmpegCommand` builder style and `audio::media_pipeline`
//! for command assembly, and the `other_examples` chapterizer's
//! `split_by_chapters_with_cover` for the copy-first/transcode-fallback
//! policy.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::constants::{IPOD_INCOMPATIBLE_EXTENSIONS, TRIM_FALLBACK_SAMPLE_RATE_HZ};
use crate::media::runner::{self, ProcessRegistry, Transcoder};

/// Result of a single extraction pass. `asr_segments` are the short
/// lead-in clips meant for the (out-of-scope) ASR collaborator; the caller
/// owns their lifetime and deletes them once transcription has consumed
/// them — see the extractor entry in DESIGN.md for why this crate does not
/// delete them synchronously inside `extract`.
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub segments: Vec<PathBuf>,
    pub asr_segments: Vec<PathBuf>,
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("m4a")
        .to_lowercase()
}

fn forced_segment_extension(source_extension: &str) -> String {
    if IPOD_INCOMPATIBLE_EXTENSIONS.contains(&source_extension) {
        "aac".to_string()
    } else {
        source_extension.to_string()
    }
}

/// Extracts segments from `path` at each of `cut_points` (ascending,
/// `< total_duration_secs`), additionally producing a short ASR lead-in
/// clip per cut. `allow_fallback` controls whether a failed stream-copy
/// attempt falls back to a mono PCM re-encode.
pub async fn extract(
    path: &Path,
    cut_points: &[f64],
    total_duration_secs: f64,
    segment_length_secs: f64,
    min_clip_length_secs: f64,
    out_dir: &Path,
    allow_fallback: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<ExtractionOutput>> {
    if cut_points.is_empty() {
        return Ok(Some(ExtractionOutput { segments: Vec::new(), asr_segments: Vec::new() }));
    }
    if cut_points.windows(2).any(|w| w[0] >= w[1]) {
        return Err(AppError::InvariantViolated("cut points must be strictly ascending".to_string()));
    }

    let source_extension = extension_of(path);
    let segment_extension = forced_segment_extension(&source_extension);

    let starts_at_zero = cut_points[0] == 0.0;
    let piece_count = if starts_at_zero { cut_points.len() } else { cut_points.len() + 1 };
    let pattern = out_dir.join(format!("piece_%0{}d.{}", piece_count.to_string().len().max(3), segment_extension));

    let segment_times = cut_points
        .iter()
        .map(|t| format!("{t:.3}"))
        .collect::<Vec<_>>()
        .join(",");

    let segments =
        run_segmented_extraction(path, &pattern, &segment_times, allow_fallback, cancel.clone(), registry).await?;

    let Some(()) = segments else {
        return Ok(None);
    };

    // Rename the kept pieces into their final `segment_<ts_ms>.<ext>` form.
    let mut final_segments = Vec::with_capacity(cut_points.len());
    let digits = piece_count.to_string().len().max(3);
    let first_kept_piece = if starts_at_zero { 0 } else { 1 };

    for (i, cut) in cut_points.iter().enumerate() {
        let piece_index = first_kept_piece + i;
        let piece_path = out_dir.join(format!("piece_{:0width$}.{}", piece_index, segment_extension, width = digits));
        let final_name = out_dir.join(format!("segment_{}.{}", (cut * 1000.0).round() as i64, segment_extension));
        if piece_path.exists() {
            tokio::fs::rename(&piece_path, &final_name).await.map_err(AppError::Io)?;
            final_segments.push(final_name);
        }
    }

    // Drop the leading piece (before the first cut) if present and unused.
    if !starts_at_zero {
        let leading = out_dir.join(format!("piece_{:0width$}.{}", 0, segment_extension, width = digits));
        if leading.exists() {
            let _ = tokio::fs::remove_file(&leading).await;
        }
    }

    let mut asr_segments = Vec::with_capacity(cut_points.len());
    for (i, &cut) in cut_points.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let next_cut = cut_points.get(i + 1).copied().unwrap_or(total_duration_secs);
        let end = (cut + segment_length_secs).min(next_cut - min_clip_length_secs).max(cut);
        let asr_path = out_dir.join(format!("asr_{}.{}", Uuid::new_v4(), segment_extension));
        let extracted = extract_range(path, cut, end, &asr_path, allow_fallback, cancel.clone(), registry).await?;
        match extracted {
            Some(true) => asr_segments.push(asr_path),
            Some(false) => {} // source too short for this window; skip silently
            None => return Ok(None),
        }
    }

    Ok(Some(ExtractionOutput { segments: final_segments, asr_segments }))
}

async fn run_segmented_extraction(
    path: &Path,
    pattern: &Path,
    segment_times: &str,
    allow_fallback: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<()>> {
    let binary = Transcoder.locate()?;

    let copy_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-f".to_string(),
        "segment".to_string(),
        "-segment_times".to_string(),
        segment_times.to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        pattern.to_string_lossy().to_string(),
    ];

    let outcome = runner::run_capture(&copy_argv, |_| {}, cancel.clone(), registry, "segment_extract").await?;

    if outcome.cancelled {
        return Ok(None);
    }
    if outcome.success {
        return Ok(Some(()));
    }
    if !allow_fallback {
        return Err(AppError::ToolFailed(format!("segment extraction failed for {}", path.display())));
    }

    let reencode_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-ac".to_string(),
        "1".to_string(),
        "-ar".to_string(),
        TRIM_FALLBACK_SAMPLE_RATE_HZ.to_string(),
        "-f".to_string(),
        "segment".to_string(),
        "-segment_times".to_string(),
        segment_times.to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        pattern.to_string_lossy().to_string(),
    ];
    let fallback_outcome = runner::run_capture(&reencode_argv, |_| {}, cancel, registry, "segment_extract_fallback").await?;
    if fallback_outcome.cancelled {
        return Ok(None);
    }
    if !fallback_outcome.success {
        return Err(AppError::ToolFailed(format!("segment extraction fallback failed for {}", path.display())));
    }
    Ok(Some(()))
}

/// Extracts `[start, end)` of `path` into `dest` with copy-first/re-encode
/// fallback. Returns `Ok(Some(false))` if the requested range is empty
/// (end <= start), so the caller can skip it without treating it as an error.
pub async fn extract_range(
    path: &Path,
    start: f64,
    end: f64,
    dest: &Path,
    allow_fallback: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<bool>> {
    if end <= start {
        return Ok(Some(false));
    }

    let binary = Transcoder.locate()?;
    let duration = end - start;

    let copy_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-ss".to_string(),
        format!("{start:.3}"),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{duration:.3}"),
        "-c".to_string(),
        "copy".to_string(),
        dest.to_string_lossy().to_string(),
    ];

    let outcome = runner::run_capture(&copy_argv, |_| {}, cancel.clone(), registry, "segment_range").await?;
    if outcome.cancelled {
        return Ok(None);
    }
    if outcome.success {
        return Ok(Some(true));
    }
    if !allow_fallback {
        return Err(AppError::ToolFailed(format!("range extraction failed for {}", path.display())));
    }

    let reencode_argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-ss".to_string(),
        format!("{start:.3}"),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{duration:.3}"),
        "-ac".to_string(),
        "1".to_string(),
        "-ar".to_string(),
        TRIM_FALLBACK_SAMPLE_RATE_HZ.to_string(),
        dest.to_string_lossy().to_string(),
    ];
    let fallback_outcome = runner::run_capture(&reencode_argv, |_| {}, cancel, registry, "segment_range_fallback").await?;
    if fallback_outcome.cancelled {
        return Ok(None);
    }
    if !fallback_outcome.success {
        return Err(AppError::ToolFailed(format!("range extraction fallback failed for {}", path.display())));
    }
    Ok(Some(true))
}

/// Extracts `[sub_start, sub_end)` of `path`, additionally splitting the
/// extraction at `local_cut_points` (offsets relative to `sub_start`) in a
/// single segment-muxer invocation, returning one file per resulting piece
/// in order. Used by the partial-rescan subroutine to avoid one subprocess
/// per kept/dropped sub-interval (SPEC_FULL.md §4.12).
pub async fn extract_subrange_split(
    path: &Path,
    sub_start: f64,
    sub_end: f64,
    local_cut_points: &[f64],
    out_dir: &Path,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<Vec<PathBuf>>> {
    if sub_end <= sub_start {
        return Ok(Some(Vec::new()));
    }

    let source_extension = extension_of(path);
    let segment_extension = forced_segment_extension(&source_extension);
    let piece_count = local_cut_points.len() + 1;
    let digits = piece_count.to_string().len().max(3);
    let run_id = Uuid::new_v4();
    let pattern = out_dir.join(format!("partial_{run_id}_%0{digits}d.{segment_extension}"));

    let binary = Transcoder.locate()?;
    let mut argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-ss".to_string(),
        format!("{sub_start:.3}"),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{:.3}", sub_end - sub_start),
        "-c".to_string(),
        "copy".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-f".to_string(),
        "segment".to_string(),
    ];
    if !local_cut_points.is_empty() {
        let segment_times = local_cut_points.iter().map(|t| format!("{t:.3}")).collect::<Vec<_>>().join(",");
        argv.push("-segment_times".to_string());
        argv.push(segment_times);
    }
    argv.push(pattern.to_string_lossy().to_string());

    let outcome = runner::run_capture(&argv, |_| {}, cancel, registry, "partial_rescan_split").await?;
    if outcome.cancelled {
        return Ok(None);
    }
    if !outcome.success {
        return Err(AppError::ToolFailed(format!("partial rescan split failed for {}", path.display())));
    }

    let mut pieces = Vec::with_capacity(piece_count);
    for i in 0..piece_count {
        let piece_path = out_dir.join(format!("partial_{run_id}_{:0width$}.{segment_extension}", i, width = digits));
        if piece_path.exists() {
            pieces.push(piece_path);
        }
    }
    Ok(Some(pieces))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forces_aac_extension_for_m4b_family() {
        assert_eq!(forced_segment_extension("m4b"), "aac");
        assert_eq!(forced_segment_extension("m4a"), "aac");
        assert_eq!(forced_segment_extension("mp4"), "aac");
    }

    #[test]
    fn keeps_extension_for_other_containers() {
        assert_eq!(forced_segment_extension("mp3"), "mp3");
        assert_eq!(forced_segment_extension("wav"), "wav");
    }

    #[tokio::test]
    async fn empty_cut_points_returns_empty_output() {
        let out = extract(
            Path::new("/nonexistent.m4b"),
            &[],
            100.0,
            8.0,
            1.0,
            Path::new("/tmp"),
            true,
            CancelToken::new(),
            None,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(out.segments.is_empty());
        assert!(out.asr_segments.is_empty());
    }

    #[tokio::test]
    async fn non_ascending_cut_points_rejected() {
        let result = extract(
            Path::new("/nonexistent.m4b"),
            &[10.0, 5.0],
            100.0,
            8.0,
            1.0,
            Path::new("/tmp"),
            true,
            CancelToken::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }
}
