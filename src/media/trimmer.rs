//! C5 — Trimmer. Cuts each segment at its longest internal silence to
//! exclude the next chapter's opening words, re-using [`crate::media::silence`]
//! internally (SPEC_FULL.md §4.5).

use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::constants::{TRIM_CUT_OFFSET_SECS, TRIM_FALLBACK_SAMPLE_RATE_HZ, TRIM_MIN_SILENCE_START_SECS};
use crate::media::runner::{self, ProcessRegistry, Transcoder};
use crate::model::DetectedSilence;

fn pick_trim_point(silences: &[DetectedSilence]) -> Option<f64> {
    silences
        .iter()
        .filter(|s| s.start_secs >= TRIM_MIN_SILENCE_START_SECS)
        .max_by(|a, b| a.duration_secs().partial_cmp(&b.duration_secs()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|s| s.start_secs + TRIM_CUT_OFFSET_SECS)
}

/// Trims each of `segment_paths` to end at its longest qualifying internal
/// silence. A per-file failure falls back to a verbatim copy rather than
/// failing the whole batch.
pub async fn trim(
    segment_paths: &[PathBuf],
    out_dir: &Path,
    copy_only: bool,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<Vec<PathBuf>>> {
    let mut trimmed = Vec::with_capacity(segment_paths.len());

    for segment in segment_paths {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let dest = out_dir.join(format!(
            "trimmed_{}",
            segment.file_name().and_then(|n| n.to_str()).unwrap_or("segment.m4a")
        ));

        if copy_only {
            copy_through(segment, &dest, cancel.clone(), registry).await?;
            trimmed.push(dest);
            continue;
        }

        let silences = crate::media::silence::detect(
            segment,
            crate::media::silence::default_threshold_db(),
            1.0,
            0.0,
            cancel.clone(),
            registry,
        )
        .await?;

        let silences = match silences {
            Some(s) => s,
            None => return Ok(None),
        };

        match pick_trim_point(&silences) {
            Some(cut_at) => {
                let result = cut_to(segment, cut_at, &dest, cancel.clone(), registry).await?;
                match result {
                    Some(true) => trimmed.push(dest),
                    Some(false) => {
                        // Trim failed; fall back to a verbatim copy rather
                        // than failing the batch (SPEC_FULL.md §4.5).
                        copy_through(segment, &dest, cancel.clone(), registry).await?;
                        trimmed.push(dest);
                    }
                    None => return Ok(None),
                }
            }
            None => {
                copy_through(segment, &dest, cancel.clone(), registry).await?;
                trimmed.push(dest);
            }
        }
    }

    Ok(Some(trimmed))
}

async fn cut_to(
    source: &Path,
    cut_at_secs: f64,
    dest: &Path,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<bool>> {
    let binary = Transcoder.locate()?;
    let argv = vec![
        binary.to_string_lossy().to_string(),
        "-y".to_string(),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-t".to_string(),
        format!("{cut_at_secs:.3}"),
        "-c".to_string(),
        "copy".to_string(),
        dest.to_string_lossy().to_string(),
    ];
    let outcome = runner::run_capture(&argv, |_| {}, cancel, registry, "trim").await?;
    if outcome.cancelled {
        return Ok(None);
    }
    Ok(Some(outcome.success))
}

async fn copy_through(source: &Path, dest: &Path, cancel: CancelToken, registry: Option<&ProcessRegistry>) -> Result<()> {
    let is_wav = source.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("wav")).unwrap_or(false);
    let binary = Transcoder.locate()?;

    let argv = if is_wav {
        vec![
            binary.to_string_lossy().to_string(),
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-ar".to_string(),
            TRIM_FALLBACK_SAMPLE_RATE_HZ.to_string(),
            dest.to_string_lossy().to_string(),
        ]
    } else {
        vec![
            binary.to_string_lossy().to_string(),
            "-y".to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            dest.to_string_lossy().to_string(),
        ]
    };

    let outcome = runner::run_capture(&argv, |_| {}, cancel, registry, "trim_copy").await?;
    if !outcome.success && !outcome.cancelled {
        return Err(AppError::ToolFailed(format!("copy-through failed for {}", source.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_longest_qualifying_silence() {
        let silences = vec![
            DetectedSilence::new(0.1, 0.3),  // too early, filtered out
            DetectedSilence::new(2.0, 2.5),  // 0.5s
            DetectedSilence::new(5.0, 7.0),  // 2.0s, longest
        ];
        assert_eq!(pick_trim_point(&silences), Some(5.0 + TRIM_CUT_OFFSET_SECS));
    }

    #[test]
    fn no_qualifying_silence_returns_none() {
        let silences = vec![DetectedSilence::new(0.0, 0.2)];
        assert_eq!(pick_trim_point(&silences), None);
    }

    #[test]
    fn empty_silences_returns_none() {
        assert_eq!(pick_trim_point(&[]), None);
    }
}
