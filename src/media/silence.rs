//! C2 — SilenceDetector. Drives the transcoder's `silencedetect` filter and
//! collects `(start, end)` pairs. Grounded on the `other_examples`
//! chapterizer's `detect_chapters_from_silence`/`parse_silence_output`, wired
//! through the shared [`crate::media::runner`] contract instead of a bespoke
//! subprocess call.

use std::path::Path;

use crate::cancel::CancelToken;
use crate::errors::Result;
use crate::media::constants::DEFAULT_SILENCE_THRESHOLD_DB;
use crate::media::runner::{self, ProcessRegistry, ProgressLine, Transcoder};
use crate::model::DetectedSilence;

/// Runs silencedetect over `path` (optionally offset into a larger
/// timeline by `global_offset_secs`) and returns closed `(start, end)`
/// intervals in the global timeline. Returns `None` if the run was
/// cancelled.
pub async fn detect(
    path: &Path,
    threshold_db: f64,
    min_duration_secs: f64,
    global_offset_secs: f64,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<Vec<DetectedSilence>>> {
    let binary = Transcoder.locate()?;
    let filter = format!(
        "silencedetect=noise={}dB:d={}",
        threshold_db, min_duration_secs
    );
    let argv = vec![
        binary.to_string_lossy().to_string(),
        "-i".to_string(),
        path.to_string_lossy().to_string(),
        "-af".to_string(),
        filter,
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];

    let mut pending_start: Option<f64> = None;
    let mut silences = Vec::new();

    let outcome = runner::run_capture(
        &argv,
        |line| match runner::parse_progress_line(line) {
            ProgressLine::SilenceStart(start) => pending_start = Some(start),
            ProgressLine::SilenceEnd(end) => {
                if let Some(start) = pending_start.take() {
                    if end > start {
                        silences.push(DetectedSilence::new(
                            start + global_offset_secs,
                            end + global_offset_secs,
                        ));
                    }
                }
            }
            _ => {}
        },
        cancel,
        registry,
        "silence_detect",
    )
    .await?;

    if outcome.cancelled {
        return Ok(None);
    }
    if !outcome.success {
        return Err(crate::errors::AppError::ToolFailed(format!(
            "silencedetect failed for {}",
            path.display()
        )));
    }

    Ok(Some(silences))
}

pub fn default_threshold_db() -> f64 {
    DEFAULT_SILENCE_THRESHOLD_DB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_pairing_keeps_most_recent_start() {
        // Purely exercises the parsing/pairing logic without spawning a
        // process: two starts in a row should pair the second with its end.
        let mut pending_start: Option<f64> = None;
        let mut silences: Vec<DetectedSilence> = Vec::new();
        for line in ["silence_start: 1.0", "silence_start: 2.0", "silence_end: 3.0"] {
            match runner::parse_progress_line(line) {
                ProgressLine::SilenceStart(s) => pending_start = Some(s),
                ProgressLine::SilenceEnd(e) => {
                    if let Some(s) = pending_start.take() {
                        if e > s {
                            silences.push(DetectedSilence::new(s, e));
                        }
                    }
                }
                _ => {}
            }
        }
        assert_eq!(silences.len(), 1);
        assert_eq!(silences[0].start_secs, 2.0);
    }
}
