//! C3 — VadDetector. Same output contract as [`crate::media::silence`]
//! (closed `(start, end)` intervals of non-speech) but driven by a
//! voice-activity model. The concrete VAD backend is treated as an external
//! collaborator reached through the same spawn-and-parse contract as the
//! transcoder (SPEC_FULL.md §4.3) — no ONNX runtime is linked into this
//! crate.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::collaborators::MediaTool;
use crate::errors::{AppError, Result};
use crate::media::runner::{self, ProcessRegistry};
use crate::model::DetectedSilence;

pub struct VadTool;
impl MediaTool for VadTool {
    fn binary_name(&self) -> &str {
        "achew-vad"
    }
}

/// One input to a VAD pass: a file and the offset at which its timeline
/// begins on the item's global timeline.
#[derive(Debug, Clone)]
pub struct VadInput {
    pub path: PathBuf,
    pub global_start_secs: f64,
}

#[derive(Debug, Deserialize)]
struct VadSegmentLine {
    start: f64,
    end: f64,
}

/// Runs the VAD tool over a single input and returns non-speech intervals
/// offset into the global timeline.
pub async fn detect(input: &VadInput, cancel: CancelToken, registry: Option<&ProcessRegistry>) -> Result<Option<Vec<DetectedSilence>>> {
    detect_many(std::slice::from_ref(input), cancel, registry).await
}

/// Runs the VAD tool over multiple inputs in turn, offsetting each input's
/// emitted intervals by its own `global_start_secs` before returning the
/// merged, sorted result (SPEC_FULL.md §4.3).
pub async fn detect_many(
    inputs: &[VadInput],
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<Vec<DetectedSilence>>> {
    let binary = VadTool.locate()?;
    let mut all_silences = Vec::new();

    for input in inputs {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let silences = run_single(&binary, &input.path, input.global_start_secs, cancel.clone(), registry).await?;
        match silences {
            Some(mut s) => all_silences.append(&mut s),
            None => return Ok(None),
        }
    }

    all_silences.sort_by(|a, b| a.start_secs.partial_cmp(&b.start_secs).unwrap_or(std::cmp::Ordering::Equal));
    Ok(Some(all_silences))
}

async fn run_single(
    binary: &Path,
    path: &Path,
    global_offset_secs: f64,
    cancel: CancelToken,
    registry: Option<&ProcessRegistry>,
) -> Result<Option<Vec<DetectedSilence>>> {
    let argv = vec![
        binary.to_string_lossy().to_string(),
        "--input".to_string(),
        path.to_string_lossy().to_string(),
        "--format".to_string(),
        "jsonl".to_string(),
    ];

    let mut silences = Vec::new();
    let mut parse_error: Option<String> = None;

    let outcome = runner::run_capture(
        &argv,
        |line| {
            let line = line.trim();
            if line.is_empty() {
                return;
            }
            match serde_json::from_str::<VadSegmentLine>(line) {
                Ok(segment) if segment.end > segment.start => {
                    silences.push(DetectedSilence::new(
                        segment.start + global_offset_secs,
                        segment.end + global_offset_secs,
                    ));
                }
                Ok(_) => {}
                Err(e) => parse_error = Some(e.to_string()),
            }
        },
        cancel,
        registry,
        "vad_detect",
    )
    .await?;

    if outcome.cancelled {
        return Ok(None);
    }
    if !outcome.success {
        return Err(AppError::ToolFailed(format!("vad detect failed for {}", path.display())));
    }
    if let Some(err) = parse_error {
        return Err(AppError::ParseError(format!("invalid VAD output line: {err}")));
    }

    Ok(Some(silences))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_segments_into_global_timeline() {
        let line = r#"{"start": 1.0, "end": 2.5}"#;
        let segment: VadSegmentLine = serde_json::from_str(line).unwrap();
        let offset = 100.0;
        let silence = DetectedSilence::new(segment.start + offset, segment.end + offset);
        assert_eq!(silence.start_secs, 101.0);
        assert_eq!(silence.end_secs, 102.5);
    }
}
