//! Sandbox base path and pipeline-tunable defaults. Everything else the
//! original configuration surface persisted (validated source/provider
//! state, LLM credentials, editor preferences) is out of scope — see
//! SPEC_FULL.md §9 "config surface kept minimal on purpose".

use crate::errors::{AppError, Result};

const DEFAULT_SANDBOX_BASE: &str = "/media";

const SEGMENT_LENGTH_BOUNDS: (f64, f64) = (3.0, 30.0);
const MIN_CLIP_LENGTH_BOUNDS: (f64, f64) = (0.5, 5.0);
const ASR_BUFFER_BOUNDS: (f64, f64) = (0.0, 1.0);

pub const DEFAULT_SEGMENT_LENGTH_SECS: f64 = 8.0;
pub const DEFAULT_MIN_CLIP_LENGTH_SECS: f64 = 1.0;
pub const DEFAULT_ASR_BUFFER_SECS: f64 = 0.25;
pub const DEFAULT_MIN_SILENCE_DURATION_SECS: f64 = 1.0;

/// Resolves the library sandbox root from `ACHEW_MEDIA_ROOT`, falling back
/// to `/media` to match the original deployment's default mount point.
pub fn sandbox_base_path() -> std::path::PathBuf {
    std::env::var("ACHEW_MEDIA_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from(DEFAULT_SANDBOX_BASE))
}

/// Tunable knobs for a single pipeline run. Bounds and invariant mirror the
/// original processing pipeline's `segment_length`/`min_clip_length`/
/// `asr_buffer` validators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub segment_length_secs: f64,
    pub min_clip_length_secs: f64,
    pub asr_buffer_secs: f64,
    pub min_silence_duration_secs: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            segment_length_secs: DEFAULT_SEGMENT_LENGTH_SECS,
            min_clip_length_secs: DEFAULT_MIN_CLIP_LENGTH_SECS,
            asr_buffer_secs: DEFAULT_ASR_BUFFER_SECS,
            min_silence_duration_secs: DEFAULT_MIN_SILENCE_DURATION_SECS,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let in_bounds = |v: f64, (lo, hi): (f64, f64)| v >= lo && v <= hi;

        if !in_bounds(self.segment_length_secs, SEGMENT_LENGTH_BOUNDS) {
            return Err(AppError::ConfigInvalid(format!(
                "segment_length {} outside [{}, {}]",
                self.segment_length_secs, SEGMENT_LENGTH_BOUNDS.0, SEGMENT_LENGTH_BOUNDS.1
            )));
        }
        if !in_bounds(self.min_clip_length_secs, MIN_CLIP_LENGTH_BOUNDS) {
            return Err(AppError::ConfigInvalid(format!(
                "min_clip_length {} outside [{}, {}]",
                self.min_clip_length_secs, MIN_CLIP_LENGTH_BOUNDS.0, MIN_CLIP_LENGTH_BOUNDS.1
            )));
        }
        if !in_bounds(self.asr_buffer_secs, ASR_BUFFER_BOUNDS) {
            return Err(AppError::ConfigInvalid(format!(
                "asr_buffer {} outside [{}, {}]",
                self.asr_buffer_secs, ASR_BUFFER_BOUNDS.0, ASR_BUFFER_BOUNDS.1
            )));
        }
        if self.segment_length_secs < self.min_clip_length_secs {
            return Err(AppError::ConfigInvalid(
                "segment_length must be >= min_clip_length".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn segment_length_below_bound_rejected() {
        let cfg = PipelineConfig { segment_length_secs: 1.0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn segment_length_must_be_at_least_min_clip_length() {
        let cfg = PipelineConfig {
            segment_length_secs: 3.0,
            min_clip_length_secs: 5.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sandbox_base_defaults_to_media() {
        std::env::remove_var("ACHEW_MEDIA_ROOT");
        assert_eq!(sandbox_base_path(), std::path::PathBuf::from("/media"));
    }
}
