//! Pipeline state: the `Step` enum, the task-handle key (`StageKind`), and
//! the plain-data `PipelineState` the supervisor mutates (SPEC_FULL.md §3,
//! §4.12). Kept separate from `supervisor` so the state shape and its pure
//! helpers (rank, string form) can be tested without spinning up tokio.

use std::path::PathBuf;

use crate::coverage::CoverageTracker;
use crate::history::ChapterHistory;
use crate::model::{Chapter, Cue, CueSource, DetectedSilence, LocalItem};
use crate::{config::PipelineConfig, model::AudioItem};

/// Every state the pipeline can be in (SPEC_FULL.md §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    SourceSetup,
    AbsSetup,
    LocalSetup,
    LlmSetup,
    Idle,
    Validating,
    Downloading,
    FilePrep,
    SelectCueSource,
    AudioAnalysis,
    VadPrep,
    VadAnalysis,
    CueSetSelection,
    AudioExtraction,
    ConfigureAsr,
    Trimming,
    AsrProcessing,
    ChapterEditing,
    AiCleanup,
    Reviewing,
    Completed,
    PartialScanPrep,
    PartialAudioAnalysis,
    PartialVadAnalysis,
}

impl Step {
    /// The wire form broadcast in `Event::StepChange` (SPEC_FULL.md §6).
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::SourceSetup => "source_setup",
            Step::AbsSetup => "abs_setup",
            Step::LocalSetup => "local_setup",
            Step::LlmSetup => "llm_setup",
            Step::Idle => "idle",
            Step::Validating => "validating",
            Step::Downloading => "downloading",
            Step::FilePrep => "file_prep",
            Step::SelectCueSource => "select_cue_source",
            Step::AudioAnalysis => "audio_analysis",
            Step::VadPrep => "vad_prep",
            Step::VadAnalysis => "vad_analysis",
            Step::CueSetSelection => "cue_set_selection",
            Step::AudioExtraction => "audio_extraction",
            Step::ConfigureAsr => "configure_asr",
            Step::Trimming => "trimming",
            Step::AsrProcessing => "asr_processing",
            Step::ChapterEditing => "chapter_editing",
            Step::AiCleanup => "ai_cleanup",
            Step::Reviewing => "reviewing",
            Step::Completed => "completed",
            Step::PartialScanPrep => "partial_scan_prep",
            Step::PartialAudioAnalysis => "partial_audio_analysis",
            Step::PartialVadAnalysis => "partial_vad_analysis",
        }
    }

    /// Position in the overall linear flow, used by `restart`'s cleanup
    /// ladder to decide which artifacts a rollback to this step must clear.
    /// Branch states (e.g. `vad_prep`/`audio_analysis`) share a rank since
    /// they are alternatives at the same point in the flow.
    pub fn flow_rank(&self) -> u8 {
        match self {
            Step::SourceSetup => 0,
            Step::AbsSetup | Step::LocalSetup => 1,
            Step::LlmSetup => 2,
            Step::Idle => 3,
            Step::Validating => 4,
            Step::Downloading => 5,
            Step::FilePrep => 6,
            Step::SelectCueSource => 7,
            Step::AudioAnalysis | Step::VadPrep | Step::VadAnalysis => 8,
            Step::CueSetSelection | Step::PartialScanPrep | Step::PartialAudioAnalysis | Step::PartialVadAnalysis => 9,
            Step::AudioExtraction => 10,
            Step::ConfigureAsr => 11,
            Step::Trimming | Step::AsrProcessing => 12,
            Step::ChapterEditing | Step::AiCleanup => 13,
            Step::Reviewing => 14,
            Step::Completed => 15,
        }
    }
}

/// Which detector a (partial) rescan should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Silence,
    Vad,
}

/// Where the current item came from. Local items additionally carry the
/// per-file start offsets on the working timeline, needed by the grouped
/// submit alignment check and by the realignment driver's file-start cue
/// source.
#[derive(Debug, Clone)]
pub enum Source {
    Remote { item: AudioItem },
    Local { item: LocalItem, files: Vec<PathBuf>, file_starts: Vec<f64> },
}

/// The pipeline's full mutable state (SPEC_FULL.md §3). Everything here is
/// plain data; orchestration lives in [`crate::pipeline::supervisor`].
pub struct PipelineState {
    pub step: Step,
    pub config: PipelineConfig,
    pub temp_dir: PathBuf,
    pub source: Option<Source>,
    /// The single file the rest of the pipeline analyzes: the source file
    /// itself for a remote/single-file item, or the in-temp-workspace
    /// concatenation of a grouped folder's files.
    pub working_path: Option<PathBuf>,
    pub total_duration_secs: f64,
    pub cue_sources: Vec<CueSource>,
    pub selected_cues: Vec<Cue>,
    pub detected_silences: Vec<DetectedSilence>,
    pub extracted_segments: Vec<PathBuf>,
    pub asr_segments: Vec<PathBuf>,
    pub trimmed_segments: Vec<PathBuf>,
    pub transcriptions: Vec<String>,
    pub chapters: Vec<Chapter>,
    pub history: ChapterHistory,
    pub silence_coverage: CoverageTracker,
    pub vad_coverage: CoverageTracker,
    pub partial_scan_temp_files: Vec<PathBuf>,
}

impl PipelineState {
    pub fn new(config: PipelineConfig, temp_dir: PathBuf) -> Self {
        PipelineState {
            step: Step::Idle,
            config,
            temp_dir,
            source: None,
            working_path: None,
            total_duration_secs: 0.0,
            cue_sources: Vec::new(),
            selected_cues: Vec::new(),
            detected_silences: Vec::new(),
            extracted_segments: Vec::new(),
            asr_segments: Vec::new(),
            trimmed_segments: Vec::new(),
            transcriptions: Vec::new(),
            chapters: Vec::new(),
            history: ChapterHistory::new(),
            silence_coverage: CoverageTracker::new(),
            vad_coverage: CoverageTracker::new(),
            partial_scan_temp_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_states_share_their_join_points_rank() {
        assert_eq!(Step::AudioAnalysis.flow_rank(), Step::VadPrep.flow_rank());
        assert_eq!(Step::VadPrep.flow_rank(), Step::VadAnalysis.flow_rank());
        assert_eq!(Step::Trimming.flow_rank(), Step::AsrProcessing.flow_rank());
    }

    #[test]
    fn flow_rank_is_monotonic_along_the_happy_path() {
        let path = [
            Step::Idle,
            Step::Validating,
            Step::Downloading,
            Step::FilePrep,
            Step::SelectCueSource,
            Step::AudioAnalysis,
            Step::CueSetSelection,
            Step::AudioExtraction,
            Step::ConfigureAsr,
            Step::Trimming,
            Step::ChapterEditing,
            Step::Reviewing,
            Step::Completed,
        ];
        for window in path.windows(2) {
            assert!(window[1].flow_rank() >= window[0].flow_rank());
        }
    }

    #[test]
    fn as_str_matches_wire_form() {
        assert_eq!(Step::SelectCueSource.as_str(), "select_cue_source");
        assert_eq!(Step::Completed.as_str(), "completed");
    }
}
