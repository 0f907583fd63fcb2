//! Audiobook chapter-mark processing pipeline: discover chapter boundaries
//! via metadata/silence/VAD detection, extract audio segments, optionally
//! transcribe via ASR, realign externally-sourced chapter lists via robust
//! regression, and write chapters back to a remote library or local media
//! files (SPEC_FULL.md §1).

#![deny(clippy::unwrap_used)]
#![warn(clippy::too_many_lines)]

pub mod align;
pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod coverage;
pub mod errors;
pub mod history;
pub mod local;
pub mod media;
pub mod model;
pub mod pipeline;
pub mod transport;

pub use align::{AlignCue, AlignedChapter};
pub use cancel::CancelToken;
pub use collaborators::{AsrClient, LlmClient, MediaTool, ProgressFn, RemoteLibraryClient};
pub use config::PipelineConfig;
pub use coverage::CoverageTracker;
pub use errors::{AppError, Result};
pub use history::ChapterHistory;
pub use model::{
    AudioFileRef, AudioItem, Chapter, ChapterOperation, Cue, CueSource, DetectedSilence, LocalFileEntry, LocalItem, ProcessingMode,
    RealignmentRecord,
};
pub use pipeline::{PipelineState, PipelineSupervisor, ScanType, Source, Step};
pub use transport::{Event, EventBus, ProgressUpdate};
