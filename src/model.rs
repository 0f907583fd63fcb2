//! The shared data model (SPEC_FULL.md §3): the types that flow between the
//! pipeline stages and across the UI transport boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audio file on disk together with the duration the prober reported for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFileRef {
    pub path: String,
    pub duration_secs: f64,
}

/// An audiobook item once fetched: immutable after fetch completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioItem {
    pub id: String,
    pub display_name: String,
    pub files: Vec<AudioFileRef>,
    pub total_duration_secs: f64,
}

impl AudioItem {
    pub fn single_file(id: impl Into<String>, display_name: impl Into<String>, path: impl Into<String>, duration_secs: f64) -> Self {
        AudioItem {
            id: id.into(),
            display_name: display_name.into(),
            files: vec![AudioFileRef { path: path.into(), duration_secs }],
            total_duration_secs: duration_secs,
        }
    }

    pub fn is_grouped(&self) -> bool {
        self.files.len() > 1
    }
}

/// A candidate chapter-boundary timestamp, optionally titled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cue {
    pub timestamp_secs: f64,
    pub title: Option<String>,
}

impl Cue {
    pub fn new(timestamp_secs: f64) -> Self {
        Cue { timestamp_secs, title: None }
    }

    pub fn with_title(timestamp_secs: f64, title: impl Into<String>) -> Self {
        Cue { timestamp_secs, title: Some(title.into()) }
    }
}

/// Named provenance of an ordered list of cues. `claimed_duration_secs` is the
/// duration this source believes the item has, which may differ from the
/// actual audio duration — the discrepancy is exactly what makes
/// [`crate::align`] necessary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CueSource {
    pub id: String,
    pub short_name: String,
    pub long_name: String,
    pub description: String,
    pub claimed_duration_secs: f64,
    pub cues: Vec<Cue>,
}

/// A detected silence interval. `end > start >= 0` is an invariant enforced
/// by every constructor in [`crate::media::silence`] and [`crate::media::vad`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectedSilence {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl DetectedSilence {
    pub fn new(start_secs: f64, end_secs: f64) -> Self {
        debug_assert!(end_secs > start_secs && start_secs >= 0.0);
        DetectedSilence { start_secs, end_secs }
    }

    /// The conventional cue point derived from a silence: its end minus the
    /// configured ASR lead-in buffer.
    pub fn cue_point(&self, asr_buffer_secs: f64) -> f64 {
        (self.end_secs - asr_buffer_secs).max(0.0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

/// A realignment record attached to a chapter once [`crate::align`] has run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealignmentRecord {
    pub original_timestamp_secs: f64,
    pub confidence: f64,
    pub is_guess: bool,
}

/// An editable chapter. `id` is stable across edits so that history entries
/// and realignment records can reference a chapter that has since moved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub timestamp_secs: f64,
    pub title: String,
    pub asr_title: Option<String>,
    pub selected: bool,
    pub deleted: bool,
    pub segment_path: Option<String>,
    pub realignment: Option<RealignmentRecord>,
}

impl Chapter {
    pub fn new(timestamp_secs: f64, title: impl Into<String>) -> Self {
        Chapter {
            id: Uuid::new_v4().to_string(),
            timestamp_secs,
            title: title.into(),
            asr_title: None,
            selected: true,
            deleted: false,
            segment_path: None,
            realignment: None,
        }
    }

    /// Whether this chapter contributes to the final output.
    pub fn contributes(&self) -> bool {
        self.selected && !self.deleted
    }
}

/// A reversible edit to a chapter list. Every variant implements `apply`/`undo`
/// by pattern match; see [`crate::history`] for the stack that sequences these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ChapterOperation {
    SetTitle { chapter_id: String, old_title: String, new_title: String },
    SetTimestamp { chapter_id: String, old_secs: f64, new_secs: f64 },
    SetSelected { chapter_id: String, old_selected: bool, new_selected: bool },
    Insert { index: usize, chapter: Chapter },
    Delete { index: usize, chapter: Chapter },
    Batch { operations: Vec<ChapterOperation> },
    AiCleanup {
        old_titles: Vec<(String, String)>,
        old_selected: Vec<(String, bool)>,
        new_titles: Vec<(String, String)>,
        new_deselected: Vec<String>,
    },
}

/// How a local audiobook item is laid out on disk (SPEC_FULL.md §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    SingleFile,
    MultiFileGrouped,
}

/// One file contributing to a local item, with its path relative to the
/// sandbox base and its probed duration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileEntry {
    pub rel_path: String,
    pub duration_secs: f64,
}

/// A single-file or grouped-folder book discovered by
/// [`crate::local::scanner`]. `id` is `kind::urlsafe_b64(rel_path)` with
/// `kind` in `{"file", "folder"}` (SPEC_FULL.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalItem {
    pub id: String,
    pub display_name: String,
    pub rel_path: String,
    pub processing_mode: ProcessingMode,
    pub can_split: bool,
    pub files: Vec<LocalFileEntry>,
}

impl LocalItem {
    pub fn total_duration_secs(&self) -> f64 {
        self.files.iter().map(|f| f.duration_secs).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_contributes_only_when_selected_and_not_deleted() {
        let mut chapter = Chapter::new(10.0, "Intro");
        assert!(chapter.contributes());
        chapter.selected = false;
        assert!(!chapter.contributes());
        chapter.selected = true;
        chapter.deleted = true;
        assert!(!chapter.contributes());
    }

    #[test]
    fn detected_silence_cue_point_subtracts_buffer() {
        let silence = DetectedSilence::new(10.0, 12.0);
        assert_eq!(silence.cue_point(0.25), 11.75);
        assert_eq!(silence.duration_secs(), 2.0);
    }

    #[test]
    fn detected_silence_cue_point_never_negative() {
        let silence = DetectedSilence::new(0.0, 0.1);
        assert_eq!(silence.cue_point(1.0), 0.0);
    }

    #[test]
    fn local_item_total_duration_sums_files() {
        let item = LocalItem {
            id: "folder::abc".to_string(),
            display_name: "Book".to_string(),
            rel_path: "Book".to_string(),
            processing_mode: ProcessingMode::MultiFileGrouped,
            can_split: true,
            files: vec![
                LocalFileEntry { rel_path: "Book/01.m4a".to_string(), duration_secs: 600.0 },
                LocalFileEntry { rel_path: "Book/02.m4a".to_string(), duration_secs: 900.0 },
            ],
        };
        assert_eq!(item.total_duration_secs(), 1500.0);
    }

    #[test]
    fn audio_item_is_grouped_reflects_file_count() {
        let single = AudioItem::single_file("1", "Book", "/media/book.m4a", 100.0);
        assert!(!single.is_grouped());
        let grouped = AudioItem {
            id: "2".to_string(),
            display_name: "Book".to_string(),
            files: vec![
                AudioFileRef { path: "a.m4a".to_string(), duration_secs: 10.0 },
                AudioFileRef { path: "b.m4a".to_string(), duration_secs: 10.0 },
            ],
            total_duration_secs: 20.0,
        };
        assert!(grouped.is_grouped());
    }
}
