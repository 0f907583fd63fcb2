//! C11 — ChapterHistory. A two-sided undo/redo stack of reversible chapter
//! edits (SPEC_FULL.md §4.11). `ChapterOperation` itself is the closed sum
//! of variants defined in [`crate::model`]; this module owns only the
//! stack/cursor and the `apply`/`undo` interpreter for each variant.

use crate::errors::{AppError, Result};
use crate::model::{Chapter, ChapterOperation};

/// Undo/redo stack with a cursor one past the most recently applied
/// operation. `add` discards any redo tail before appending
/// (SPEC_FULL.md §4.11).
#[derive(Debug, Clone, Default)]
pub struct ChapterHistory {
    operations: Vec<ChapterOperation>,
    cursor: usize,
}

impl ChapterHistory {
    pub fn new() -> Self {
        ChapterHistory::default()
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.operations.len()
    }

    /// Records `op` as already applied to `chapters` by the caller, and
    /// discards any redo tail.
    pub fn record(&mut self, op: ChapterOperation) {
        self.operations.truncate(self.cursor);
        self.operations.push(op);
        self.cursor += 1;
    }

    /// Applies `op` to `chapters` and records it in one step.
    pub fn apply(&mut self, chapters: &mut Vec<Chapter>, op: ChapterOperation) -> Result<()> {
        apply_op(chapters, &op)?;
        self.record(op);
        Ok(())
    }

    pub fn undo(&mut self, chapters: &mut Vec<Chapter>) -> Result<bool> {
        if !self.can_undo() {
            return Ok(false);
        }
        self.cursor -= 1;
        let op = self.operations[self.cursor].clone();
        undo_op(chapters, &op)?;
        Ok(true)
    }

    pub fn redo(&mut self, chapters: &mut Vec<Chapter>) -> Result<bool> {
        if !self.can_redo() {
            return Ok(false);
        }
        let op = self.operations[self.cursor].clone();
        apply_op(chapters, &op)?;
        self.cursor += 1;
        Ok(true)
    }
}

fn find_index(chapters: &[Chapter], chapter_id: &str) -> Result<usize> {
    chapters
        .iter()
        .position(|c| c.id == chapter_id)
        .ok_or_else(|| AppError::InvariantViolated(format!("chapter {chapter_id} not found")))
}

fn apply_op(chapters: &mut Vec<Chapter>, op: &ChapterOperation) -> Result<()> {
    match op {
        ChapterOperation::SetTitle { chapter_id, new_title, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].title = new_title.clone();
        }
        ChapterOperation::SetTimestamp { chapter_id, new_secs, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].timestamp_secs = *new_secs;
        }
        ChapterOperation::SetSelected { chapter_id, new_selected, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].selected = *new_selected;
        }
        ChapterOperation::Insert { index, chapter } => {
            let index = (*index).min(chapters.len());
            chapters.insert(index, chapter.clone());
        }
        ChapterOperation::Delete { chapter, .. } => {
            let idx = find_index(chapters, &chapter.id)?;
            chapters[idx].deleted = true;
        }
        ChapterOperation::Batch { operations } => {
            for sub in operations {
                apply_op(chapters, sub)?;
            }
        }
        ChapterOperation::AiCleanup { new_titles, new_deselected, .. } => {
            for (chapter_id, title) in new_titles {
                let idx = find_index(chapters, chapter_id)?;
                chapters[idx].title = title.clone();
            }
            for chapter_id in new_deselected {
                let idx = find_index(chapters, chapter_id)?;
                chapters[idx].selected = false;
            }
        }
    }
    Ok(())
}

fn undo_op(chapters: &mut Vec<Chapter>, op: &ChapterOperation) -> Result<()> {
    match op {
        ChapterOperation::SetTitle { chapter_id, old_title, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].title = old_title.clone();
        }
        ChapterOperation::SetTimestamp { chapter_id, old_secs, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].timestamp_secs = *old_secs;
        }
        ChapterOperation::SetSelected { chapter_id, old_selected, .. } => {
            let idx = find_index(chapters, chapter_id)?;
            chapters[idx].selected = *old_selected;
        }
        ChapterOperation::Insert { index, chapter } => {
            let idx = chapters
                .iter()
                .position(|c| c.id == chapter.id)
                .unwrap_or((*index).min(chapters.len().saturating_sub(1)));
            if idx < chapters.len() {
                chapters.remove(idx);
            }
        }
        ChapterOperation::Delete { chapter, .. } => {
            let idx = find_index(chapters, &chapter.id)?;
            chapters[idx].deleted = false;
        }
        ChapterOperation::Batch { operations } => {
            for sub in operations.iter().rev() {
                undo_op(chapters, sub)?;
            }
        }
        ChapterOperation::AiCleanup { old_titles, old_selected, .. } => {
            for (chapter_id, title) in old_titles {
                let idx = find_index(chapters, chapter_id)?;
                chapters[idx].title = title.clone();
            }
            for (chapter_id, selected) in old_selected {
                let idx = find_index(chapters, chapter_id)?;
                chapters[idx].selected = *selected;
            }
        }
    }
    Ok(())
}

/// Builds the `AiCleanup` batch operation from the LLM collaborator's
/// output: a `None` or literal `"null"` entry deselects the chapter, a
/// non-empty string replaces its title. Mismatched lengths are fatal
/// (SPEC_FULL.md §6, §8).
pub fn build_ai_cleanup(chapters: &[Chapter], titles: &[Option<String>]) -> Result<ChapterOperation> {
    if chapters.len() != titles.len() {
        return Err(AppError::InvariantViolated(format!(
            "AI cleanup returned {} titles for {} chapters",
            titles.len(),
            chapters.len()
        )));
    }

    let mut old_titles = Vec::new();
    let mut old_selected = Vec::new();
    let mut new_titles = Vec::new();
    let mut new_deselected = Vec::new();

    for (chapter, title) in chapters.iter().zip(titles.iter()) {
        let deselect = matches!(title, None) || matches!(title.as_deref(), Some("null"));
        old_titles.push((chapter.id.clone(), chapter.title.clone()));
        old_selected.push((chapter.id.clone(), chapter.selected));
        if deselect {
            new_deselected.push(chapter.id.clone());
        } else if let Some(new_title) = title {
            new_titles.push((chapter.id.clone(), new_title.clone()));
        }
    }

    Ok(ChapterOperation::AiCleanup { old_titles, old_selected, new_titles, new_deselected })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chapters() -> Vec<Chapter> {
        vec![Chapter::new(0.0, "Intro"), Chapter::new(60.0, "Chapter 1")]
    }

    #[test]
    fn apply_and_undo_set_title_round_trips() {
        let mut chapters = sample_chapters();
        let id = chapters[0].id.clone();
        let mut history = ChapterHistory::new();

        history
            .apply(&mut chapters, ChapterOperation::SetTitle {
                chapter_id: id.clone(),
                old_title: "Intro".to_string(),
                new_title: "Prologue".to_string(),
            })
            .unwrap();
        assert_eq!(chapters[0].title, "Prologue");

        history.undo(&mut chapters).unwrap();
        assert_eq!(chapters[0].title, "Intro");

        history.redo(&mut chapters).unwrap();
        assert_eq!(chapters[0].title, "Prologue");
    }

    #[test]
    fn undo_sequence_then_equal_redos_restores_identical_list() {
        let original = sample_chapters();
        let mut chapters = original.clone();
        let mut history = ChapterHistory::new();

        let id0 = chapters[0].id.clone();
        let id1 = chapters[1].id.clone();
        history
            .apply(&mut chapters, ChapterOperation::SetTitle {
                chapter_id: id0,
                old_title: "Intro".to_string(),
                new_title: "A".to_string(),
            })
            .unwrap();
        history
            .apply(&mut chapters, ChapterOperation::SetSelected {
                chapter_id: id1,
                old_selected: true,
                new_selected: false,
            })
            .unwrap();

        history.undo(&mut chapters).unwrap();
        history.undo(&mut chapters).unwrap();
        assert_eq!(chapters, original);

        history.redo(&mut chapters).unwrap();
        history.redo(&mut chapters).unwrap();
        assert_ne!(chapters, original);
    }

    #[test]
    fn add_after_undo_discards_redo_tail() {
        let mut chapters = sample_chapters();
        let id = chapters[0].id.clone();
        let mut history = ChapterHistory::new();

        history
            .apply(&mut chapters, ChapterOperation::SetTitle {
                chapter_id: id.clone(),
                old_title: "Intro".to_string(),
                new_title: "A".to_string(),
            })
            .unwrap();
        history.undo(&mut chapters).unwrap();
        assert!(history.can_redo());

        history
            .apply(&mut chapters, ChapterOperation::SetTitle {
                chapter_id: id,
                old_title: "Intro".to_string(),
                new_title: "B".to_string(),
            })
            .unwrap();
        assert!(!history.can_redo());
    }

    #[test]
    fn delete_marks_deleted_rather_than_removing() {
        let mut chapters = sample_chapters();
        let id = chapters[0].id.clone();
        let chapter = chapters[0].clone();
        let mut history = ChapterHistory::new();

        history
            .apply(&mut chapters, ChapterOperation::Delete { index: 0, chapter })
            .unwrap();
        assert!(chapters[0].deleted);
        assert_eq!(chapters.len(), 2);

        history.undo(&mut chapters).unwrap();
        assert!(!chapters[0].deleted);
        let _ = id;
    }

    #[test]
    fn batch_applies_forward_and_undoes_in_reverse() {
        let mut chapters = sample_chapters();
        let id0 = chapters[0].id.clone();
        let id1 = chapters[1].id.clone();
        let mut history = ChapterHistory::new();

        let batch = ChapterOperation::Batch {
            operations: vec![
                ChapterOperation::SetTitle {
                    chapter_id: id0.clone(),
                    old_title: "Intro".to_string(),
                    new_title: "A".to_string(),
                },
                ChapterOperation::SetTitle {
                    chapter_id: id1.clone(),
                    old_title: "Chapter 1".to_string(),
                    new_title: "B".to_string(),
                },
            ],
        };

        history.apply(&mut chapters, batch).unwrap();
        assert_eq!(chapters[0].title, "A");
        assert_eq!(chapters[1].title, "B");

        history.undo(&mut chapters).unwrap();
        assert_eq!(chapters[0].title, "Intro");
        assert_eq!(chapters[1].title, "Chapter 1");
    }

    #[test]
    fn ai_cleanup_treats_none_and_literal_null_as_deselect() {
        let chapters = sample_chapters();
        let titles = vec![None, Some("null".to_string())];
        let op = build_ai_cleanup(&chapters, &titles).unwrap();
        match op {
            ChapterOperation::AiCleanup { new_titles, new_deselected, .. } => {
                assert!(new_titles.is_empty());
                assert_eq!(new_deselected.len(), 2);
            }
            _ => panic!("expected AiCleanup"),
        }
    }

    #[test]
    fn ai_cleanup_apply_deselects_and_undo_restores_selection() {
        let mut chapters = sample_chapters();
        let titles = vec![Some("Prologue".to_string()), None];
        let mut history = ChapterHistory::new();

        let op = build_ai_cleanup(&chapters, &titles).unwrap();
        history.apply(&mut chapters, op).unwrap();
        assert_eq!(chapters[0].title, "Prologue");
        assert!(chapters[0].selected);
        assert!(!chapters[1].selected);

        history.undo(&mut chapters).unwrap();
        assert_eq!(chapters[0].title, "Intro");
        assert!(chapters[0].selected);
        assert!(chapters[1].selected);
    }

    #[test]
    fn ai_cleanup_rejects_length_mismatch() {
        let chapters = sample_chapters();
        let titles = vec![Some("Only one".to_string())];
        let result = build_ai_cleanup(&chapters, &titles);
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }

    #[test]
    fn undo_and_redo_are_no_ops_at_the_ends() {
        let mut chapters = sample_chapters();
        let mut history = ChapterHistory::new();
        assert!(!history.undo(&mut chapters).unwrap());
        assert!(!history.redo(&mut chapters).unwrap());
    }
}
