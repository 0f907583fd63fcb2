//! C12 — PipelineSupervisor. Sequences C1-C11 through the `Step` state list,
//! owns the per-run temp workspace and the in-flight subprocess registry,
//! and publishes progress/step/chapter/history events onto the transport
//! bus (SPEC_FULL.md §3-§6, §4.12, §5). Grounded on the teacher's
//! `commands` layer for the "one call per transition, events pushed as a
//! side effect" shape, generalized from a flat Tauri command surface into an
//! explicit state machine with its own rollback primitive.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::align::{self, AlignCue};
use crate::cancel::CancelToken;
use crate::collaborators::{AsrClient, LlmClient, ProgressFn, RemoteLibraryClient};
use crate::config::PipelineConfig;
use crate::coverage::CoverageTracker;
use crate::errors::{AppError, Result};
use crate::history::{self, ChapterHistory};
use crate::local::writer;
use crate::media::{constants, extractor, runner, silence, trimmer, vad};
use crate::model::{Chapter, ChapterOperation, Cue, CueSource, LocalItem, ProcessingMode, RealignmentRecord};
use crate::transport::{Event, EventBus};

use super::state::{PipelineState, ScanType, Source, Step};

const UNALIGNED_MERGE_TOLERANCE_SECS: f64 = 5.0;
const PARTIAL_RESCAN_EXPAND_SECS: f64 = 5.0;
const PARTIAL_RESCAN_REUSE_FULL_FILE_RATIO: f64 = 0.8;
const PARTIAL_RESCAN_LONG_COVERED_SPLIT_SECS: f64 = 600.0;
const NEW_SILENCE_DEDUP_TOLERANCE_SECS: f64 = 0.75;

fn pipeline_slot() -> &'static AtomicBool {
    static SLOT: OnceLock<AtomicBool> = OnceLock::new();
    SLOT.get_or_init(|| AtomicBool::new(false))
}

/// Which stage's task handle is being tracked, for `restart`'s abort pass
/// (SPEC_FULL.md §5: "extraction, trimming, transcription, download, vad,
/// ai_cleanup, partial_scan").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Extraction,
    Trimming,
    Download,
    Vad,
    PartialScan,
}

enum SlotGuard {
    Guarded,
    Inert,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if matches!(self, SlotGuard::Guarded) {
            pipeline_slot().store(false, Ordering::SeqCst);
        }
    }
}

fn merge_intervals(mut intervals: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(intervals.len());
    for (s, e) in intervals {
        if let Some(last) = merged.last_mut() {
            if s <= last.1 {
                last.1 = last.1.max(e);
                continue;
            }
        }
        merged.push((s, e));
    }
    merged
}

/// The finite state machine that owns a single pipeline run end to end.
/// Only one instance may exist per process at a time (SPEC_FULL.md §5); a
/// second `new` fails until the first is dropped.
pub struct PipelineSupervisor {
    state: PipelineState,
    cancel: CancelToken,
    registry: runner::ProcessRegistry,
    events: EventBus,
    task_handles: HashMap<StageKind, AbortHandle>,
    _slot: SlotGuard,
}

impl PipelineSupervisor {
    pub fn new(config: PipelineConfig, events: EventBus) -> Result<Self> {
        config.validate()?;
        if pipeline_slot().compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(AppError::InvariantViolated("a pipeline is already active in this process".to_string()));
        }

        let temp_dir = std::env::temp_dir().join(constants::TEMP_DIR_PREFIX).join(Uuid::new_v4().to_string());
        Ok(PipelineSupervisor {
            state: PipelineState::new(config, temp_dir),
            cancel: CancelToken::new(),
            registry: runner::ProcessRegistry::new(),
            events,
            task_handles: HashMap::new(),
            _slot: SlotGuard::Guarded,
        })
    }

    #[cfg(test)]
    fn new_for_test(config: PipelineConfig, events: EventBus) -> Self {
        let temp_dir = std::env::temp_dir().join("achew-test").join(Uuid::new_v4().to_string());
        PipelineSupervisor {
            state: PipelineState::new(config, temp_dir),
            cancel: CancelToken::new(),
            registry: runner::ProcessRegistry::new(),
            events,
            task_handles: HashMap::new(),
            _slot: SlotGuard::Inert,
        }
    }

    pub fn step(&self) -> Step {
        self.state.step
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.state.chapters
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn set_step(&mut self, step: Step) {
        self.state.step = step;
        self.events.step_change(step.as_str());
    }

    fn require_step(&self, expected: Step) -> Result<()> {
        if self.state.step != expected {
            return Err(AppError::InvariantViolated(format!(
                "expected step {}, found {}",
                expected.as_str(),
                self.state.step.as_str()
            )));
        }
        Ok(())
    }

    fn publish_chapters(&self) {
        self.events.publish(Event::ChapterUpdate { chapters: self.state.chapters.clone() });
    }

    fn publish_history(&self) {
        self.events.publish(Event::HistoryUpdate {
            can_undo: self.state.history.can_undo(),
            can_redo: self.state.history.can_redo(),
        });
    }

    async fn ensure_temp_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.state.temp_dir).await.map_err(AppError::Io)
    }

    /// Spawns `fut` on the runtime and tracks its abort handle under `kind`
    /// so `restart` can cancel an in-flight stage (SPEC_FULL.md §5). A
    /// panic in the stage surfaces as `AppError::Other`; an abort (from a
    /// concurrent `restart`) surfaces as `AppError::Cancelled`.
    async fn run_stage<T, F>(&mut self, kind: StageKind, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.task_handles.insert(kind, handle.abort_handle());
        let outcome = handle.await;
        self.task_handles.remove(&kind);
        match outcome {
            Ok(inner) => inner,
            Err(e) if e.is_cancelled() => Err(AppError::Cancelled),
            Err(e) => Err(AppError::Other(format!("stage task panicked: {e}"))),
        }
    }

    async fn cleanup_paths(&self, paths: Vec<PathBuf>) {
        for path in paths {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    // ---- source setup --------------------------------------------------

    /// `source_setup` -> `abs_setup` -> `validating` -> `downloading` ->
    /// (`file_prep`) -> `select_cue_source` (SPEC_FULL.md §4.12).
    pub async fn begin_remote(&mut self, client: &dyn RemoteLibraryClient, item_id: &str) -> Result<()> {
        self.require_step(Step::Idle)?;
        self.set_step(Step::Validating);
        client.health_check().await?;
        let item = client.get_item(item_id).await?;
        self.ensure_temp_dir().await?;

        self.set_step(Step::Downloading);
        let mut local_files = Vec::with_capacity(item.files.len());
        for (i, _file_ref) in item.files.iter().enumerate() {
            let dest = self.state.temp_dir.join(format!("download_{i}.bin"));
            let events = self.events.clone();
            let on_progress: ProgressFn = Box::new(move |pct| events.progress("downloading", pct, format!("file {i}")));
            client.download_file(item_id, i, &dest, on_progress, self.cancel.clone()).await?;
            local_files.push(dest);
        }

        if local_files.len() > 1 {
            self.set_step(Step::FilePrep);
            let total_duration = item.total_duration_secs;
            let out_dir = self.state.temp_dir.clone();
            let cancel = self.cancel.clone();
            let registry = self.registry.clone();
            let concatenated = crate::media::concat::concat(&local_files, total_duration, &out_dir, |_| {}, cancel, Some(&registry)).await?;
            let Some(working) = concatenated else { return Err(AppError::Cancelled) };
            self.state.working_path = Some(working);
        } else {
            self.state.working_path = local_files.into_iter().next();
        }

        self.state.total_duration_secs = item.total_duration_secs;
        self.state.source = Some(Source::Remote { item });
        self.set_step(Step::SelectCueSource);
        Ok(())
    }

    /// `local_setup` -> `validating` -> (`file_prep`) -> `select_cue_source`.
    /// `files` must be in the same order as `item.files` and already
    /// resolved under the sandbox base.
    pub async fn begin_local(&mut self, item: LocalItem, files: Vec<PathBuf>) -> Result<()> {
        self.require_step(Step::Idle)?;
        if files.len() != item.files.len() {
            return Err(AppError::InvariantViolated("resolved file count does not match item".to_string()));
        }
        self.set_step(Step::Validating);
        self.ensure_temp_dir().await?;

        let mut file_starts = Vec::with_capacity(item.files.len());
        let mut cursor = 0.0;
        for entry in &item.files {
            file_starts.push(cursor);
            cursor += entry.duration_secs;
        }
        self.state.total_duration_secs = item.total_duration_secs();

        if files.len() > 1 {
            self.set_step(Step::FilePrep);
            let out_dir = self.state.temp_dir.clone();
            let cancel = self.cancel.clone();
            let registry = self.registry.clone();
            let concatenated =
                crate::media::concat::concat(&files, self.state.total_duration_secs, &out_dir, |_| {}, cancel, Some(&registry)).await?;
            let Some(working) = concatenated else { return Err(AppError::Cancelled) };
            self.state.working_path = Some(working);
        } else {
            self.state.working_path = files.first().cloned();
        }

        self.state.source = Some(Source::Local { item, files, file_starts });
        self.set_step(Step::SelectCueSource);
        Ok(())
    }

    // ---- cue detection and selection ------------------------------------

    /// `select_cue_source` -> `audio_analysis`|`vad_prep`->`vad_analysis` ->
    /// `cue_set_selection` (SPEC_FULL.md §4.12). Adds the result as a new
    /// named [`CueSource`] rather than replacing any existing one, so the
    /// caller can run both detectors and let the user pick.
    pub async fn smart_detect(&mut self, use_vad: bool) -> Result<()> {
        self.require_step(Step::SelectCueSource)?;
        let path = self.state.working_path.clone().ok_or_else(|| AppError::InvariantViolated("no working file".to_string()))?;
        let duration = self.state.total_duration_secs;

        let silences = if use_vad {
            self.set_step(Step::VadPrep);
            self.set_step(Step::VadAnalysis);
            let input = vad::VadInput { path, global_start_secs: 0.0 };
            let cancel = self.cancel.clone();
            let registry = self.registry.clone();
            self.run_stage(StageKind::Vad, async move { vad::detect(&input, cancel, Some(&registry)).await }).await?
        } else {
            self.set_step(Step::AudioAnalysis);
            let threshold = silence::default_threshold_db();
            let min_duration = self.state.config.min_silence_duration_secs;
            let cancel = self.cancel.clone();
            let registry = self.registry.clone();
            self.run_stage(StageKind::Vad, async move { silence::detect(&path, threshold, min_duration, 0.0, cancel, Some(&registry)).await })
                .await?
        };

        let Some(silences) = silences else { return Err(AppError::Cancelled) };

        if use_vad {
            self.state.vad_coverage.add(0.0, duration);
        } else {
            self.state.silence_coverage.add(0.0, duration);
        }

        let asr_buffer = self.state.config.asr_buffer_secs;
        let cues: Vec<Cue> = silences.iter().map(|s| Cue::new(s.cue_point(asr_buffer))).collect();
        self.state.detected_silences = silences;

        let (id, short_name, long_name) = if use_vad {
            ("vad", "VAD", "Voice-activity smart detect")
        } else {
            ("silence", "Silence", "Silence smart detect")
        };
        self.state.cue_sources.push(CueSource {
            id: id.to_string(),
            short_name: short_name.to_string(),
            long_name: long_name.to_string(),
            description: "Detected automatically from the audio.".to_string(),
            claimed_duration_secs: duration,
            cues,
        });

        self.set_step(Step::CueSetSelection);
        Ok(())
    }

    /// Selects a previously detected/supplied cue source verbatim, dropping
    /// any cue at or past the working file's actual duration.
    pub fn select_existing_cue_source(&mut self, source_id: &str) -> Result<()> {
        self.require_step(Step::SelectCueSource)?;
        let source = self
            .state
            .cue_sources
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
            .ok_or_else(|| AppError::InvariantViolated(format!("unknown cue source {source_id}")))?;
        let duration = self.state.total_duration_secs;
        self.state.selected_cues = source.cues.into_iter().filter(|c| c.timestamp_secs < duration).collect();
        self.set_step(Step::AudioExtraction);
        Ok(())
    }

    /// Registers an externally supplied cue source (e.g. a realignment
    /// candidate's raw chapter list) without selecting it.
    pub fn register_cue_source(&mut self, source: CueSource) {
        self.state.cue_sources.push(source);
    }

    /// Merges `selected` with any cue from `include_unaligned_from` that is
    /// farther than [`UNALIGNED_MERGE_TOLERANCE_SECS`] from every selected
    /// cue, then de-duplicates the union with the same tolerance, preferring
    /// a selected cue over an added one on conflict (SPEC_FULL.md §8 #3).
    pub fn finalize_cue_set(&mut self, selected: Vec<Cue>, include_unaligned_from: Option<&CueSource>) -> Result<()> {
        self.require_step(Step::CueSetSelection)?;

        let mut tagged: Vec<(Cue, bool)> = selected.iter().cloned().map(|c| (c, true)).collect();
        if let Some(source) = include_unaligned_from {
            for cue in &source.cues {
                let nearest = selected
                    .iter()
                    .map(|s| (s.timestamp_secs - cue.timestamp_secs).abs())
                    .fold(f64::MAX, f64::min);
                if nearest > UNALIGNED_MERGE_TOLERANCE_SECS {
                    tagged.push((cue.clone(), false));
                }
            }
        }
        tagged.sort_by(|a, b| a.0.timestamp_secs.partial_cmp(&b.0.timestamp_secs).unwrap_or(std::cmp::Ordering::Equal));

        let mut deduped: Vec<Cue> = Vec::new();
        let mut priorities: Vec<bool> = Vec::new();
        for (cue, is_priority) in tagged {
            if let Some(last) = deduped.last() {
                if (cue.timestamp_secs - last.timestamp_secs).abs() <= UNALIGNED_MERGE_TOLERANCE_SECS {
                    let last_idx = deduped.len() - 1;
                    if is_priority && !priorities[last_idx] {
                        deduped[last_idx] = cue;
                        priorities[last_idx] = true;
                    }
                    continue;
                }
            }
            deduped.push(cue);
            priorities.push(is_priority);
        }

        let duration = self.state.total_duration_secs;
        self.state.selected_cues = deduped.into_iter().filter(|c| c.timestamp_secs < duration).collect();
        self.set_step(Step::AudioExtraction);
        Ok(())
    }

    // ---- extraction, trimming, ASR --------------------------------------

    pub async fn extract_audio(&mut self) -> Result<()> {
        self.require_step(Step::AudioExtraction)?;
        let path = self.state.working_path.clone().ok_or_else(|| AppError::InvariantViolated("no working file".to_string()))?;
        let cut_points: Vec<f64> = self.state.selected_cues.iter().map(|c| c.timestamp_secs).collect();
        let duration = self.state.total_duration_secs;
        let segment_length = self.state.config.segment_length_secs;
        let min_clip = self.state.config.min_clip_length_secs;
        let out_dir = self.state.temp_dir.clone();
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();

        let output = self
            .run_stage(StageKind::Extraction, async move {
                extractor::extract(&path, &cut_points, duration, segment_length, min_clip, &out_dir, true, cancel, Some(&registry)).await
            })
            .await?;
        let Some(output) = output else { return Err(AppError::Cancelled) };

        self.state.extracted_segments = output.segments;
        self.state.asr_segments = output.asr_segments;
        self.set_step(Step::ConfigureAsr);
        Ok(())
    }

    fn build_initial_chapters(&mut self, titles: Option<&[String]>) {
        self.state.chapters = self
            .state
            .selected_cues
            .iter()
            .enumerate()
            .map(|(i, cue)| {
                let mut chapter = Chapter::new(cue.timestamp_secs, cue.title.clone().unwrap_or_default());
                chapter.segment_path = self.state.extracted_segments.get(i).map(|p| p.to_string_lossy().to_string());
                if let Some(titles) = titles {
                    if let Some(title) = titles.get(i) {
                        chapter.asr_title = Some(title.clone());
                        chapter.title = title.clone();
                    }
                }
                chapter
            })
            .collect();
        self.state.history = ChapterHistory::new();
        self.publish_chapters();
        self.publish_history();
    }

    /// Skips ASR entirely: chapters are built from the selected cues with
    /// no title.
    pub fn configure_asr_skip(&mut self) -> Result<()> {
        self.require_step(Step::ConfigureAsr)?;
        self.build_initial_chapters(None);
        self.set_step(Step::ChapterEditing);
        Ok(())
    }

    /// `configure_asr` -> `trimming` -> `asr_processing` -> `chapter_editing`.
    pub async fn configure_asr_run(&mut self, asr: &dyn AsrClient) -> Result<()> {
        self.require_step(Step::ConfigureAsr)?;
        self.set_step(Step::Trimming);

        let segments = self.state.asr_segments.clone();
        let out_dir = self.state.temp_dir.clone();
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        let trimmed = self
            .run_stage(StageKind::Trimming, async move { trimmer::trim(&segments, &out_dir, false, cancel, Some(&registry)).await })
            .await?;
        let Some(trimmed) = trimmed else { return Err(AppError::Cancelled) };
        self.state.trimmed_segments = trimmed;

        self.set_step(Step::AsrProcessing);
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let transcriptions = asr.transcribe(&self.state.trimmed_segments).await?;
        self.state.transcriptions = transcriptions.clone();
        self.build_initial_chapters(Some(&transcriptions));
        self.set_step(Step::ChapterEditing);
        Ok(())
    }

    // ---- chapter editing -------------------------------------------------

    pub fn edit_chapter(&mut self, op: ChapterOperation) -> Result<()> {
        if !matches!(self.state.step, Step::ChapterEditing | Step::Reviewing) {
            return Err(AppError::InvariantViolated("chapter edits require chapter_editing or reviewing".to_string()));
        }
        self.state.history.apply(&mut self.state.chapters, op)?;
        self.publish_chapters();
        self.publish_history();
        Ok(())
    }

    pub fn undo(&mut self) -> Result<bool> {
        let did = self.state.history.undo(&mut self.state.chapters)?;
        if did {
            self.publish_chapters();
            self.publish_history();
        }
        Ok(did)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let did = self.state.history.redo(&mut self.state.chapters)?;
        if did {
            self.publish_chapters();
            self.publish_history();
        }
        Ok(did)
    }

    /// `chapter_editing` -> `ai_cleanup` -> `chapter_editing`: a single
    /// round trip through the LLM collaborator, recorded as one undoable
    /// batch (SPEC_FULL.md §4.11, §6).
    pub async fn apply_ai_cleanup(&mut self, llm: &dyn LlmClient, model: &str, options: &serde_json::Value) -> Result<()> {
        self.require_step(Step::ChapterEditing)?;
        self.set_step(Step::AiCleanup);

        let titles: Vec<String> = self.state.chapters.iter().map(|c| c.asr_title.clone().unwrap_or_else(|| c.title.clone())).collect();
        let results = llm.process_titles(&titles, model, options).await?;
        let op = history::build_ai_cleanup(&self.state.chapters, &results)?;
        self.state.history.apply(&mut self.state.chapters, op)?;
        self.publish_chapters();
        self.publish_history();

        self.set_step(Step::ChapterEditing);
        Ok(())
    }

    pub fn review(&mut self) -> Result<()> {
        self.require_step(Step::ChapterEditing)?;
        self.set_step(Step::Reviewing);
        Ok(())
    }

    // ---- realignment ------------------------------------------------------

    /// Realigns the current chapters (1:1 with `source.cues`) onto cues
    /// freshly detected around each chapter's affine-projected position,
    /// replacing each chapter's timestamp and attaching a
    /// [`RealignmentRecord`] (SPEC_FULL.md §4.9, supplemented from
    /// `processing_pipeline.py`'s realignment driver). `threshold_secs` is
    /// typically `max(30, 1.5 * |claimed_duration - actual_duration|)`.
    pub async fn realign_chapters(&mut self, source: &CueSource, use_vad: bool, threshold_secs: f64) -> Result<()> {
        if self.state.chapters.len() != source.cues.len() {
            return Err(AppError::InvariantViolated("realignment source must have one cue per chapter".to_string()));
        }
        if self.state.chapters.is_empty() {
            return Ok(());
        }

        let path = self.state.working_path.clone().ok_or_else(|| AppError::InvariantViolated("no working file".to_string()))?;
        let target_duration = self.state.total_duration_secs;
        let source_chapters: Vec<f64> = source.cues.iter().map(|c| c.timestamp_secs).collect();

        let prior_a = if source.claimed_duration_secs > 0.0 { target_duration / source.claimed_duration_secs } else { 1.0 };
        let predicted: Vec<f64> = source_chapters.iter().map(|&s| (prior_a * s).clamp(0.0, (target_duration - 0.01).max(0.0))).collect();

        // Short, padded windows around each predicted cut — not the full
        // inter-cut segment — so unrelated audio in the middle of a long
        // chapter never competes for `best_candidate` assignment (SPEC_FULL.md
        // "Supplemented sub-routine — realignment driver").
        let padding = threshold_secs.max(0.0);
        let raw_windows: Vec<(f64, f64)> = predicted
            .iter()
            .map(|&cut| ((cut - padding).max(0.0), (cut + padding).min(target_duration)))
            .filter(|&(start, end)| start < end)
            .collect();
        let windows = merge_intervals(raw_windows);

        let out_dir = self.state.temp_dir.clone();
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        let extracted = self
            .run_stage(StageKind::Extraction, {
                let windows = windows.clone();
                let path = path.clone();
                async move {
                    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("m4a").to_lowercase();
                    let mut pieces = Vec::with_capacity(windows.len());
                    for &(start, end) in &windows {
                        if cancel.is_cancelled() {
                            return Ok(None);
                        }
                        let dest = out_dir.join(format!("realign_{}.{extension}", Uuid::new_v4()));
                        let result = extractor::extract_range(&path, start, end, &dest, true, cancel.clone(), Some(&registry)).await?;
                        match result {
                            Some(true) => pieces.push(dest),
                            Some(false) => {}
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(pieces))
                }
            })
            .await?;
        let Some(pieces) = extracted else { return Err(AppError::Cancelled) };
        if pieces.len() != windows.len() {
            return Err(AppError::InvariantViolated("mismatch between extracted segments and realignment windows".to_string()));
        }

        let asr_buffer = self.state.config.asr_buffer_secs;
        let mut cues = Vec::new();
        for (&(window_start, _), segment_path) in windows.iter().zip(pieces.iter()) {
            let cancel = self.cancel.clone();
            let registry = self.registry.clone();
            let result = if use_vad {
                let input = vad::VadInput { path: segment_path.clone(), global_start_secs: window_start };
                vad::detect(&input, cancel, Some(&registry)).await?
            } else {
                let threshold_db = silence::default_threshold_db();
                let min_duration = self.state.config.min_silence_duration_secs;
                silence::detect(segment_path, threshold_db, min_duration, window_start, cancel, Some(&registry)).await?
            };
            if let Some(silences) = result {
                for s in silences {
                    cues.push(AlignCue { time_secs: s.cue_point(asr_buffer), silence_duration_secs: s.duration_secs() });
                }
            }
        }

        for file in pieces.iter() {
            let _ = tokio::fs::remove_file(file).await;
        }

        let aligned = align::align(&source_chapters, source.claimed_duration_secs, &cues, target_duration, threshold_secs, 0);

        for ((chapter, &original), result) in self.state.chapters.iter_mut().zip(source_chapters.iter()).zip(aligned.iter()) {
            chapter.timestamp_secs = result.predicted_timestamp_secs;
            chapter.realignment =
                Some(RealignmentRecord { original_timestamp_secs: original, confidence: result.confidence, is_guess: result.is_guess });
        }

        self.publish_chapters();
        Ok(())
    }

    // ---- restart / rollback ----------------------------------------------

    /// Aborts any in-flight stage, clears every artifact produced at or
    /// after `target`'s position in the flow, and transitions to `target`.
    /// The ladder is driven by [`Step::flow_rank`]: an artifact is cleared
    /// iff its producing step's rank is `>= target`'s rank (SPEC_FULL.md
    /// §4.12: "trimmed files, segment files, detected silences and coverage
    /// maps, selected cues, and initial_chapter_selection_available").
    pub async fn restart(&mut self, target: Step) -> Result<()> {
        self.cancel.cancel();
        for (_, handle) in self.task_handles.drain() {
            handle.abort();
        }
        self.cancel = CancelToken::new();

        let rank = target.flow_rank();

        if rank <= Step::Trimming.flow_rank() {
            self.cleanup_paths(std::mem::take(&mut self.state.trimmed_segments)).await;
            self.state.transcriptions.clear();
        }
        if rank <= Step::AudioExtraction.flow_rank() {
            self.cleanup_paths(std::mem::take(&mut self.state.extracted_segments)).await;
            self.cleanup_paths(std::mem::take(&mut self.state.asr_segments)).await;
        }
        if rank <= Step::CueSetSelection.flow_rank() {
            self.state.selected_cues.clear();
        }
        if rank <= Step::AudioAnalysis.flow_rank() {
            self.state.detected_silences.clear();
            self.state.silence_coverage = CoverageTracker::new();
            self.state.vad_coverage = CoverageTracker::new();
            self.state.cue_sources.clear();
        }
        if rank <= Step::ChapterEditing.flow_rank() {
            self.state.chapters.clear();
            self.state.history = ChapterHistory::new();
        }

        if target == Step::Idle {
            self.cleanup_paths(std::mem::take(&mut self.state.partial_scan_temp_files)).await;
            let _ = tokio::fs::remove_dir_all(&self.state.temp_dir).await;
            self.state.source = None;
            self.state.working_path = None;
            self.state.total_duration_secs = 0.0;
        }

        self.set_step(target);
        Ok(())
    }

    // ---- partial rescan ----------------------------------------------------

    async fn run_detector_region(&self, scan_type: ScanType, path: &Path, global_offset: f64) -> Result<Option<Vec<crate::model::DetectedSilence>>> {
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        match scan_type {
            ScanType::Silence => {
                let threshold = silence::default_threshold_db();
                let min_duration = self.state.config.min_silence_duration_secs;
                silence::detect(path, threshold, min_duration, global_offset, cancel, Some(&registry)).await
            }
            ScanType::Vad => {
                let input = vad::VadInput { path: path.to_path_buf(), global_start_secs: global_offset };
                vad::detect(&input, cancel, Some(&registry)).await
            }
        }
    }

    async fn extract_range_to_temp(&self, path: &Path, start: f64, end: f64) -> Result<Option<PathBuf>> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("m4a").to_lowercase();
        let dest = self.state.temp_dir.join(format!("partial_{}.{extension}", Uuid::new_v4()));
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        match extractor::extract_range(path, start, end, &dest, true, cancel, Some(&registry)).await? {
            Some(_) => Ok(Some(dest)),
            None => Ok(None),
        }
    }

    async fn extract_split_to_temp(&self, path: &Path, sub_start: f64, sub_end: f64, cut_points: &[f64]) -> Result<Option<Vec<PathBuf>>> {
        let local_cuts: Vec<f64> = cut_points.iter().map(|&t| t - sub_start).collect();
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        extractor::extract_subrange_split(path, sub_start, sub_end, &local_cuts, &self.state.temp_dir, cancel, Some(&registry)).await
    }

    /// Re-scans `(chapters[chapter_index].timestamp, chapters[chapter_index
    /// + 1].timestamp)` (or end of item for the last chapter) for
    /// boundaries missed by the original pass, consulting
    /// [`CoverageTracker`] so already-scanned sub-ranges are neither
    /// re-extracted nor re-detected (SPEC_FULL.md §4.12's nine-step
    /// subroutine).
    pub async fn partial_rescan(&mut self, chapter_index: usize, scan_type: ScanType) -> Result<()> {
        let chapter_start = self
            .state
            .chapters
            .get(chapter_index)
            .ok_or_else(|| AppError::InvariantViolated("chapter index out of range".to_string()))?
            .timestamp_secs;
        let region_end = self.state.chapters.get(chapter_index + 1).map(|c| c.timestamp_secs).unwrap_or(self.state.total_duration_secs);

        self.set_step(Step::PartialScanPrep);

        let already_scanned = match scan_type {
            ScanType::Vad => self.state.vad_coverage.clone(),
            ScanType::Silence => self.state.silence_coverage.merged_with(&self.state.vad_coverage),
        };

        let uncovered = already_scanned.uncovered(chapter_start, region_end);
        if uncovered.is_empty() {
            self.set_step(Step::ChapterEditing);
            return Ok(());
        }

        let duration = self.state.total_duration_secs;
        let expanded: Vec<(f64, f64)> =
            uncovered.iter().map(|&(s, e)| ((s - PARTIAL_RESCAN_EXPAND_SECS).max(0.0), (e + PARTIAL_RESCAN_EXPAND_SECS).min(duration))).collect();
        let merged_expanded = merge_intervals(expanded);
        let total_expanded: f64 = merged_expanded.iter().map(|&(s, e)| e - s).sum();

        let path = self.state.working_path.clone().ok_or_else(|| AppError::InvariantViolated("no working file".to_string()))?;
        self.set_step(if scan_type == ScanType::Vad { Step::PartialVadAnalysis } else { Step::PartialAudioAnalysis });

        let mut new_silences = Vec::new();

        if total_expanded >= PARTIAL_RESCAN_REUSE_FULL_FILE_RATIO * duration {
            let result = self.run_detector_region(scan_type, &path, 0.0).await?;
            let Some(mut result) = result else { return Err(AppError::Cancelled) };
            new_silences.append(&mut result);
        } else {
            for (sub_start, sub_end) in &merged_expanded {
                let long_covered: Vec<(f64, f64)> = already_scanned
                    .intervals()
                    .iter()
                    .filter(|&&(s, e)| s >= *sub_start && e <= *sub_end && (e - s) > PARTIAL_RESCAN_LONG_COVERED_SPLIT_SECS)
                    .cloned()
                    .collect();

                if long_covered.is_empty() {
                    let extracted = self.extract_range_to_temp(&path, *sub_start, *sub_end).await?;
                    let Some(extracted) = extracted else { return Err(AppError::Cancelled) };
                    self.state.partial_scan_temp_files.push(extracted.clone());
                    let result = self.run_detector_region(scan_type, &extracted, *sub_start).await?;
                    let Some(mut result) = result else { return Err(AppError::Cancelled) };
                    new_silences.append(&mut result);
                } else {
                    let mut cut_points: Vec<f64> = long_covered.iter().flat_map(|&(s, e)| [s, e]).collect();
                    cut_points.retain(|&t| t > *sub_start && t < *sub_end);
                    cut_points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    cut_points.dedup_by(|a, b| (*a - *b).abs() < 1e-6);

                    let pieces = self.extract_split_to_temp(&path, *sub_start, *sub_end, &cut_points).await?;
                    let Some(pieces) = pieces else { return Err(AppError::Cancelled) };

                    let mut boundaries = vec![*sub_start];
                    boundaries.extend(cut_points.iter().copied());
                    boundaries.push(*sub_end);

                    for (piece_path, window) in pieces.into_iter().zip(boundaries.windows(2)) {
                        let (piece_start, piece_end) = (window[0], window[1]);
                        let is_covered_piece = long_covered.iter().any(|&(s, e)| s <= piece_start + 0.01 && piece_end <= e + 0.01);
                        if is_covered_piece {
                            let _ = tokio::fs::remove_file(&piece_path).await;
                            continue;
                        }
                        self.state.partial_scan_temp_files.push(piece_path.clone());
                        let result = self.run_detector_region(scan_type, &piece_path, piece_start).await?;
                        let Some(mut result) = result else { return Err(AppError::Cancelled) };
                        new_silences.append(&mut result);
                    }
                }
            }
        }

        new_silences.sort_by(|a, b| a.start_secs.partial_cmp(&b.start_secs).unwrap_or(std::cmp::Ordering::Equal));
        for silence in new_silences {
            let is_duplicate =
                self.state.detected_silences.iter().any(|existing| (existing.start_secs - silence.start_secs).abs() < NEW_SILENCE_DEDUP_TOLERANCE_SECS);
            if !is_duplicate {
                self.state.detected_silences.push(silence);
            }
        }
        self.state.detected_silences.sort_by(|a, b| a.start_secs.partial_cmp(&b.start_secs).unwrap_or(std::cmp::Ordering::Equal));

        for &(s, e) in &merged_expanded {
            match scan_type {
                ScanType::Vad => self.state.vad_coverage.add(s, e),
                ScanType::Silence => self.state.silence_coverage.add(s, e),
            }
        }

        self.cleanup_paths(std::mem::take(&mut self.state.partial_scan_temp_files)).await;
        self.set_step(Step::ChapterEditing);
        Ok(())
    }

    // ---- submit -------------------------------------------------------------

    async fn cleanup_all(&mut self) {
        let _ = tokio::fs::remove_dir_all(&self.state.temp_dir).await;
    }

    fn require_submit_step(&self) -> Result<()> {
        if !matches!(self.state.step, Step::ChapterEditing | Step::Reviewing) {
            return Err(AppError::InvariantViolated("submit requires chapter_editing or reviewing".to_string()));
        }
        Ok(())
    }

    pub async fn submit_remote(&mut self, client: &dyn RemoteLibraryClient) -> Result<()> {
        self.require_submit_step()?;
        let Some(Source::Remote { item }) = &self.state.source else {
            return Err(AppError::InvariantViolated("submit_remote requires a remote source".to_string()));
        };
        let id = item.id.clone();
        let chapters: Vec<(f64, String)> = self.state.chapters.iter().filter(|c| c.contributes()).map(|c| (c.timestamp_secs, c.title.clone())).collect();
        client.upload_chapters(&id, &chapters, self.state.total_duration_secs).await?;
        self.set_step(Step::Completed);
        self.cleanup_all().await;
        Ok(())
    }

    pub async fn submit_local_single(&mut self, create_backup: bool) -> Result<()> {
        self.require_submit_step()?;
        let Some(Source::Local { item, files, .. }) = &self.state.source else {
            return Err(AppError::InvariantViolated("submit_local_single requires a local source".to_string()));
        };
        if item.processing_mode != ProcessingMode::SingleFile {
            return Err(AppError::InvariantViolated("submit_local_single requires a single-file item".to_string()));
        }
        let path = files.first().cloned().ok_or_else(|| AppError::InvariantViolated("local item has no files".to_string()))?;
        let chapters: Vec<(f64, String)> = self.state.chapters.iter().filter(|c| c.contributes()).map(|c| (c.timestamp_secs, c.title.clone())).collect();

        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        writer::write_single_file(&path, &chapters, create_backup, cancel, Some(&registry)).await?;

        self.set_step(Step::Completed);
        self.cleanup_all().await;
        Ok(())
    }

    pub async fn submit_local_grouped(&mut self, create_backup: bool) -> Result<()> {
        self.require_submit_step()?;
        let Some(Source::Local { item, files, file_starts }) = &self.state.source else {
            return Err(AppError::InvariantViolated("submit_local_grouped requires a local source".to_string()));
        };
        if item.processing_mode != ProcessingMode::MultiFileGrouped {
            return Err(AppError::InvariantViolated("submit_local_grouped requires a grouped item".to_string()));
        }

        let selected: Vec<&Chapter> = self.state.chapters.iter().filter(|c| c.contributes()).collect();
        let chapter_starts: Vec<f64> = selected.iter().map(|c| c.timestamp_secs).collect();
        writer::verify_grouped_alignment(file_starts, &chapter_starts)?;

        let titles: Vec<String> = selected.iter().map(|c| c.title.clone()).collect();
        let cancel = self.cancel.clone();
        let registry = self.registry.clone();
        writer::write_grouped_titles(files, &titles, create_backup, cancel, Some(&registry)).await?;

        self.set_step(Step::Completed);
        self.cleanup_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioFileRef, AudioItem};

    fn test_supervisor() -> PipelineSupervisor {
        PipelineSupervisor::new_for_test(PipelineConfig::default(), EventBus::default())
    }

    fn chapter_at(secs: f64) -> Chapter {
        Chapter::new(secs, format!("Chapter at {secs}"))
    }

    #[test]
    fn new_for_test_starts_idle() {
        let supervisor = test_supervisor();
        assert_eq!(supervisor.step(), Step::Idle);
    }

    #[test]
    fn refuses_second_concurrent_pipeline() {
        let first = PipelineSupervisor::new(PipelineConfig::default(), EventBus::default()).expect("first pipeline should succeed");
        let second = PipelineSupervisor::new(PipelineConfig::default(), EventBus::default());
        assert!(matches!(second, Err(AppError::InvariantViolated(_))));
        drop(first);
        let third = PipelineSupervisor::new(PipelineConfig::default(), EventBus::default());
        assert!(third.is_ok());
    }

    #[test]
    fn finalize_cue_set_merges_unaligned_cues_outside_tolerance() {
        let mut supervisor = test_supervisor();
        supervisor.state.step = Step::CueSetSelection;
        supervisor.state.total_duration_secs = 10_000.0;

        let selected = vec![Cue::new(10.0), Cue::new(100.0), Cue::new(500.0)];
        let unaligned = CueSource {
            id: "external".to_string(),
            short_name: "External".to_string(),
            long_name: "External list".to_string(),
            description: String::new(),
            claimed_duration_secs: 10_000.0,
            cues: vec![Cue::new(11.0), Cue::new(200.0), Cue::new(500.2)],
        };

        supervisor.finalize_cue_set(selected, Some(&unaligned)).unwrap();

        let timestamps: Vec<f64> = supervisor.state.selected_cues.iter().map(|c| c.timestamp_secs).collect();
        assert_eq!(timestamps, vec![10.0, 100.0, 200.0, 500.0]);
        assert_eq!(supervisor.step(), Step::AudioExtraction);
    }

    #[test]
    fn restart_to_idle_clears_every_derived_artifact() {
        let mut supervisor = test_supervisor();
        supervisor.state.step = Step::Reviewing;
        supervisor.state.source = Some(Source::Remote {
            item: AudioItem {
                id: "1".to_string(),
                display_name: "Book".to_string(),
                files: vec![AudioFileRef { path: "a.m4a".to_string(), duration_secs: 10.0 }],
                total_duration_secs: 10.0,
            },
        });
        supervisor.state.working_path = Some(PathBuf::from("/tmp/fake.m4a"));
        supervisor.state.total_duration_secs = 10.0;
        supervisor.state.selected_cues = vec![Cue::new(5.0)];
        supervisor.state.chapters = vec![chapter_at(0.0), chapter_at(5.0)];
        supervisor.state.silence_coverage.add(0.0, 10.0);

        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(supervisor.restart(Step::Idle)).unwrap();

        assert_eq!(supervisor.step(), Step::Idle);
        assert!(supervisor.state.source.is_none());
        assert!(supervisor.state.working_path.is_none());
        assert!(supervisor.state.selected_cues.is_empty());
        assert!(supervisor.state.chapters.is_empty());
        assert!(supervisor.state.silence_coverage.intervals().is_empty());
    }

    #[test]
    fn restart_to_audio_extraction_preserves_selected_cues() {
        let mut supervisor = test_supervisor();
        supervisor.state.step = Step::ConfigureAsr;
        supervisor.state.selected_cues = vec![Cue::new(5.0)];
        supervisor.state.extracted_segments = vec![PathBuf::from("/tmp/segment_0.m4a")];

        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(supervisor.restart(Step::AudioExtraction)).unwrap();

        assert_eq!(supervisor.step(), Step::AudioExtraction);
        assert_eq!(supervisor.state.selected_cues.len(), 1);
        assert!(supervisor.state.extracted_segments.is_empty());
    }

    #[test]
    fn partial_rescan_is_a_no_op_when_region_is_fully_covered() {
        let mut supervisor = test_supervisor();
        supervisor.state.total_duration_secs = 1000.0;
        supervisor.state.chapters = vec![chapter_at(0.0), chapter_at(100.0), chapter_at(200.0)];
        supervisor.state.vad_coverage.add(0.0, 1000.0);

        let result =
            tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(supervisor.partial_rescan(0, ScanType::Silence));

        assert!(result.is_ok());
        assert_eq!(supervisor.step(), Step::ChapterEditing);
        assert!(supervisor.state.detected_silences.is_empty());
    }

    #[test]
    fn submit_local_grouped_rejects_misaligned_chapters_before_writing() {
        let mut supervisor = test_supervisor();
        supervisor.state.step = Step::Reviewing;
        supervisor.state.source = Some(Source::Local {
            item: LocalItem {
                id: "folder::x".to_string(),
                display_name: "Book".to_string(),
                rel_path: "Book".to_string(),
                processing_mode: ProcessingMode::MultiFileGrouped,
                can_split: true,
                files: vec![
                    crate::model::LocalFileEntry { rel_path: "Book/01.m4a".to_string(), duration_secs: 600.0 },
                    crate::model::LocalFileEntry { rel_path: "Book/02.m4a".to_string(), duration_secs: 900.0 },
                ],
            },
            files: vec![PathBuf::from("/media/Book/01.m4a"), PathBuf::from("/media/Book/02.m4a")],
            file_starts: vec![0.0, 600.0],
        });
        supervisor.state.chapters = vec![chapter_at(0.0), chapter_at(640.0)];

        let result =
            tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(supervisor.submit_local_grouped(false));
        assert!(matches!(result, Err(AppError::InvariantViolated(_))));
    }

    #[test]
    fn run_stage_returns_the_spawned_futures_result() {
        let mut supervisor = test_supervisor();
        let result: Result<u32> =
            tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(supervisor.run_stage(StageKind::Vad, async { Ok(7) }));
        assert_eq!(result.unwrap(), 7);
    }
}
