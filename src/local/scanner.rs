//! C7 — LocalLibraryScanner. Deterministic, sandboxed scan of a local root,
//! classifying items as single-file or grouped-folder audiobooks
//! (SPEC_FULL.md §4.7). Grounded on the teacher's `audio::file_list`
//! (lofty-backed probing/validation), generalized from "validate a flat list
//! of paths" to "recursively discover and classify items under a sandbox
//! root".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{AppError, Result};
use crate::local::ids::encode_item_id;
use crate::model::{LocalFileEntry, LocalItem, ProcessingMode};

const SUPPORTED_EXTENSIONS: [&str; 2] = ["m4b", "m4a"];
const GROUPED_FOLDER_MIN_FILES: usize = 2;

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Compares two strings with numeric runs treated as integers and the rest
/// compared case-insensitively — a natural sort (SPEC_FULL.md §4.7).
pub fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(ac), Some(bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let mut a_num = String::new();
                    while let Some(c) = ai.peek() {
                        if c.is_ascii_digit() {
                            a_num.push(*c);
                            ai.next();
                        } else {
                            break;
                        }
                    }
                    let mut b_num = String::new();
                    while let Some(c) = bi.peek() {
                        if c.is_ascii_digit() {
                            b_num.push(*c);
                            bi.next();
                        } else {
                            break;
                        }
                    }
                    let a_val: u128 = a_num.parse().unwrap_or(0);
                    let b_val: u128 = b_num.parse().unwrap_or(0);
                    match a_val.cmp(&b_val) {
                        std::cmp::Ordering::Equal => continue,
                        other => return other,
                    }
                } else {
                    let a_lower = ac.to_ascii_lowercase();
                    let b_lower = bc.to_ascii_lowercase();
                    match a_lower.cmp(&b_lower) {
                        std::cmp::Ordering::Equal => {
                            ai.next();
                            bi.next();
                            continue;
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

/// Resolves both paths following symlinks and verifies `root` is equal to
/// or nested inside `sandbox_base` (SPEC_FULL.md §4.7).
fn verify_sandboxed(root: &Path, sandbox_base: &Path) -> Result<(PathBuf, PathBuf)> {
    let resolved_root = root
        .canonicalize()
        .map_err(|e| AppError::InputMissing(format!("cannot resolve root {}: {e}", root.display())))?;
    let resolved_base = sandbox_base
        .canonicalize()
        .map_err(|e| AppError::InputMissing(format!("cannot resolve sandbox base {}: {e}", sandbox_base.display())))?;

    if resolved_root != resolved_base && !resolved_root.starts_with(&resolved_base) {
        return Err(AppError::InputMissing(format!(
            "{} escapes sandbox base {}",
            resolved_root.display(),
            resolved_base.display()
        )));
    }

    Ok((resolved_root, resolved_base))
}

/// Probes a single candidate file, confirming it is a regular file with a
/// supported extension, non-zero size, and a determinable positive
/// duration. Reads properties with `lofty` rather than shelling out to the
/// prober, since a scan may walk thousands of candidates and a library read
/// is far cheaper than a subprocess per file (SPEC_FULL.md §4.7). Mirrors
/// the teacher's `file_list::validate_audio_format` probe-then-read style.
async fn validate_file(path: &Path) -> Result<f64> {
    let metadata = tokio::fs::metadata(path).await.map_err(AppError::Io)?;
    if !metadata.is_file() {
        return Err(AppError::InputMissing(format!("{} is not a regular file", path.display())));
    }
    if metadata.len() == 0 {
        return Err(AppError::InputMissing(format!("{} is empty", path.display())));
    }
    if !has_supported_extension(path) {
        return Err(AppError::InputMissing(format!("{} has an unsupported extension", path.display())));
    }

    let owned_path = path.to_path_buf();
    let duration_secs = tokio::task::spawn_blocking(move || -> Result<f64> {
        use lofty::file::AudioFile;

        let tagged_file = lofty::probe::Probe::open(&owned_path)?.read()?;
        let duration = tagged_file.properties().duration().as_secs_f64();
        if duration <= 0.0 {
            return Err(AppError::InputMissing(format!("{} has no determinable duration", owned_path.display())));
        }
        Ok(duration)
    })
    .await
    .map_err(|e| AppError::Other(format!("lofty probe task panicked: {e}")))??;

    Ok(duration_secs)
}

/// Deep-copy-on-read cache of a directory scan, keyed by the resolved root.
#[derive(Default)]
pub struct ScanCache {
    entries: Mutex<HashMap<PathBuf, Vec<LocalItem>>>,
}

impl ScanCache {
    pub fn new() -> Self {
        ScanCache::default()
    }

    fn get(&self, key: &Path) -> Option<Vec<LocalItem>> {
        self.entries.lock().expect("scan cache poisoned").get(key).cloned()
    }

    fn put(&self, key: PathBuf, items: Vec<LocalItem>) {
        self.entries.lock().expect("scan cache poisoned").insert(key, items);
    }

    pub fn invalidate(&self, key: &Path) {
        self.entries.lock().expect("scan cache poisoned").remove(key);
    }
}

/// Scans `root` (sandboxed under `sandbox_base`) for local audiobook items.
/// Returns a cached deep copy unless `refresh` is set (SPEC_FULL.md §4.7).
pub async fn scan(root: &Path, sandbox_base: &Path, refresh: bool, cache: &ScanCache) -> Result<Vec<LocalItem>> {
    let (resolved_root, _resolved_base) = verify_sandboxed(root, sandbox_base)?;

    if !refresh {
        if let Some(cached) = cache.get(&resolved_root) {
            return Ok(cached);
        }
    }

    let items = scan_uncached(&resolved_root).await?;
    cache.put(resolved_root, items.clone());
    Ok(items)
}

async fn scan_uncached(root: &Path) -> Result<Vec<LocalItem>> {
    let mut items = Vec::new();
    let mut dir_entries = tokio::fs::read_dir(root).await.map_err(AppError::Io)?;
    let mut top_level = Vec::new();
    while let Some(entry) = dir_entries.next_entry().await.map_err(AppError::Io)? {
        if is_hidden(&entry.path()) {
            continue;
        }
        top_level.push(entry.path());
    }
    top_level.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));

    for path in top_level {
        let file_type = tokio::fs::metadata(&path).await.map_err(AppError::Io)?.file_type();

        if file_type.is_dir() {
            if let Some(item) = scan_folder(root, &path).await? {
                items.push(item);
            }
        } else if file_type.is_file() && has_supported_extension(&path) {
            if let Some(item) = scan_single_file(root, &path).await {
                items.push(item);
            }
        }
    }

    items.sort_by(|a, b| natural_cmp(&a.rel_path, &b.rel_path));
    Ok(items)
}

async fn scan_folder(root: &Path, dir: &Path) -> Result<Option<LocalItem>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(AppError::Io)?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(AppError::Io)? {
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        if path.is_file() && has_supported_extension(&path) {
            candidates.push(path);
        }
    }

    if candidates.len() < GROUPED_FOLDER_MIN_FILES {
        return Ok(None);
    }

    candidates.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));

    let mut files = Vec::with_capacity(candidates.len());
    for path in &candidates {
        let duration_secs = match validate_file(path).await {
            Ok(d) => d,
            Err(_) => continue,
        };
        let rel_path = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        files.push(LocalFileEntry { rel_path, duration_secs });
    }

    if files.len() < GROUPED_FOLDER_MIN_FILES {
        return Ok(None);
    }

    let rel_path = dir.strip_prefix(root).unwrap_or(dir).to_string_lossy().replace('\\', "/");
    let display_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("book").to_string();

    Ok(Some(LocalItem {
        id: encode_item_id("folder", &rel_path),
        display_name,
        rel_path,
        processing_mode: ProcessingMode::MultiFileGrouped,
        can_split: true,
        files,
    }))
}

async fn scan_single_file(root: &Path, path: &Path) -> Option<LocalItem> {
    let duration_secs = validate_file(path).await.ok()?;
    let rel_path = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
    let display_name = path.file_stem().and_then(|n| n.to_str()).unwrap_or("book").to_string();

    Some(LocalItem {
        id: encode_item_id("file", &rel_path),
        display_name,
        rel_path: rel_path.clone(),
        processing_mode: ProcessingMode::SingleFile,
        can_split: false,
        files: vec![LocalFileEntry { rel_path, duration_secs }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_sort_orders_numeric_runs_as_integers() {
        let mut names = vec!["track10.m4a", "track2.m4a", "track1.m4a"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["track1.m4a", "track2.m4a", "track10.m4a"]);
    }

    #[test]
    fn natural_sort_is_case_insensitive_outside_numeric_runs() {
        let mut names = vec!["Bravo", "alpha", "Charlie"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["alpha", "Bravo", "Charlie"]);
    }

    #[test]
    fn natural_sort_is_stable_on_already_sorted_input() {
        let sorted = vec!["a1", "a2", "a10", "b1"];
        let mut copy = sorted.clone();
        copy.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(copy, sorted);
    }

    #[test]
    fn hidden_entries_are_ignored() {
        assert!(is_hidden(Path::new("/media/.hidden.m4b")));
        assert!(!is_hidden(Path::new("/media/book.m4b")));
    }

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(has_supported_extension(Path::new("book.M4B")));
        assert!(has_supported_extension(Path::new("book.m4a")));
        assert!(!has_supported_extension(Path::new("book.mp3")));
    }

    #[tokio::test]
    async fn scan_rejects_root_outside_sandbox() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let cache = ScanCache::new();
        let result = scan(outside.path(), base.path(), false, &cache).await;
        assert!(matches!(result, Err(AppError::InputMissing(_))));
    }

    #[tokio::test]
    async fn scan_allows_root_equal_to_sandbox_base() {
        let base = tempfile::tempdir().unwrap();
        let cache = ScanCache::new();
        let items = scan(base.path(), base.path(), false, &cache).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn scan_cache_returns_deep_copy() {
        let base = tempfile::tempdir().unwrap();
        let cache = ScanCache::new();
        let mut items = scan(base.path(), base.path(), false, &cache).await.unwrap();
        items.push(LocalItem {
            id: "file::x".to_string(),
            display_name: "mutated".to_string(),
            rel_path: "mutated.m4a".to_string(),
            processing_mode: ProcessingMode::SingleFile,
            can_split: false,
            files: vec![],
        });
        let reread = scan(base.path(), base.path(), false, &cache).await.unwrap();
        assert!(reread.is_empty());
    }
}
