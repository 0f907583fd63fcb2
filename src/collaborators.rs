//! Contracts for everything this crate treats as an external collaborator:
//! the remote library server, the ASR service, the LLM providers, and the
//! binary-locating contract the media runner needs. None of these are
//! implemented here (SPEC_FULL.md §1, §6) — only the shapes the pipeline
//! depends on.

use async_trait::async_trait;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::errors::Result;

/// Locates an external media tool binary. Grounded on the teacher's
/// `ffmpeg::locate_ffmpeg`, generalized so the same search strategy (bundled
/// dir, dev `binaries/`, `PATH`, common install locations) serves both the
/// transcoder and the prober.
pub trait MediaTool {
    /// The conventional binary name searched for on `PATH` (e.g. "ffmpeg").
    fn binary_name(&self) -> &str;

    fn locate(&self) -> Result<std::path::PathBuf> {
        if let Ok(path) = which::which(self.binary_name()) {
            return Ok(path);
        }
        for candidate in [
            format!("/usr/local/bin/{}", self.binary_name()),
            format!("/opt/homebrew/bin/{}", self.binary_name()),
            format!("/usr/bin/{}", self.binary_name()),
        ] {
            let path = std::path::PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(crate::errors::AppError::BinaryNotFound)
    }
}

/// A progress callback used by download/long-copy style operations.
pub type ProgressFn = Box<dyn Fn(f32) + Send + Sync>;

/// The remote audiobook library the pipeline can fetch items from and submit
/// finished chapters to. Out of scope: no implementation ships in this
/// crate; a host application supplies one.
#[async_trait]
pub trait RemoteLibraryClient: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn get_item(&self, id: &str) -> Result<crate::model::AudioItem>;

    async fn download_file(
        &self,
        id: &str,
        file_index: usize,
        dest: &Path,
        on_progress: ProgressFn,
        cancel: CancelToken,
    ) -> Result<()>;

    async fn upload_chapters(
        &self,
        id: &str,
        chapters: &[(f64, String)],
        total_duration_secs: f64,
    ) -> Result<()>;
}

/// Speech-to-text collaborator. Out of scope: consumed as a trait only.
#[async_trait]
pub trait AsrClient: Send + Sync {
    async fn transcribe(&self, audio_paths: &[std::path::PathBuf]) -> Result<Vec<String>>;
}

/// Title-cleanup LLM collaborator. A `None` entry in the result means
/// "deselect this chapter" (SPEC_FULL.md §6); the caller (history's
/// AI-cleanup batch) treats the literal string `"null"` the same way.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn process_titles(
        &self,
        titles: &[String],
        model: &str,
        options: &serde_json::Value,
    ) -> Result<Vec<Option<String>>>;
}
