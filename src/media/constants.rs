//! Magic numbers for the media subsystem, grouped by functional area —
//! mirrors the teacher's `audio::constants` module.

/// Process termination: graceful-then-kill polling, ~2s total budget.
pub const PROCESS_TERMINATION_MAX_ATTEMPTS: u32 = 20;
pub const PROCESS_TERMINATION_CHECK_DELAY_MS: u64 = 100;

/// Probe deadlines (SPEC_FULL.md §5).
pub const PROBE_DEADLINE_GENERAL_SECS: u64 = 120;
pub const PROBE_DEADLINE_QUICK_SECS: u64 = 20;

/// Silence detection defaults.
pub const DEFAULT_SILENCE_THRESHOLD_DB: f64 = -30.0;

/// Trimmer: ignore silences whose start is before this, to avoid cutting
/// into the head of an utterance.
pub const TRIM_MIN_SILENCE_START_SECS: f64 = 0.5;
pub const TRIM_CUT_OFFSET_SECS: f64 = 0.5;

/// Concatenation/output defaults.
pub const FFMPEG_CONCAT_FORMAT: &str = "concat";
pub const FFMPEG_CONCAT_SAFE_MODE: &str = "0";
pub const FALLBACK_SAMPLE_RATE_HZ: u32 = 44_100;
pub const TRIM_FALLBACK_SAMPLE_RATE_HZ: u32 = 16_000;

/// Container families that reject the strict `ipod` muxer and must use
/// `mp4`/forced `aac` extension instead (SPEC_FULL.md §4.4, §4.8).
pub const IPOD_INCOMPATIBLE_EXTENSIONS: [&str; 3] = ["m4b", "m4a", "mp4"];

pub const TEMP_DIR_PREFIX: &str = "achew";

/// Exit codes the transcoder conventionally uses for "terminated" or "input
/// missing", conflated by the source tool itself — surfaced as `Cancelled`
/// rather than a generic tool failure regardless of which one fired
/// (SPEC_FULL.md §6, §4.1).
pub const MEDIA_TOOL_SENTINEL_EXIT_CODES: [i32; 2] = [254, 255];
