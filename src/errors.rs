use thiserror::Error;

/// Crate-wide error type. Leaf components (`media`, `local`, `align`) return
/// these; the pipeline supervisor decides which variants are recoverable and
/// which step to restart at (see `pipeline::supervisor`).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("input missing or inaccessible: {0}")]
    InputMissing(String),

    #[error("media tool failed: {0}")]
    ToolFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("media tool binary not found on PATH")]
    BinaryNotFound,

    #[error("failed to parse media tool output: {0}")]
    ParseError(String),

    #[error("tag read/write failed: {0}")]
    Metadata(String),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<lofty::error::LoftyError> for AppError {
    fn from(err: lofty::error::LoftyError) -> Self {
        AppError::Metadata(err.to_string())
    }
}

impl From<AppError> for String {
    fn from(error: AppError) -> Self {
        error.to_string()
    }
}

/// True for errors that the supervisor should surface silently as a
/// step-change rather than as a user-visible error (see SPEC_FULL.md §7).
impl AppError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_to_string_preserves_message() {
        let error = AppError::InvariantViolated("mismatched chapter count".to_string());
        let message: String = error.into();
        assert!(message.contains("mismatched chapter count"));
    }

    #[test]
    fn cancellation_is_recognized() {
        assert!(AppError::Cancelled.is_cancellation());
        assert!(!AppError::BinaryNotFound.is_cancellation());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));
    }
}
