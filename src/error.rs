use std::path::PathBuf;
use thiserror::Error;

/// Failures the evaluation core reports to its caller.
///
/// Transport and response-format failures never reach this type; the rater
/// turns them into the sentinel rating.
#[derive(Debug, Error)]
pub enum EvalError {
    /// An asset a comparison depends on is missing or cannot be decoded.
    #[error("missing or unreadable asset {path}: {reason}")]
    MissingAsset { path: PathBuf, reason: String },

    #[error("metadata.json not found under {0}")]
    MetadataNotFound(PathBuf),

    #[error("malformed metadata in {path}: {reason}")]
    MalformedMetadata { path: PathBuf, reason: String },

    #[error("unsupported loop type {0:?} (expected \"I-T-I\" or \"T-I-T\")")]
    UnsupportedLoopType(String),

    #[error("experiment root {0} is not a directory")]
    InvalidExperimentRoot(PathBuf),
}

impl EvalError {
    pub fn missing_asset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MissingAsset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
