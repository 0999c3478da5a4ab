// Error taxonomy for the pipeline engine
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Run-fatal errors. Anything that reaches the orchestrator as a `PipelineError`
/// stops the run; per-item failures travel as `StageError` instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid transition for item {item} at stage '{stage}': {reason}")]
    InvalidTransition {
        item: String,
        stage: String,
        reason: String,
    },
    #[error("Corrupt checkpoint at {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Discovery input error: {0}")]
    Discovery(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn invalid_transition(
        item: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PipelineError::InvalidTransition {
            item: item.into(),
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Timeouts, rate-limit rejections, 5xx-class service errors.
    Retryable,
    /// Malformed input, invalid credentials, unsupported content.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Retryable => write!(f, "retryable"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure reported by a stage processor for a single item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} stage error: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }
}
