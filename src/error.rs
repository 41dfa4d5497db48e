use std::path::PathBuf;

/// Error taxonomy for mirror operations.
///
/// Tasks decide how to react based on the kind: transient and checksum
/// failures are retried with backoff, format and registry failures are
/// logged and the offending package skipped, auth and local I/O failures
/// abort the run.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("bad package format: {0}")]
    Format(String),

    #[error("registry error ({status}): {message}")]
    Registry { status: u16, message: String },

    #[error("local i/o error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl MirrorError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::Transient(_) | MirrorError::Checksum { .. }
        )
    }

    /// Whether the failure concerns only the package at hand, so the rest
    /// of the run can proceed.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            MirrorError::Format(_) | MirrorError::Registry { .. }
        )
    }

    /// Classify an HTTP status from the registry.
    pub fn from_status(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status.as_u16() {
            401 | 403 => MirrorError::Auth(message),
            s if status.is_server_error() => {
                MirrorError::Transient(format!("registry returned {s}: {message}"))
            }
            s => MirrorError::Registry { status: s, message },
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => MirrorError::from_status(status, err.to_string()),
            None => MirrorError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Format(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
