//! Error handling for botstrap
//!
//! Every fallible library operation returns [`ProvisionError`]. Steps never
//! let these escape to the engine: they fold them into a `StepResult`, so
//! the taxonomy here doubles as the vocabulary of failure details shown
//! to the user.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`ProvisionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    NotFound,
    CommandFailed,
    Timeout,
    NetworkError,
    PermissionDenied,
    Io,
    Config,
    Validation,
    State,
    Json,
}

/// Main error type for botstrap
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Executable (or file) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Process exited with a nonzero status
    #[error("{program} failed ({}): {}", exit_label(.code), .stderr.trim())]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Process was killed after exceeding its time limit
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    /// Download or other network failure
    #[error("Network error: {0}")]
    Network(String),

    /// Insufficient privileges (spawning, writing unit files, ...)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// IO errors not covered by a more specific variant
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid arguments (zero timeout, duplicate step id, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Engine state machine misuse
    #[error("State error: {0}")]
    State(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for botstrap operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl ProvisionError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Map an IO error raised while touching `context` (a path or program)
    /// to the most specific variant.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(context.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{}: {}", context, err))
            }
            _ => Self::Io(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::State(_) => ErrorKind::State,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
