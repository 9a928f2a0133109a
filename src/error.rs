//! Error types for the conformance harness.
//!
//! Errors are propagated as values. Teardown paths treat [`Error::NotFound`]
//! as success, the image-aware create path recovers from
//! [`Error::ImageMissing`] once, and everything else that escapes a scenario
//! body is reported by the runner as a failure of the current leaf.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a CRI runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The runtime endpoint cannot be reached or reports itself not ready.
    #[error("runtime unavailable at '{endpoint}': {reason}")]
    RuntimeUnavailable { endpoint: String, reason: String },

    /// Sandbox, container, or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime rejected a configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Resource is in the wrong state for the operation.
    #[error("'{id}' is in an invalid state: {reason}")]
    InvalidState { id: String, reason: String },

    /// CreateContainer failed because the image is not present.
    #[error("image missing: {0}")]
    ImageMissing(String),

    // =========================================================================
    // Timing Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation was cancelled before completing.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// StopContainer did not return before its watchdog fired.
    #[error("stopping container '{id}' did not complete within {timeout:?}")]
    StopTimedOut { id: String, timeout: Duration },

    // =========================================================================
    // Log Errors
    // =========================================================================
    /// A container log line does not follow the CRI log format.
    #[error("malformed log line {line:?}: {reason}")]
    MalformedLogLine { line: String, reason: String },

    /// A container log file cannot be read.
    #[error("log unavailable at {path}: {reason}")]
    LogUnavailable { path: PathBuf, reason: String },

    // =========================================================================
    // Scenario Errors
    // =========================================================================
    /// An expectation did not hold.
    #[error("{0}")]
    AssertionFailed(String),

    // =========================================================================
    // Harness Errors
    // =========================================================================
    /// Harness configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Focus or skip expression failed to parse.
    #[error("invalid filter '{pattern}': {reason}")]
    Filter { pattern: String, reason: String },

    /// Transport could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps a gRPC status returned by the runtime onto the harness taxonomy.
    pub fn from_status(operation: &str, status: tonic::Status) -> Self {
        use tonic::Code;

        let message = format!("{operation}: {}", status.message());
        match status.code() {
            Code::NotFound => Self::NotFound(message),
            Code::InvalidArgument => Self::InvalidConfig(message),
            Code::FailedPrecondition => Self::InvalidState {
                id: operation.to_string(),
                reason: status.message().to_string(),
            },
            Code::DeadlineExceeded => Self::Timeout {
                operation: message,
                duration: Duration::ZERO,
            },
            Code::Cancelled => Self::Cancelled(message),
            Code::Unavailable => Self::RuntimeUnavailable {
                endpoint: operation.to_string(),
                reason: status.message().to_string(),
            },
            _ => Self::Internal(message),
        }
    }

    /// Returns true if the error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if the error is a failed expectation.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::AssertionFailed(_) | Self::StopTimedOut { .. })
    }

    /// Shorthand for an [`Error::AssertionFailed`].
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::AssertionFailed(message.into())
    }
}
