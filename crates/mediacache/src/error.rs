//! Engine error types.

use thiserror::Error;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Error raised by a host primitive (`add_source_buffer`, `append_buffer`).
///
/// The capturing decorators never inspect or wrap it; whatever the host
/// returned is handed back to the caller as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stream not found: {id}")]
    StreamNotFound { id: String },

    #[error("directory access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("no directory has been granted")]
    NoDirectoryGrant,

    #[error("failed to create file `{name}`: {reason}")]
    FileCreation { name: String, reason: String },

    #[error("out-of-order write on `{name}`: expected offset {expected}, got {actual}")]
    OutOfOrderWrite {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("sink `{name}` is closed")]
    SinkClosed { name: String },

    #[error("stream {id} is already attached to a sink")]
    AlreadyAttached { id: String },

    #[error("no tokio runtime available: {0}")]
    Runtime(String),

    #[error("download failed: {reason}")]
    Download { reason: String },

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("invalid `{action}` request: {reason}")]
    InvalidRequest { action: String, reason: String },
}

impl CaptureError {
    pub fn stream_not_found(id: impl Into<String>) -> Self {
        Self::StreamNotFound { id: id.into() }
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    pub fn file_creation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FileCreation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn download(reason: impl Into<String>) -> Self {
        Self::Download {
            reason: reason.into(),
        }
    }

    /// Stale references are expected when a stream is deleted while an
    /// operation on it is still in flight; callers treat them as no-ops.
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Self::StreamNotFound { .. })
    }
}
