use std::path::PathBuf;

/// Coarse classification shared by every error type in the workspace.
///
/// Each layer keeps its own error enum; `kind()` maps it onto this
/// taxonomy so callers (and tests) can branch on the cause without
/// matching on nested variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A local file is missing.
    NotFound,
    /// The server answered 401.
    Unauthorized,
    /// The server answered with any other non-success status.
    RemoteRejected,
    /// Connection, TLS, timeout or stream-level failure.
    TransportFailure,
    /// A message arrived with an unexpected shape or at an unexpected time.
    ProtocolViolation,
    /// Result bytes are not a recognised image container.
    DecodeError,
    /// The job completed without producing any image.
    NoOutput,
    /// Invalid local input (e.g. a template missing its loader nodes).
    Validation,
    /// Local filesystem failure while reading or writing.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),

    #[error("No output: {0}")]
    NoOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Decode(_) => ErrorKind::DecodeError,
            CoreError::Encode(_) => ErrorKind::Io,
            CoreError::NoOutput(_) => ErrorKind::NoOutput,
            CoreError::Io(_) => ErrorKind::Io,
        }
    }
}
