use std::path::PathBuf;
use std::time::Duration;

/// Broad category of a [`SandboxError`].
///
/// Configuration and validation failures are always reported before any
/// process is spawned. Backend setup failures abort a launch with nothing
/// left running. Runtime and cancellation failures come out of `wait`/`run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    BackendSetup,
    Runtime,
    Cancellation,
}

/// Errors produced by the sandbox and its commands.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("working directory '{}' does not exist or is not a directory", .0.display())]
    WorkDirNotFound(PathBuf),

    #[error("invalid path '{}': {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command '{name}' is not allowed in {mode} mode (matches '{pattern}')")]
    CommandDenied {
        name: String,
        pattern: &'static str,
        mode: &'static str,
    },

    #[error("isolation is not supported on this platform ({0})")]
    UnsupportedPlatform(&'static str),

    #[error("{backend} backend setup failed: {reason}")]
    BackendSetup {
        backend: &'static str,
        reason: String,
    },

    #[error("failed to start '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with status {code}")]
    ExitStatus { code: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command was cancelled")]
    Cancelled,

    #[error("command already started")]
    AlreadyStarted,

    #[error("command not started")]
    NotStarted,

    #[error("process is not running")]
    NotRunning,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::WorkDirNotFound(_) | SandboxError::InvalidPath { .. } => {
                ErrorKind::Configuration
            }
            SandboxError::CommandNotFound(_) | SandboxError::CommandDenied { .. } => {
                ErrorKind::Validation
            }
            SandboxError::UnsupportedPlatform(_) | SandboxError::BackendSetup { .. } => {
                ErrorKind::BackendSetup
            }
            SandboxError::Timeout(_) | SandboxError::Cancelled => ErrorKind::Cancellation,
            SandboxError::Spawn { .. }
            | SandboxError::ExitStatus { .. }
            | SandboxError::Io(_)
            | SandboxError::AlreadyStarted
            | SandboxError::NotStarted
            | SandboxError::NotRunning => ErrorKind::Runtime,
        }
    }

    /// Exit code carried by a non-zero exit, if this is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SandboxError::ExitStatus { code } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn setup(backend: &'static str, reason: impl std::fmt::Display) -> Self {
        SandboxError::BackendSetup {
            backend,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
