use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by the sandbox lifecycle API.
///
/// Failures of the user's script never appear here; they are classified into
/// [`crate::ExecutionError`] inside the returned [`crate::ExecutionResult`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid sandbox configuration: {0}")]
    ConfigError(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox {0} has been destroyed")]
    Destroyed(String),

    #[error("Sandbox {0} is in an unrecoverable error state")]
    Faulted(String),

    #[error("Sandbox limit reached ({0} live sandboxes)")]
    CapacityExceeded(usize),

    #[error("Worker binary not found; set SCRIPTSANDBOX_WORKER or install scriptsandbox-worker")]
    WorkerNotFound,

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}
