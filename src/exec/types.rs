//! Backend-neutral execution types and errors.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced while starting an execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// No toolchain is registered for the requested language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Preparing the scratch directory or spawning the process failed.
    #[error("execution setup failed: {0}")]
    Io(#[from] std::io::Error),
}

impl crate::frame::ErrorCode for ExecError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "E_UNSUPPORTED_LANGUAGE",
            Self::Io(_) => "E_EXEC_IO",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

// =============================================================================
// REQUEST / EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub code: String,
    pub language: String,
    /// Initial standard input, written before any interactive lines.
    pub stdin: Option<String>,
}

/// Which process stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, Self::Stderr)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One item on a running execution's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output { stream: OutputStream, chunk: String },
    /// Terminal. `None` when the process was killed by a signal or timed out.
    Exited { code: Option<i32> },
}

impl ExecEvent {
    #[must_use]
    pub fn output(stream: OutputStream, chunk: impl Into<String>) -> Self {
        Self::Output { stream, chunk: chunk.into() }
    }

    #[must_use]
    pub fn stderr(chunk: impl Into<String>) -> Self {
        Self::output(OutputStream::Stderr, chunk)
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Live execution. Dropping `cancel` or sending on it terminates the run.
pub struct ExecutionHandle {
    pub events: mpsc::Receiver<ExecEvent>,
    /// Lines written to the process's standard input (newline appended by the backend).
    pub stdin: mpsc::Sender<String>,
    pub cancel: oneshot::Sender<()>,
}

/// Seam between the session router and whatever actually runs code.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start running `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not be started at all. Failures after
    /// start (compile errors, crashes) arrive on the event stream instead.
    async fn execute(&self, request: ExecRequest) -> Result<ExecutionHandle, ExecError>;
}
