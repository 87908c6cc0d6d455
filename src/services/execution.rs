//! Execution session router — one private run per connection.
//!
//! DESIGN
//! ======
//! Each connection owns a `SessionSlot`. `RUN` fills it with a session in
//! `Running`, hands the request to the execution backend, and spawns a relay
//! task that forwards backend events to `conn/{id}/execution-output` and
//! nowhere else. Output chunks keep their arrival order; `EXIT` is always the
//! last frame of a run.
//!
//! Policy: a `RUN` while the slot holds a `Running` or `AwaitingInput`
//! session is rejected with `SessionBusy` and the existing session is left
//! alone. A `Completed` session is simply replaced.
//!
//! PROMPT HEURISTIC
//! ================
//! `detect_input_prompt` looks at the stdout text after the last newline and
//! reports a prompt when it ends in `:` (trailing spaces/tabs ignored). It is
//! deliberately simple and has known misses:
//! - false positive: progress text such as `Loading:` flushed without a newline;
//! - false negative: prompts like `> ` or `?` that do not end in a colon.
//!
//! The flag only moves the session to `AwaitingInput` and is echoed to the
//! client as `awaiting_input`; `INPUT` is accepted in either active state.
//! Each `INPUT` bumps the session's input count; the relay clears its tail
//! when the count moves, so an answered prompt never re-arms the flag.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::exec::{ExecError, ExecEvent, ExecRequest, OutputStream};
use crate::frame::{Data, ErrorCode, Frame, MessageType};
use crate::router::TopicRouter;
use crate::state::{AppState, Connection};
use crate::topic::{ConnId, Topic};

/// Bytes of trailing stdout kept for prompt detection.
const PROMPT_TAIL_BYTES: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnId),
    #[error("an execution is already running on this connection")]
    SessionBusy,
    #[error("no active execution on this connection")]
    NoActiveSession,
    #[error(transparent)]
    Backend(#[from] ExecError),
}

impl ErrorCode for ExecutionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "E_CONNECTION_NOT_FOUND",
            Self::SessionBusy => "E_SESSION_BUSY",
            Self::NoActiveSession => "E_NO_SESSION",
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    AwaitingInput,
    Completed,
}

impl SessionState {
    /// Running or waiting for input.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::AwaitingInput)
    }
}

/// One run for one connection. Owns the backend's stdin and cancel handles.
#[derive(Debug)]
pub struct ExecutionSession {
    pub id: Uuid,
    pub state: SessionState,
    /// Lines delivered through `send_input`.
    inputs: u64,
    stdin: mpsc::Sender<String>,
    cancel: Option<oneshot::Sender<()>>,
}

/// A connection's session slot. Empty means `Idle`.
pub type SessionSlot = Arc<Mutex<Option<ExecutionSession>>>;

// =============================================================================
// OPERATIONS
// =============================================================================

/// Start a run for `conn_id`. Returns the new session id.
///
/// # Errors
///
/// - `SessionBusy` if a session is `Running` or `AwaitingInput`.
/// - `Backend` if the backend refused to start the run.
/// - `ConnectionNotFound` if the connection is gone.
pub async fn run_request(state: &AppState, conn_id: ConnId, request: ExecRequest) -> Result<Uuid, ExecutionError> {
    let Some(conn) = state.connections.get(conn_id).await else {
        return Err(ExecutionError::ConnectionNotFound(conn_id));
    };

    let mut slot = conn.session.lock().await;
    if slot.as_ref().is_some_and(|s| s.state.is_active()) {
        debug!(%conn_id, "execution: run rejected, session busy");
        return Err(ExecutionError::SessionBusy);
    }

    let language = request.language.clone();
    let handle = state.backend.execute(request).await?;
    let session_id = Uuid::new_v4();
    *slot = Some(ExecutionSession {
        id: session_id,
        state: SessionState::Running,
        inputs: 0,
        stdin: handle.stdin,
        cancel: Some(handle.cancel),
    });
    drop(slot);

    info!(%conn_id, %session_id, room_id = %conn.room_id, %language, "execution: session started");
    tokio::spawn(relay(
        state.router.clone(),
        conn.session.clone(),
        conn_id,
        conn.room_id.clone(),
        session_id,
        handle.events,
    ));
    Ok(session_id)
}

/// Write one line of standard input to the active session.
///
/// # Errors
///
/// Returns `NoActiveSession` when nothing is running, `ConnectionNotFound`
/// when the connection is gone.
pub async fn send_input(state: &AppState, conn_id: ConnId, line: String) -> Result<(), ExecutionError> {
    let Some(conn) = state.connections.get(conn_id).await else {
        return Err(ExecutionError::ConnectionNotFound(conn_id));
    };

    let stdin = {
        let mut slot = conn.session.lock().await;
        let Some(session) = slot.as_mut().filter(|s| s.state.is_active()) else {
            return Err(ExecutionError::NoActiveSession);
        };
        session.state = SessionState::Running;
        session.inputs += 1;
        session.stdin.clone()
    };
    stdin.send(line).await.map_err(|_| ExecutionError::NoActiveSession)
}

/// Drop the connection's session, cancelling the backend run if it is still
/// active. Returns `true` if a live run was cancelled.
pub async fn discard(conn: &Connection) -> bool {
    let Some(mut session) = conn.session.lock().await.take() else {
        return false;
    };
    let active = session.state.is_active();
    if active {
        if let Some(cancel) = session.cancel.take() {
            let _ = cancel.send(());
        }
        info!(conn_id = %conn.id, session_id = %session.id, "execution: session discarded");
    }
    active
}

// =============================================================================
// RELAY
// =============================================================================

async fn relay(
    router: TopicRouter,
    slot: SessionSlot,
    conn_id: ConnId,
    room_id: String,
    session_id: Uuid,
    mut events: mpsc::Receiver<ExecEvent>,
) {
    let topic = Topic::execution_output(conn_id);
    let mut prompt = PromptTail::default();
    let mut exit_code = None;

    while let Some(event) = events.recv().await {
        match event {
            ExecEvent::Output { stream, chunk } => {
                let Some(awaiting) = observe_output(&slot, session_id, &mut prompt, stream, &chunk).await else {
                    // Discarded by teardown; nobody is listening any more.
                    return;
                };
                let frame = Frame::request(MessageType::Output, Data::new())
                    .with_room_id(&room_id)
                    .with_content(chunk)
                    .with_data("stream", stream.as_str())
                    .with_data("error", stream.is_error())
                    .with_data("awaiting_input", awaiting)
                    .with_data("session_id", session_id.to_string());
                router.publish(&topic, frame).await;
            }
            ExecEvent::Exited { code } => {
                exit_code = code;
                break;
            }
        }
    }

    if !complete(&slot, session_id).await {
        return;
    }
    let content = match exit_code {
        Some(code) => format!("\nProcess finished with exit code {code}"),
        None => "\nProcess terminated".to_owned(),
    };
    let frame = Frame::request(MessageType::Exit, Data::new())
        .with_room_id(&room_id)
        .with_content(content)
        .with_data("exit_code", exit_code)
        .with_data("session_id", session_id.to_string());
    router.publish(&topic, frame).await;
    info!(%conn_id, %session_id, ?exit_code, "execution: session completed");
}

/// Trailing stdout since the last answered prompt.
#[derive(Debug, Default)]
struct PromptTail {
    text: String,
    inputs_seen: u64,
}

/// Feed one chunk through prompt detection and move the session between
/// `Running` and `AwaitingInput`. `None` once the slot no longer holds
/// `session_id`.
async fn observe_output(
    slot: &SessionSlot,
    session_id: Uuid,
    prompt: &mut PromptTail,
    stream: OutputStream,
    chunk: &str,
) -> Option<bool> {
    let mut slot = slot.lock().await;
    let session = slot.as_mut().filter(|s| s.id == session_id)?;
    if session.inputs != prompt.inputs_seen {
        prompt.text.clear();
        prompt.inputs_seen = session.inputs;
    }
    if stream == OutputStream::Stdout {
        advance_tail(&mut prompt.text, chunk);
    }
    let awaiting = detect_input_prompt(&prompt.text);
    session.state = if awaiting { SessionState::AwaitingInput } else { SessionState::Running };
    Some(awaiting)
}

/// Mark the slot's session `Completed` if it is still `session_id`.
async fn complete(slot: &SessionSlot, session_id: Uuid) -> bool {
    let mut slot = slot.lock().await;
    match slot.as_mut() {
        Some(session) if session.id == session_id => {
            session.state = SessionState::Completed;
            session.cancel = None;
            true
        }
        _ => false,
    }
}

// =============================================================================
// PROMPT DETECTION
// =============================================================================

/// Keep the unterminated last line of stdout, bounded to `PROMPT_TAIL_BYTES`.
fn advance_tail(tail: &mut String, chunk: &str) {
    match chunk.rfind('\n') {
        Some(i) => {
            tail.clear();
            tail.push_str(&chunk[i + 1..]);
        }
        None => tail.push_str(chunk),
    }
    if tail.len() > PROMPT_TAIL_BYTES {
        let mut cut = tail.len() - PROMPT_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Interactive-prompt heuristic over trailing output: the text after the
/// last newline, minus trailing spaces and tabs, ends with `:`.
#[must_use]
pub fn detect_input_prompt(tail: &str) -> bool {
    let last_line = tail.rsplit('\n').next().unwrap_or_default();
    last_line.trim_end_matches([' ', '\t']).ends_with(':')
}

#[cfg(test)]
#[path = "execution_test.rs"]
mod tests;
