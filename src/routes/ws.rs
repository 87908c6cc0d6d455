//! WebSocket handler — room connection transport.
//!
//! DESIGN
//! ======
//! The handshake runs before the upgrade: `?room=&user=&password=` go to the
//! connection manager, and a refusal is answered with a plain HTTP status so
//! the client never sees a half-open room socket. The password rides in the
//! query string, so HTTP request spans go through [`request_span`], which
//! masks it. On upgrade the handler
//! sends `CONNECTED` with the welcome snapshot and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by `type`
//! - Frames published to this connection's topics → forward to client
//!
//! Handler functions are business logic only. They call into a service and
//! return an `Outcome`; fan-out to other members happens inside the
//! services through the topic router, never here.
//!
//! LIFECYCLE
//! =========
//! 1. Handshake → upgrade → send `CONNECTED`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch turns the Outcome into a reply for the sender (or nothing)
//! 4. Close, `LEAVE`, or reaping → `teardown` → outbound queue closes → exit

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, info, warn};

use crate::exec::ExecRequest;
use crate::frame::{Data, ErrorCode, FRAME_CONTENT, Frame, MessageType, Status};
use crate::routes::rooms::directory_error_to_status;
use crate::services::connection::{self, Connected, ConnectionError, TeardownReason};
use crate::services::directory::normalize_room_id;
use crate::services::presence::{self, Activity};
use crate::services::{buffer, chat, execution};
use crate::state::AppState;
use crate::topic::ConnId;

// =============================================================================
// TYPES
// =============================================================================

/// Result returned by handler functions. Dispatch turns it into the
/// sender's reply; handlers never write to the socket.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// No reply. Used for high-rate signals (heartbeat, typing, cursors).
    Silent,
}

/// Inbound frames rejected before reaching a service.
#[derive(Debug, thiserror::Error)]
enum InboundError {
    #[error("room_id must be {0}")]
    RoomMismatch(String),
    #[error("{0} required")]
    Missing(&'static str),
    #[error("{0} is not accepted from clients")]
    Unsupported(&'static str),
}

impl ErrorCode for InboundError {
    fn error_code(&self) -> &'static str {
        "E_INVALID"
    }
}

/// Identity of the connection a frame arrived on. Fixed for its lifetime.
struct ConnCtx {
    conn_id: ConnId,
    room_id: String,
    user: String,
}

#[derive(Deserialize)]
pub struct WsParams {
    pub room: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let connected = match connection::handshake(&state, &params.room, &params.password, &params.user).await {
        Ok(connected) => connected,
        Err(e) => {
            let message = e.to_string();
            return (connection_error_to_status(e), message).into_response();
        }
    };

    let conn_id = connected.conn_id;
    let failed_state = state.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(%conn_id, error = %e, "ws: upgrade failed");
        tokio::spawn(async move {
            connection::teardown(&failed_state, conn_id, TeardownReason::Closed).await;
        });
    })
    .on_upgrade(move |socket| run_ws(socket, state, connected))
}

/// HTTP trace span with the room password masked out of the URI.
pub fn request_span(request: &Request) -> Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        uri = %redact_credentials(request.uri()),
        version = ?request.version(),
    )
}

fn redact_credentials(uri: &Uri) -> String {
    let Some(query) = uri.query() else {
        return uri.path().to_owned();
    };
    let pairs: Vec<&str> = query
        .split('&')
        .map(|pair| match pair.split_once('=').map_or(pair, |(key, _)| key) {
            "password" => "password=<redacted>",
            _ => pair,
        })
        .collect();
    format!("{}?{}", uri.path(), pairs.join("&"))
}

fn connection_error_to_status(err: ConnectionError) -> StatusCode {
    match err {
        ConnectionError::Directory(e) => directory_error_to_status(e),
        ConnectionError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
        ConnectionError::Router(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, connected: Connected) {
    let Connected { conn_id, mut rx, welcome } = connected;
    let ctx = ConnCtx { conn_id, room_id: welcome.room_id.clone(), user: welcome.user.clone() };

    let hello = Frame::request(MessageType::Connected, welcome.to_data()).with_room_id(&ctx.room_id);
    if send_frame(&mut socket, &hello).await.is_err() {
        connection::teardown(&state, conn_id, TeardownReason::Closed).await;
        return;
    }

    info!(%conn_id, room_id = %ctx.room_id, user = %ctx.user, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(&state, &ctx, text.as_str()).await {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    // Transport-level pings count as liveness too.
                    Message::Ping(_) => {
                        let _ = connection::heartbeat(&state, conn_id).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = rx.recv() => {
                // None: torn down elsewhere (LEAVE or heartbeat reaper).
                let Some(frame) = frame else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    connection::teardown(&state, conn_id, TeardownReason::Closed).await;
    info!(%conn_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Transport concerns stay in `run_ws`, so tests can drive dispatch directly
/// against an `AppState`.
async fn process_inbound_text(state: &AppState, ctx: &ConnCtx, text: &str) -> Vec<Frame> {
    let req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request(MessageType::Error, Data::new())
                .with_room_id(&ctx.room_id)
                .with_data("code", "E_INVALID")
                .with_data("message", format!("invalid frame: {e}"));
            return vec![Frame { status: Status::Error, ..err }];
        }
    };

    if !is_chatty(req.kind) {
        info!(conn_id = %ctx.conn_id, id = %req.id, kind = req.kind.as_str(), "ws: recv frame");
    }

    // Every frame names its room explicitly; heartbeats are connection-scoped.
    if req.kind != MessageType::Heartbeat {
        let claimed = req.room_id.as_deref().map(normalize_room_id);
        if claimed.as_deref() != Some(ctx.room_id.as_str()) {
            return vec![req.error_from(&InboundError::RoomMismatch(ctx.room_id.clone()))];
        }
    }

    let result = match req.kind {
        MessageType::Heartbeat => connection::heartbeat(state, ctx.conn_id)
            .await
            .map(|()| Outcome::Silent)
            .map_err(|e| req.error_from(&e)),
        MessageType::Chat => handle_chat(state, ctx, &req).await,
        MessageType::Typing | MessageType::StoppedTyping => {
            buffer::signal_typing(state, ctx.conn_id, req.kind == MessageType::Typing)
                .await
                .map(|()| Outcome::Silent)
                .map_err(|e| req.error_from(&e))
        }
        MessageType::Update => handle_update(state, ctx, &req).await,
        MessageType::CursorActivity => buffer::cursor_activity(state, ctx.conn_id, Activity::from_data(&req.data))
            .await
            .map(|()| Outcome::Silent)
            .map_err(|e| req.error_from(&e)),
        MessageType::Presence => handle_presence(state, ctx, &req).await,
        MessageType::Run => handle_run(state, ctx, &req).await,
        MessageType::Input => handle_input(state, ctx, &req).await,
        MessageType::Leave => {
            connection::teardown(state, ctx.conn_id, TeardownReason::Left).await;
            Ok(Outcome::Done)
        }
        MessageType::Join => {
            Err(req.error_from(&InboundError::Unsupported("JOIN (room and user are fixed at handshake)")))
        }
        MessageType::Connected
        | MessageType::ActivityEnded
        | MessageType::Output
        | MessageType::Exit
        | MessageType::Error => Err(req.error_from(&InboundError::Unsupported(req.kind.as_str()))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

/// High-rate kinds that are not logged per frame.
fn is_chatty(kind: MessageType) -> bool {
    matches!(
        kind,
        MessageType::Heartbeat | MessageType::Typing | MessageType::StoppedTyping | MessageType::CursorActivity
    )
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn handle_chat(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    let content = req.str_field(FRAME_CONTENT).unwrap_or("");
    chat::send(state, ctx.conn_id, content)
        .await
        .map_err(|e| req.error_from(&e))?;
    Ok(Outcome::Done)
}

async fn handle_update(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    let Some(code) = req.str_field("code") else {
        return Err(req.error_from(&InboundError::Missing("code")));
    };
    let language = req.str_field("language").map(str::to_owned);

    let version = buffer::apply_update(state, ctx.conn_id, code.to_owned(), language)
        .await
        .map_err(|e| req.error_from(&e))?;

    let mut data = Data::new();
    data.insert("version".into(), serde_json::json!(version));
    Ok(Outcome::Reply(data))
}

async fn handle_presence(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    let summary = presence::summarize(state, &ctx.room_id)
        .await
        .map_err(|e| req.error_from(&e))?;
    Ok(Outcome::Reply(to_data(&summary)))
}

/// `RUN {code?, language?, input?}`. Missing code or language fall back to
/// the room's current buffer.
async fn handle_run(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    let snapshot = buffer::snapshot(state, &ctx.room_id)
        .await
        .map_err(|e| req.error_from(&e))?;
    let code = req.str_field("code").map_or(snapshot.code, str::to_owned);
    let language = req
        .str_field("language")
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map_or(snapshot.language, str::to_owned);
    let stdin = req.str_field("input").map(str::to_owned);

    let session_id = execution::run_request(state, ctx.conn_id, ExecRequest { code, language, stdin })
        .await
        .map_err(|e| req.error_from(&e))?;

    let mut data = Data::new();
    data.insert("session_id".into(), serde_json::json!(session_id));
    Ok(Outcome::Reply(data))
}

async fn handle_input(state: &AppState, ctx: &ConnCtx, req: &Frame) -> Result<Outcome, Frame> {
    let Some(line) = req.str_field("input") else {
        return Err(req.error_from(&InboundError::Missing("input")));
    };
    execution::send_input(state, ctx.conn_id, line.to_owned())
        .await
        .map_err(|e| req.error_from(&e))?;
    Ok(Outcome::Done)
}

// =============================================================================
// HELPERS
// =============================================================================

fn to_data(value: &impl Serialize) -> Data {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Data::new(),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.str_field("code").unwrap_or("-");
        let message = frame.str_field("message").unwrap_or("-");
        warn!(id = %frame.id, kind = frame.kind.as_str(), code, message, "ws: send frame status=Error");
    } else if !is_chatty(frame.kind) {
        debug!(id = %frame.id, kind = frame.kind.as_str(), status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
