//! WebSocket handler — canvas requests in, acks and update batches out.
//!
//! DESIGN
//! ======
//! On upgrade, the session is registered as a viewer and enters a `select!`
//! loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Update batches from the broadcaster → forward to client
//!
//! Every request frame gets exactly one terminal reply (`done` or `error`).
//! Canvas handlers never write to the socket themselves; update pushes reach
//! the client through the session channel that the broadcaster flushes into.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → resolve or create the user → send `session:connected`
//! 2. `canvas:window` → replace window, queue current tile state → `done`
//! 3. `canvas:action` → apply/undo/redo → `done {action_id}` or `error`
//! 4. Close → clear window and pending batch → drop session

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{Data, Frame, Status};
use crate::model::{Action, UserId, ViewerId};
use crate::services::viewport::{self, WindowRequest};
use crate::services::history;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

/// `GET /api/ws?user=<uuid>` — an unknown or missing user gets a fresh one.
pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let requested = params.get("user").and_then(|s| s.parse().ok()).map(UserId);
    ws.on_upgrade(move |socket| run_ws(socket, state, requested))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, requested: Option<UserId>) {
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.session_queue_capacity);

    let (viewer_id, user_id) = match viewport::connect(&state, requested, client_tx).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "ws: session setup failed");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", e.to_string());
            let _ = send_frame(&mut socket, &err).await;
            return;
        }
    };

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("viewer_id", viewer_id.to_string())
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_ok() {
        loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => {
                            for frame in process_inbound_text(&state, viewer_id, user_id, &text).await {
                                let _ = send_frame(&mut socket, &frame).await;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                Some(frame) = client_rx.recv() => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    viewport::disconnect(&state, viewer_id).await;
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
async fn process_inbound_text(state: &AppState, viewer_id: ViewerId, user_id: UserId, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%viewer_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };
    req.from = Some(user_id.to_string());
    debug!(%viewer_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let reply = match req.prefix() {
        "canvas" => handle_canvas(state, viewer_id, user_id, &req).await,
        prefix => req.error(format!("unknown prefix: {prefix}")),
    };
    vec![reply]
}

async fn handle_canvas(state: &AppState, viewer_id: ViewerId, user_id: UserId, req: &Frame) -> Frame {
    match req.op() {
        "window" => {
            let request: WindowRequest = match serde_json::from_value(serde_json::Value::Object(
                req.data.clone().into_iter().collect(),
            )) {
                Ok(r) => r,
                Err(e) => return req.error(format!("invalid window: {e}")),
            };
            match viewport::set_window(state, viewer_id, request).await {
                Ok(()) => req.done_with(Data::new()),
                Err(e) => req.error_from(&e),
            }
        }
        "action" => {
            let Some(value) = req.data.get("action") else {
                return req.error("action required");
            };
            let action: Action = match serde_json::from_value(value.clone()) {
                Ok(a) => a,
                Err(e) => return req.error(format!("invalid action: {e}")),
            };
            match history::send_action(state, user_id, action).await {
                Ok(action_id) => req.done_with(Data::new()).with_data("action_id", action_id.0),
                Err(e) => req.error_from(&e),
            }
        }
        op => req.error(format!("unknown canvas op: {op}")),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        info!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
