//! WebSocket handler: the room gateway's transport boundary.
//!
//! DESIGN
//! ======
//! On upgrade the ticket is consumed, the connection is registered in the
//! directory (displacing any older connection of the same user), and the
//! socket enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Room events from the coordinator → forward to client
//! - Displacement by a newer connection → `session:replaced`, then close
//!
//! Handlers translate a request into one coordinator call and return an
//! `Outcome`. Everything the room broadcasts arrives through the client
//! channel, never through the handler's return value.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. `room:join` → resolve the new room, leave the previous one, join
//! 3. Close or displacement → leave the current room, unregister

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::services::coordinator::RoomHandle;
use crate::services::room::RoomError;
use crate::services::session::Identity;
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// What the acting connection gets back. Room-wide effects travel through
/// the coordinator instead.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
}

/// Per-connection gateway state.
struct ConnectionSession {
    client_id: Uuid,
    identity: Identity,
    /// The one room this connection is in, if any.
    current_room: Option<RoomHandle>,
}

impl ConnectionSession {
    fn new(client_id: Uuid, identity: Identity) -> Self {
        Self { client_id, identity, current_room: None }
    }

    fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    fn current_room_id(&self) -> Option<Uuid> {
        self.current_room.as_ref().map(RoomHandle::room_id)
    }

    /// Leave the current room, if any. A coordinator that is already gone
    /// has nothing to leave.
    async fn leave_current(&mut self) {
        let Some(room) = self.current_room.take() else {
            return;
        };
        if let Err(e) = room.leave(self.user_id(), self.client_id).await {
            debug!(client_id = %self.client_id, room_id = %room.room_id(), error = %e, "ws: leave on stopped room");
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let identity = match state.identity.authenticate(ticket).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let client_id = Uuid::new_v4();
    let user_id = identity.user_id;

    // Room events for this connection.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    let mut kicked = state.directory.register(user_id, client_id).await;

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user_id.to_string())
        .with_data("username", identity.username.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        state.directory.unregister(user_id, client_id).await;
        return;
    }

    let connections = state.directory.connection_count().await;
    info!(%client_id, %user_id, connections, "ws: client connected");
    let mut session = ConnectionSession::new(client_id, identity);

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(&state, &mut session, &client_tx, &text).await {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                observe_room_event(&mut session, &frame);
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            result = &mut kicked => {
                if result.is_ok() {
                    let replaced = Frame::request("session:replaced", Data::new())
                        .with_data("message", "signed in from another connection");
                    let _ = send_frame(&mut socket, &replaced).await;
                    let _ = socket.send(Message::Close(None)).await;
                    info!(%client_id, %user_id, "ws: connection replaced");
                }
                break;
            }
        }
    }

    session.leave_current().await;
    state.directory.unregister(user_id, client_id).await;
    let connections = state.directory.connection_count().await;
    info!(%client_id, %user_id, connections, "ws: client disconnected");
}

/// Forget the current room once its coordinator announces closure.
fn observe_room_event(session: &mut ConnectionSession, frame: &Frame) {
    if frame.syscall == "room:closed" && frame.room_id.is_some() && frame.room_id == session.current_room_id() {
        session.current_room = None;
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
async fn process_inbound_text(
    state: &AppState,
    session: &mut ConnectionSession,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %session.client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated user_id as `from`.
    req.from = Some(session.user_id().to_string());
    info!(client_id = %session.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    if req.status != Status::Request {
        return vec![req.error(format!("expected a request frame, got {:?}", req.status))];
    }

    let result = match req.prefix() {
        "room" => handle_room(state, session, client_tx, &req).await,
        "queue" => handle_queue(session, &req).await,
        "deck" => handle_deck(session, &req).await,
        prefix => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Err(err_frame) => vec![err_frame],
    }
}

/// Turn a coordinator error into an error reply. A stopped coordinator also
/// drops the connection's room so the client can join again.
fn room_failure(session: &mut ConnectionSession, req: &Frame, err: &RoomError) -> Frame {
    if matches!(err, RoomError::RoomClosed(_)) {
        session.current_room = None;
    }
    req.error_from(err)
}

fn require_room<'a>(session: &'a ConnectionSession, req: &Frame) -> Result<&'a RoomHandle, Frame> {
    session
        .current_room
        .as_ref()
        .ok_or_else(|| req.error_from(&RoomError::NotMember(session.user_id())))
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    session: &mut ConnectionSession,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(room_id) = req.room_id.or_else(|| req.data_uuid("room_id")) else {
                return Err(req.error_from(&RoomError::Validation("room_id required".into())));
            };

            // Resolve first: an unknown room leaves the current membership intact.
            let handle = state.rooms.resolve(room_id).await.map_err(|e| req.error_from(&e))?;

            // One room per connection.
            if session.current_room_id().is_some_and(|id| id != room_id) {
                session.leave_current().await;
            }

            if let Err(e) = handle.join(session.identity.clone(), session.client_id, client_tx.clone()).await {
                return Err(room_failure(session, req, &e));
            }
            session.current_room = Some(handle);

            let mut data = Data::new();
            data.insert("room_id".into(), serde_json::json!(room_id));
            Ok(Outcome::Reply(data))
        }
        "leave" => {
            require_room(session, req)?;
            session.leave_current().await;
            Ok(Outcome::Done)
        }
        "close" => {
            let Some(room_id) = req.room_id.or_else(|| req.data_uuid("room_id")).or_else(|| session.current_room_id())
            else {
                return Err(req.error_from(&RoomError::Validation("room_id required".into())));
            };
            close_room(state, session, req, room_id).await
        }
        op => Err(req.error(format!("unknown room op: {op}"))),
    }
}

/// Owner-only: delete the room from storage, then tear down its coordinator.
async fn close_room(
    state: &AppState,
    session: &mut ConnectionSession,
    req: &Frame,
    room_id: Uuid,
) -> Result<Outcome, Frame> {
    let record = match state.store.load_room(room_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(req.error_from(&RoomError::RoomNotFound(room_id))),
        Err(e) => return Err(req.error_from(&RoomError::Unavailable(e.to_string()))),
    };
    if record.owner_id != session.user_id() {
        return Err(req.error_from(&RoomError::Forbidden));
    }

    if let Err(e) = state.store.delete_room(room_id).await {
        return Err(req.error_from(&RoomError::Unavailable(e.to_string())));
    }
    let was_live = state.rooms.close(room_id).await;
    if session.current_room_id() == Some(room_id) {
        session.current_room = None;
    }
    info!(%room_id, user_id = %session.user_id(), was_live, "room deleted by owner");
    Ok(Outcome::Done)
}

// =============================================================================
// QUEUE / DECK HANDLERS
// =============================================================================

async fn handle_queue(session: &mut ConnectionSession, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(playlist_id) = req.data_uuid("playlist_id") else {
                return Err(req.error_from(&RoomError::Validation("playlist_id required".into())));
            };
            let room = require_room(session, req)?.clone();
            match room.request_join_queue(session.user_id(), playlist_id).await {
                Ok(()) => Ok(Outcome::Done),
                Err(e) => Err(room_failure(session, req, &e)),
            }
        }
        op => Err(req.error(format!("unknown queue op: {op}"))),
    }
}

async fn handle_deck(session: &mut ConnectionSession, req: &Frame) -> Result<Outcome, Frame> {
    let room = require_room(session, req)?.clone();
    let user_id = session.user_id();
    let result = match req.op() {
        "finished" => {
            let deck_seq = req.data.get("deck_seq").and_then(serde_json::Value::as_u64);
            room.song_finished(user_id, deck_seq).await
        }
        "skip" => room.request_skip(user_id).await,
        op => return Err(req.error(format!("unknown deck op: {op}"))),
    };
    match result {
        Ok(()) => Ok(Outcome::Done),
        Err(e) => Err(room_failure(session, req, &e)),
    }
}

// =============================================================================
// TRANSPORT
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
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
