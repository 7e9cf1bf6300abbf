//! WebSocket handler: group chat relay.
//!
//! DESIGN
//! ======
//! The upgrade is only accepted once the ticket resolves to an identity and
//! the broker authorizes that identity for the group in the path. After the
//! upgrade the connection attaches and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch through the broker
//! - Events from the connection's outbox → forward to the socket
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → attach (`Unattached → Attached`)
//! 2. Text frames → `broker.dispatch`; failures go back to the sender only
//! 3. Pings go out every `ping_interval`; a session silent for `idle_timeout`
//!    (no frame, no pong) is dropped
//! 4. Close frame, socket error, send timeout, idle timeout, or outbox
//!    closure ends the loop
//! 5. Every exit path runs `broker.detach` (`→ Closed`)

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::event::{ErrorCode, GroupId, Identity, Outbound};
use crate::services::broker::{AttachPermit, ChatError, Connection};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

/// `GET /ws/group/{group_id}/?ticket=...`
pub async fn handle_group_ws(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let identity = match state.sessions.consume_ticket(ticket).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    let permit = match state.broker.authorize(group_id, &identity).await {
        Ok(permit) => permit,
        Err(e) => {
            warn!(
                group_id,
                user = %identity.username,
                code = e.error_code(),
                retryable = e.retryable(),
                error = %e,
                "ws: attach refused"
            );
            return (rejection_status(&e), Json(Outbound::error_from(&e))).into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity, permit))
}

/// HTTP status for an attach that is refused before the upgrade.
pub(crate) fn rejection_status(err: &ChatError) -> StatusCode {
    match err {
        ChatError::UnknownGroup(_) => StatusCode::NOT_FOUND,
        ChatError::NotMember { .. } => StatusCode::FORBIDDEN,
        ChatError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        ChatError::InvalidTransition(_) | ChatError::NotAttached => StatusCode::CONFLICT,
        ChatError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::Directory(_) | ChatError::RegistryInvariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity, permit: AttachPermit) {
    let group_id = permit.group_id();
    let mut conn = Connection::new(identity);

    // Per-connection outbox; the broker holds the only sender.
    let (outbox, mut inbox) = mpsc::channel::<Outbound>(state.chat.outbox_capacity);

    if let Err(e) = state.broker.attach(&mut conn, permit, outbox).await {
        warn!(connection_id = %conn.id(), group_id, error = %e, "ws: attach failed");
        if let Err(send_err) = send_event(&mut socket, &state, &Outbound::error_from(&e)).await {
            debug!(connection_id = %conn.id(), error = %send_err, "ws: attach error not delivered");
        }
        state.broker.detach(&mut conn).await;
        return;
    }

    info!(connection_id = %conn.id(), group_id, user = %conn.identity().username, "ws: client connected");

    // Heartbeat: a half-open peer never completes `recv`, so liveness is
    // judged by the time since the last inbound frame.
    let mut heartbeat = tokio::time::interval(state.chat.ping_interval.max(Duration::from_millis(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    'session: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        let err = ChatError::Connection(e.to_string());
                        warn!(connection_id = %conn.id(), error = %err, "ws: receive failed");
                        break;
                    }
                };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => {
                        for reply in process_inbound_text(&state, &conn, text.as_str()).await {
                            if let Err(e) = send_event(&mut socket, &state, &reply).await {
                                warn!(connection_id = %conn.id(), error = %e, "ws: reply failed");
                                break 'session;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = inbox.recv() => {
                // Outbox closed: evicted as a slow/broken recipient, or broker shutdown.
                let Some(event) = event else {
                    info!(connection_id = %conn.id(), group_id, "ws: outbox closed");
                    if let Err(e) = send_frame(&mut socket, &state, Message::Close(None)).await {
                        debug!(connection_id = %conn.id(), error = %e, "ws: close frame not delivered");
                    }
                    break;
                };
                if let Err(e) = send_event(&mut socket, &state, &event).await {
                    warn!(connection_id = %conn.id(), error = %e, "ws: send failed");
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let idle = last_seen.elapsed();
                if idle >= state.chat.idle_timeout {
                    info!(connection_id = %conn.id(), group_id, idle_ms = %idle.as_millis(), "ws: idle timeout");
                    break;
                }
                if let Err(e) = send_frame(&mut socket, &state, Message::Ping(Bytes::new())).await {
                    warn!(connection_id = %conn.id(), error = %e, "ws: ping failed");
                    break;
                }
            }
        }
    }

    state.broker.detach(&mut conn).await;
    info!(connection_id = %conn.id(), group_id, state = %conn.state(), "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Process one inbound text frame and return events for the sender only.
///
/// Keeps socket concerns out of frame handling so tests can exercise
/// dispatch end-to-end without a live socket.
async fn process_inbound_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Outbound> {
    match state.broker.dispatch(conn, text).await {
        Ok(report) => {
            debug!(
                connection_id = %conn.id(),
                group_id = ?conn.group_id(),
                delivered = report.delivered,
                evicted = report.evicted,
                "ws: recv message"
            );
            Vec::new()
        }
        Err(e) => {
            warn!(connection_id = %conn.id(), code = e.error_code(), error = %e, "ws: rejected inbound frame");
            vec![Outbound::error_from(&e)]
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Serialize and write one event.
async fn send_event(socket: &mut WebSocket, state: &AppState, event: &Outbound) -> Result<(), ChatError> {
    let json = serde_json::to_string(event).map_err(|e| ChatError::Connection(format!("serialize: {e}")))?;
    send_frame(socket, state, Message::Text(json.into())).await
}

/// Write one frame, bounded by the configured send timeout.
async fn send_frame(socket: &mut WebSocket, state: &AppState, frame: Message) -> Result<(), ChatError> {
    match tokio::time::timeout(state.chat.send_timeout, socket.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ChatError::Connection(e.to_string())),
        Err(_) => Err(ChatError::Connection(format!(
            "send timed out after {}ms",
            state.chat.send_timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
