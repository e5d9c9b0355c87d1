//! Session event stream over WebSocket.
//!
//! `/ws/sessions/{session_id}/events`: on connect the client receives a
//! `snapshot` of buffered events, then `ready`, then one `event` message per
//! live event for that session.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::hub::{EventHub, HubMessage};

/// Build the Axum router for `/ws/sessions/{session_id}/events`.
pub fn event_routes(hub: Arc<EventHub>) -> Router {
    Router::new()
        .route("/ws/sessions/{session_id}/events", get(ws_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(hub): State<Arc<EventHub>>,
) -> impl IntoResponse {
    info!(session_id = %session_id, "Session viewer connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, hub))
}

async fn send(socket: &mut WebSocket, msg: &HubMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize hub message");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, session_id: String, hub: Arc<EventHub>) {
    // Subscribe before pulling the snapshot so nothing falls in between.
    let mut rx = hub.subscribe();
    let events = hub.snapshot(&session_id).await;
    let mut delivered: HashSet<String> = events.iter().map(|e| e.event_id.clone()).collect();

    let snapshot = HubMessage::Snapshot {
        session_id: session_id.clone(),
        events,
    };
    let ready = HubMessage::Ready {
        session_id: session_id.clone(),
    };
    if !send(&mut socket, &snapshot).await || !send(&mut socket, &ready).await {
        debug!(session_id = %session_id, "Viewer left during snapshot");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.session_id() != session_id {
                            continue;
                        }
                        // Already sent as part of the snapshot.
                        if !delivered.is_empty() && delivered.remove(&event.event_id) {
                            continue;
                        }
                        if !send(&mut socket, &HubMessage::Event { event }).await {
                            debug!("Viewer disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, session_id = %session_id, "Session viewer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event hub closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "Session viewer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Session viewer socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(session_id = %session_id, "Session viewer connection closed");
}
