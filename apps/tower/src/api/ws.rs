//! WebSocket endpoint for station events.
//!
//! Server-push only: each message is one complete stamped event as JSON.
//! On connect the hub's recent history is replayed (bounded), then live
//! events follow. Incoming client messages are read only to notice the
//! close handshake.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast;

use crate::api::events::WS_REPLAY_EVENTS;
use crate::api::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before replay so no event falls between the two.
    let mut live = state.events.subscribe();

    for stamped in state.events.recent(WS_REPLAY_EVENTS) {
        if send_event(&mut socket, &stamped).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = live.recv() => match event {
                Ok(stamped) => {
                    if send_event(&mut socket, &stamped).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[EventsWs] Subscriber lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Anything else from the client is ignored; this channel
                // is one-way.
                Some(Ok(_)) => {}
            },
            _ = state.shutdown.cancelled() => break,
        }
    }
}

async fn send_event(
    socket: &mut WebSocket,
    stamped: &crate::api::events::StampedEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(stamped) {
        Ok(text) => text,
        Err(e) => {
            log::error!("[EventsWs] Serialization failed: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}
