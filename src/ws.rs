//! WebSocket subscribers
//!
//! Each client gets its own hub subscription with a bounded buffer plus a
//! direct reply lane for protocol errors. Inbound control actions steer the
//! replay controller and the min-size filter; a broken client only ever
//! takes down its own task.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::ReplayCommand;
use crate::types::{AppState, ClientMessage, WsMessage};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = state.hub.subscribe();
    let subscriber_id = sub.id();

    // Direct lane for replies that must not fan out to everyone
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsMessage>(16);

    // Greet the new client with the current session shape
    let symbols: Vec<String> = state.active_symbols.read().await.iter().cloned().collect();
    let welcome = WsMessage::Connected {
        symbols,
        mode: state.mode,
    };
    if let Ok(json) = serde_json::to_string(&welcome) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    info!("WebSocket client {} connected", subscriber_id);

    // Forward broadcast + direct messages to this client
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                reply = reply_rx.recv() => reply,
                broadcast = sub.recv() => broadcast,
            };
            let Some(msg) = msg else { break };
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        sub.dropped()
    });

    // Handle control messages from the client
    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    if let Some(error) = apply_action(&recv_state, &client_msg).await {
                        let _ = reply_tx.send(WsMessage::Error { message: error }).await;
                    }
                }
                Err(_) => {
                    let _ = reply_tx
                        .send(WsMessage::Error {
                            message: "Invalid message: expected {\"action\": ...}".to_string(),
                        })
                        .await;
                }
            }
        }
    });

    tokio::select! {
        dropped = send_task => {
            if let Ok(dropped) = dropped {
                if dropped > 0 {
                    warn!(
                        "WebSocket client {} fell behind, {} messages dropped",
                        subscriber_id, dropped
                    );
                }
            }
        }
        _ = recv_task => {}
    }

    info!("WebSocket client {} disconnected", subscriber_id);
}

/// Apply one inbound action; returns an error string for the client when
/// the action is unknown or malformed. The connection stays open either way.
async fn apply_action(state: &Arc<AppState>, msg: &ClientMessage) -> Option<String> {
    match msg.action.as_str() {
        "set_min_size" => match msg.min_size {
            Some(size) => {
                *state.min_size.write().await = size;
                info!("Min size filter set to: {}", size);
                None
            }
            None => Some("set_min_size requires min_size".to_string()),
        },
        "replay_pause" => send_replay(state, ReplayCommand::Pause).await,
        "replay_resume" => send_replay(state, ReplayCommand::Resume).await,
        "set_replay_speed" => match msg.speed {
            Some(speed) if speed.is_finite() && speed > 0.0 => {
                send_replay(state, ReplayCommand::SetSpeed(speed)).await
            }
            _ => Some("set_replay_speed requires a positive speed".to_string()),
        },
        other => {
            debug!("Unknown client action: {}", other);
            Some(format!("Unknown action: {}", other))
        }
    }
}

async fn send_replay(state: &Arc<AppState>, cmd: ReplayCommand) -> Option<String> {
    match &state.replay_cmd {
        Some(tx) => {
            let _ = tx.send(cmd).await;
            None
        }
        None => Some("Replay controls are only available in replay mode".to_string()),
    }
}
