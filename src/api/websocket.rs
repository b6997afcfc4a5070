use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::GameEvent;
use crate::game::controller::GameSnapshot;
use crate::state::ServiceContext;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServiceContext>,
) -> impl IntoResponse {
    let event_rx = ctx.event_tx.subscribe();
    let snapshot = ctx.snapshot_rx.borrow().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, snapshot, event_rx))
}

/// First frame a client sees: the current board, so late joiners of the
/// stream do not start blank.
fn snapshot_frame(snapshot: &GameSnapshot) -> serde_json::Result<String> {
    serde_json::to_string(&serde_json::json!({ "type": "Snapshot", "data": snapshot }))
}

async fn handle_socket(
    mut socket: WebSocket,
    snapshot: GameSnapshot,
    mut event_rx: broadcast::Receiver<GameEvent>,
) {
    debug!("WebSocket client connected");

    match snapshot_frame(&snapshot) {
        Ok(json) => {
            if socket.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("Failed to serialize snapshot: {}", e),
    }

    loop {
        tokio::select! {
            // Forward GameEvents to the WebSocket client as JSON
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Failed to serialize event: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_json() {
        let frame = snapshot_frame(&GameSnapshot::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "Snapshot");
        assert_eq!(value["data"]["view"]["role"], "IDLE");

        let event = serde_json::to_value(GameEvent::ParticipantEliminated { id: "c".into() }).unwrap();
        assert_eq!(event["type"], "ParticipantEliminated");
        assert_eq!(event["data"]["id"], "c");
    }
}
