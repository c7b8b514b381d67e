//! WebSocket handler for live events

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use thermowire_core::{DeviceRecord, EngineEvent, LifecycleEvent, ValueEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    /// Full device list, sent once on connect
    #[serde(rename = "snapshot")]
    Snapshot(Vec<DeviceRecord>),
    #[serde(rename = "lifecycle")]
    Lifecycle(LifecycleEvent),
    #[serde(rename = "value")]
    Value(ValueEvent),
    #[serde(rename = "pong")]
    Pong,
}

impl From<EngineEvent> for WsMessage {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::Lifecycle(event) => Self::Lifecycle(event),
            EngineEvent::Value(event) => Self::Value(event),
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.manager.events();

    info!("WebSocket client connected");

    match state.manager.list_devices().await {
        Ok(devices) => {
            if let Ok(json) = serde_json::to_string(&WsMessage::Snapshot(devices)) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to read device list"),
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&WsMessage::from(event)) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event stream closed");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            if let Ok(pong) = serde_json::to_string(&WsMessage::Pong) {
                                if sender.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use thermowire_core::Address;

    #[test]
    fn test_value_message_shape() {
        let msg = WsMessage::from(EngineEvent::Value(ValueEvent {
            name: "boiler".to_string(),
            address: Address::new([0x28, 0, 0, 0, 0, 0, 0, 0x01]),
            value: 21.5,
        }));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "value");
        assert_eq!(json["data"]["name"], "boiler");
        assert_eq!(json["data"]["value"], 21.5);
    }
}
