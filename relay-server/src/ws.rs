//! The axum half of the WebSocket hub (C5): upgrades an HTTP connection,
//! relays hub broadcasts to the socket, and forwards client frames back
//! into [`relay_ws::WebSocketHub::handle_client_message`].
//!
//! `relay-ws` only knows [`ConnectionSink`]; this module is the transport
//! that actually owns an `axum::extract::ws::WebSocket`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use relay_ws::{ConnectionSink, SendError};

use crate::state::AppState;

/// Forwards hub sends onto an unbounded channel a dedicated task drains
/// into the socket's write half. `WebSocketHub` holds this behind
/// `Arc<dyn ConnectionSink>` and calls `send` from arbitrary broadcast
/// tasks, so the actual `SplitSink` (which needs `&mut self`) can't be
/// shared directly.
struct AxumSink {
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl ConnectionSink for AxumSink {
    async fn send(&self, message: &Value) -> Result<(), SendError> {
        self.tx.send(message.clone()).map_err(|e| SendError(e.to_string()))
    }
}

pub async fn ws_handler(
    Path((tenant_id, user_id)): Path<(Uuid, Uuid)>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tenant_id, user_id, state))
}

async fn handle_socket(socket: WebSocket, tenant_id: Uuid, user_id: Uuid, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&value) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let conn_id = Uuid::new_v4();
    let conn_sink: Arc<dyn ConnectionSink> = Arc::new(AxumSink { tx });
    state.ws_hub.attach(conn_id, tenant_id, user_id, conn_sink).await;

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    state.ws_hub.handle_client_message(conn_id, &value).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.ws_hub.detach(conn_id);
    writer.abort();
}
