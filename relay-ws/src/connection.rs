//! The transport-agnostic seam between the hub and an actual socket.
//!
//! `relay-ws` owns connection bookkeeping and fan-out only; the thing that
//! actually owns a `axum::extract::ws::WebSocket` half lives in the server
//! binary and is handed to the hub as a [`ConnectionSink`].

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("connection send failed: {0}")]
pub struct SendError(pub String);

#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, message: &Value) -> Result<(), SendError>;
}
