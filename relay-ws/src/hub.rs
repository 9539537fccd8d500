//! The WebSocket hub (C5): per-tenant connection sets, broadcast, keepalive.

use crate::connection::ConnectionSink;
use crate::message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Server emits a ping after this much silence on a connection (spec §4.5).
const PING_AFTER_SILENCE: Duration = Duration::from_secs(30);
/// How often the per-connection keepalive loop checks for silence.
const KEEPALIVE_TICK: Duration = Duration::from_secs(5);

struct Connection {
    tenant_id: Uuid,
    #[allow(dead_code)]
    user_id: Uuid,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
    sink: Arc<dyn ConnectionSink>,
    last_activity_millis: AtomicI64,
}

impl Connection {
    fn touch(&self) {
        self.last_activity_millis.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        let elapsed_millis = (Utc::now().timestamp_millis() - last).max(0);
        Duration::from_millis(elapsed_millis as u64)
    }
}

/// Reverse mapping of a connection to `(tenant_id, user_id, connected_at)`,
/// returned by [`WebSocketHub::lookup`] for callers that need it without
/// holding their own copy.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebSocketHub {
    connections: Arc<DashMap<Uuid, Connection>>,
}

impl Default for WebSocketHub {
    fn default() -> Self {
        Self { connections: Arc::new(DashMap::new()) }
    }
}

impl WebSocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, sends its welcome message, and starts its
    /// keepalive loop. The loop exits on its own once the connection is
    /// detached (by the caller, by a failed send, or by a failed ping).
    pub async fn attach(&self, conn_id: Uuid, tenant_id: Uuid, user_id: Uuid, sink: Arc<dyn ConnectionSink>) {
        let connected_at = Utc::now();
        self.connections.insert(
            conn_id,
            Connection {
                tenant_id,
                user_id,
                connected_at,
                sink: sink.clone(),
                last_activity_millis: AtomicI64::new(connected_at.timestamp_millis()),
            },
        );

        let _ = sink.send(&message::connection_established(tenant_id, connected_at)).await;

        let hub = self.clone();
        tokio::spawn(async move { hub.keepalive_loop(conn_id).await });
    }

    pub fn detach(&self, conn_id: Uuid) {
        self.connections.remove(&conn_id);
    }

    pub fn lookup(&self, conn_id: Uuid) -> Option<ConnectionInfo> {
        self.connections
            .get(&conn_id)
            .map(|c| ConnectionInfo { tenant_id: c.tenant_id, user_id: c.user_id, connected_at: c.connected_at })
    }

    pub fn is_attached(&self, conn_id: Uuid) -> bool {
        self.connections.contains_key(&conn_id)
    }

    /// Handles one inbound client frame: `ping` is answered with `pong`,
    /// `pong` just resets the silence timer, anything else is echoed back
    /// verbatim (spec §9's WebSocket protocol note).
    pub async fn handle_client_message(&self, conn_id: Uuid, raw: &Value) {
        if let Some(conn) = self.connections.get(&conn_id) {
            conn.touch();
        }
        let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "ping" => self.send_personal(conn_id, &message::pong()).await,
            "pong" => {}
            _ => self.send_personal(conn_id, &message::echo(raw.clone())).await,
        }
    }

    /// Sends directly to one connection; detaches it on send failure.
    pub async fn send_personal(&self, conn_id: Uuid, message: &Value) {
        let Some(sink) = self.connections.get(&conn_id).map(|c| c.sink.clone()) else {
            return;
        };
        if sink.send(message).await.is_err() {
            self.detach(conn_id);
        }
    }

    /// Best-effort parallel send to every connection attached to
    /// `tenant_id`; any connection whose send errors is detached before the
    /// next broadcast (spec §4.5, testable property #9).
    pub async fn broadcast(&self, tenant_id: Uuid, message: Value) {
        let targets: Vec<(Uuid, Arc<dyn ConnectionSink>)> = self
            .connections
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| (*entry.key(), entry.sink.clone()))
            .collect();

        let sends = targets.into_iter().map(|(conn_id, sink)| {
            let message = message.clone();
            async move { (conn_id, sink.send(&message).await) }
        });
        let results = futures_util::future::join_all(sends).await;
        for (conn_id, result) in results {
            if result.is_err() {
                self.detach(conn_id);
            }
        }
    }

    pub async fn broadcast_new_message(&self, tenant_id: Uuid, payload: Map<String, Value>) {
        self.broadcast(tenant_id, message::new_message(tenant_id, payload)).await;
    }

    pub async fn broadcast_chat_update(&self, tenant_id: Uuid, update_type: &str, payload: Map<String, Value>) {
        self.broadcast(tenant_id, message::chat_update(tenant_id, update_type, payload)).await;
    }

    async fn keepalive_loop(&self, conn_id: Uuid) {
        loop {
            tokio::time::sleep(KEEPALIVE_TICK).await;

            let Some(silent_for) = self.connections.get(&conn_id).map(|c| c.silent_for()) else {
                return;
            };
            if silent_for < PING_AFTER_SILENCE {
                continue;
            }

            let Some(sink) = self.connections.get(&conn_id).map(|c| c.sink.clone()) else {
                return;
            };
            if sink.send(&message::ping()).await.is_err() {
                self.detach(conn_id);
                return;
            }
            if let Some(conn) = self.connections.get(&conn_id) {
                conn.touch();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct RecordingSink {
        sent: Mutex<Vec<Value>>,
        fail: bool,
    }

    impl RecordingSink {
        fn ok() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: false })
        }
        fn failing() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: true })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionSink for RecordingSink {
        async fn send(&self, message: &Value) -> Result<(), crate::connection::SendError> {
            if self.fail {
                return Err(crate::connection::SendError("boom".into()));
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn attach_sends_welcome_message() {
        let hub = WebSocketHub::new();
        let sink = RecordingSink::ok();
        hub.attach(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), sink.clone()).await;
        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "connection_established");
    }

    #[tokio::test]
    async fn broadcast_reaches_only_same_tenant() {
        let hub = WebSocketHub::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let sink_a = RecordingSink::ok();
        let sink_b = RecordingSink::ok();
        hub.attach(Uuid::new_v4(), tenant_a, Uuid::new_v4(), sink_a.clone()).await;
        hub.attach(Uuid::new_v4(), tenant_b, Uuid::new_v4(), sink_b.clone()).await;

        hub.broadcast_new_message(tenant_a, Map::new()).await;

        assert_eq!(sink_a.sent.lock().await.len(), 2); // welcome + broadcast
        assert_eq!(sink_b.sent.lock().await.len(), 1); // welcome only
    }

    #[tokio::test]
    async fn broadcast_detaches_failing_connection() {
        let hub = WebSocketHub::new();
        let tenant_id = Uuid::new_v4();
        let conn_id = Uuid::new_v4();
        hub.attach(conn_id, tenant_id, Uuid::new_v4(), RecordingSink::failing()).await;
        assert!(hub.is_attached(conn_id));

        hub.broadcast(tenant_id, serde_json::json!({"type": "new_message"})).await;

        assert!(!hub.is_attached(conn_id));
    }

    #[tokio::test]
    async fn send_personal_detaches_on_failure() {
        let hub = WebSocketHub::new();
        let conn_id = Uuid::new_v4();
        hub.attach(conn_id, Uuid::new_v4(), Uuid::new_v4(), RecordingSink::failing()).await;

        hub.send_personal(conn_id, &serde_json::json!({"type": "ping"})).await;

        assert!(!hub.is_attached(conn_id));
    }

    #[tokio::test]
    async fn client_ping_is_answered_with_pong() {
        let hub = WebSocketHub::new();
        let conn_id = Uuid::new_v4();
        let sink = RecordingSink::ok();
        hub.attach(conn_id, Uuid::new_v4(), Uuid::new_v4(), sink.clone()).await;

        hub.handle_client_message(conn_id, &serde_json::json!({"type": "ping"})).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.last().unwrap()["type"], "pong");
    }

    #[tokio::test]
    async fn unknown_client_message_is_echoed() {
        let hub = WebSocketHub::new();
        let conn_id = Uuid::new_v4();
        let sink = RecordingSink::ok();
        hub.attach(conn_id, Uuid::new_v4(), Uuid::new_v4(), sink.clone()).await;

        hub.handle_client_message(conn_id, &serde_json::json!({"type": "subscribe", "topic": "x"})).await;

        let sent = sink.sent.lock().await;
        assert_eq!(sent.last().unwrap()["type"], "echo");
        assert_eq!(sent.last().unwrap()["payload"]["topic"], "x");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_after_30s_of_silence() {
        let hub = WebSocketHub::new();
        let conn_id = Uuid::new_v4();
        let sink = RecordingSink::ok();
        hub.attach(conn_id, Uuid::new_v4(), Uuid::new_v4(), sink.clone()).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        let sent = sink.sent.lock().await;
        assert!(sent.iter().any(|m| m["type"] == "ping"));
    }
}
