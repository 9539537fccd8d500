//! Server→client JSON message constructors (spec §4.5/§9).
//!
//! Every constructor is a thin wrapper that stamps `type` (and, for
//! broadcasts, `timestamp`) onto a payload — no other shaping happens here.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub fn connection_established(tenant_id: Uuid, connected_at: DateTime<Utc>) -> Value {
    serde_json::json!({
        "type": "connection_established",
        "tenant_id": tenant_id,
        "connected_at": connected_at,
    })
}

pub fn ping() -> Value {
    serde_json::json!({ "type": "ping", "timestamp": Utc::now() })
}

pub fn pong() -> Value {
    serde_json::json!({ "type": "pong", "timestamp": Utc::now() })
}

pub fn echo(payload: Value) -> Value {
    serde_json::json!({ "type": "echo", "payload": payload })
}

pub fn new_message(tenant_id: Uuid, mut payload: Map<String, Value>) -> Value {
    payload.insert("type".into(), Value::String("new_message".into()));
    payload.insert("tenant_id".into(), Value::String(tenant_id.to_string()));
    payload.insert("timestamp".into(), serde_json::to_value(Utc::now()).expect("timestamp serializes"));
    Value::Object(payload)
}

pub fn chat_update(tenant_id: Uuid, update_type: &str, mut payload: Map<String, Value>) -> Value {
    payload.insert("type".into(), Value::String("chat_update".into()));
    payload.insert("update_type".into(), Value::String(update_type.to_string()));
    payload.insert("tenant_id".into(), Value::String(tenant_id.to_string()));
    payload.insert("timestamp".into(), serde_json::to_value(Utc::now()).expect("timestamp serializes"));
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_stamps_type_and_tenant() {
        let mut payload = Map::new();
        payload.insert("content".into(), Value::String("hi".into()));
        let tenant_id = Uuid::new_v4();
        let msg = new_message(tenant_id, payload);
        assert_eq!(msg["type"], "new_message");
        assert_eq!(msg["tenant_id"], tenant_id.to_string());
        assert_eq!(msg["content"], "hi");
    }

    #[test]
    fn chat_update_stamps_update_type() {
        let msg = chat_update(Uuid::new_v4(), "status_changed", Map::new());
        assert_eq!(msg["type"], "chat_update");
        assert_eq!(msg["update_type"], "status_changed");
    }
}
