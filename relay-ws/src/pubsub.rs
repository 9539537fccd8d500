//! Redis pub/sub bridge (spec §4.5): forwards notifications published by
//! out-of-process workers (the debounce orchestrator, §4.7) on
//! `ws_org_{tenant_id}` channels into this process's hub.

use crate::hub::WebSocketHub;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

const CHANNEL_PATTERN: &str = "ws_org_*";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Runs forever, reconnecting on any Redis error. Intended to be
/// `tokio::spawn`ed once per process by the server binary.
pub async fn run(redis_url: &str, hub: WebSocketHub) {
    let client = match redis::Client::open(redis_url) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "invalid redis url for websocket pub/sub bridge");
            return;
        }
    };

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "websocket pub/sub connection failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = pubsub.psubscribe(CHANNEL_PATTERN).await {
            tracing::warn!(error = %e, "failed to subscribe to websocket pub/sub pattern");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        tracing::info!(pattern = CHANNEL_PATTERN, "websocket pub/sub bridge subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel: String = match msg.get_channel() {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Some(tenant_id) = parse_tenant_id(&channel) else {
                tracing::warn!(channel = %channel, "websocket pub/sub channel has no parseable tenant id");
                continue;
            };
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            let value: Value = match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket pub/sub payload was not valid json");
                    continue;
                }
            };
            hub.broadcast(tenant_id, value).await;
        }

        tracing::warn!("websocket pub/sub stream ended, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn parse_tenant_id(channel: &str) -> Option<Uuid> {
    channel.strip_prefix("ws_org_").and_then(|s| Uuid::parse_str(s).ok())
}
