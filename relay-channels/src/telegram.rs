//! Telegram outbound sender (spec §4.4): POSTs to the userbot worker's
//! webhook-send endpoint, keyed by `X-Service-Key` rather than the Bot API
//! token — the same per-agent worker process owns the Telegram session.

use crate::message::{DeliveryResult, OutgoingMedia};
use crate::traits::ChannelSender;
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

pub struct TelegramSender {
    client: reqwest::Client,
}

impl Default for TelegramSender {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl TelegramSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    async fn send(
        &self,
        agent_id: Uuid,
        integration_config: &Map<String, Value>,
        recipient: &str,
        content: &str,
        media: Option<&OutgoingMedia>,
        _mention_tag: Option<&str>,
    ) -> DeliveryResult {
        let Some(base) = integration_config.get("base_url").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing telegram integration base_url");
        };
        let Some(service_key) = integration_config.get("service_key").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing telegram integration service_key");
        };

        let mut body = serde_json::json!({
            "agent_id": agent_id,
            "chat_id": recipient,
            "text": content,
        });
        if let Some(media) = media {
            body["media_url"] = Value::String(media.url.clone());
        }

        let url = format!("{}/api/webhook/send", base.trim_end_matches('/'));
        let resp = self.client.post(&url).header("X-Service-Key", service_key).json(&body).send().await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("message_id").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                DeliveryResult::ok(message_id)
            }
            Ok(resp) => DeliveryResult::failure(format!("telegram userbot returned {}", resp.status())),
            Err(e) => DeliveryResult::failure(format!("telegram userbot request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_service_key_fails_without_network_call() {
        let sender = TelegramSender::new();
        let mut cfg = Map::new();
        cfg.insert("base_url".into(), Value::String("http://localhost".into()));
        let result = sender.send(Uuid::new_v4(), &cfg, "123", "hi", None, None).await;
        assert!(!result.success);
        assert!(result.reason.unwrap().contains("service_key"));
    }
}
