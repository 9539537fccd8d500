//! WhatsApp outbound sender (spec §4.4).
//!
//! Talks to a WhatsApp userbot worker (e.g. a whatsapp-web.js gateway) over
//! its `client/sendMessage` HTTP API, keyed by `agent_id` and an
//! `x-api-key` header rather than Meta's Cloud API — this system routes
//! outbound through the same per-agent worker process that owns the
//! session, not a managed API.

use crate::message::{DeliveryResult, OutgoingMedia};
use crate::traits::ChannelSender;
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

pub struct WhatsAppSender {
    client: reqwest::Client,
}

impl Default for WhatsAppSender {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl WhatsAppSender {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Normalizes to digits-only unless the id already carries a WhatsApp
/// suffix (`@lid`, `@g.us`, `@c.us`), which is preserved verbatim.
pub fn normalize_chat_id(recipient: &str) -> String {
    if recipient.contains('@') {
        return recipient.to_string();
    }
    let digits: String = recipient.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@c.us")
}

#[async_trait]
impl ChannelSender for WhatsAppSender {
    async fn send(
        &self,
        agent_id: Uuid,
        integration_config: &Map<String, Value>,
        recipient: &str,
        content: &str,
        media: Option<&OutgoingMedia>,
        mention_tag: Option<&str>,
    ) -> DeliveryResult {
        let Some(base) = integration_config.get("base_url").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing whatsapp integration base_url");
        };
        let Some(api_key) = integration_config.get("api_key").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing whatsapp integration api_key");
        };

        let chat_id = normalize_chat_id(recipient);

        let (content_type, content_value) = match media {
            Some(m) if m.from_url => ("MessageMediaFromURL", m.url.clone()),
            Some(m) => ("MessageMedia", m.url.clone()),
            None => ("string", content.to_string()),
        };

        let mut content_value = content_value;
        let mut options: Option<Value> = None;
        if let Some(tag) = mention_tag {
            if content_type == "string" {
                content_value = format!("@{tag} {content_value}");
            }
            let mention_suffix = if chat_id.ends_with("@lid") { "@lid" } else { "@c.us" };
            options = Some(serde_json::json!({ "mentions": [format!("{tag}{mention_suffix}")] }));
        }

        let mut body = serde_json::json!({
            "chatId": chat_id,
            "contentType": content_type,
            "content": content_value,
        });
        if let Some(options) = options {
            body["options"] = options;
        }

        let url = format!("{}/client/sendMessage/{agent_id}", base.trim_end_matches('/'));
        let resp = self.client.post(&url).header("x-api-key", api_key).json(&body).send().await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                DeliveryResult::ok(message_id)
            }
            Ok(resp) => DeliveryResult::failure(format!("whatsapp adapter returned {}", resp.status())),
            Err(e) => DeliveryResult::failure(format!("whatsapp adapter request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_only_gets_c_us_suffix() {
        assert_eq!(normalize_chat_id("+1 234-567"), "1234567@c.us");
    }

    #[test]
    fn existing_suffix_is_preserved() {
        assert_eq!(normalize_chat_id("6281234@lid"), "6281234@lid");
        assert_eq!(normalize_chat_id("12036304@g.us"), "12036304@g.us");
    }

    #[tokio::test]
    async fn missing_base_url_fails_without_network_call() {
        let sender = WhatsAppSender::new();
        let mut cfg = Map::new();
        cfg.insert("api_key".into(), Value::String("k".into()));
        let result = sender.send(Uuid::new_v4(), &cfg, "123", "hi", None, None).await;
        assert!(!result.success);
    }
}
