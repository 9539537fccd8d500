//! Email outbound sender (spec §4.4): POSTs
//! `{from_email, to_email, subject, message, metadata}` to the tenant's
//! configured email webhook URL. Actual SMTP delivery is an external
//! collaborator process behind that webhook, out of this system's scope.

use crate::message::{DeliveryResult, OutgoingMedia};
use crate::traits::ChannelSender;
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

pub struct EmailSender {
    client: reqwest::Client,
}

impl Default for EmailSender {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl EmailSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn send(
        &self,
        _agent_id: Uuid,
        integration_config: &Map<String, Value>,
        recipient: &str,
        content: &str,
        media: Option<&OutgoingMedia>,
        _mention_tag: Option<&str>,
    ) -> DeliveryResult {
        let Some(webhook_url) = integration_config.get("webhook_url").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing email integration webhook_url");
        };
        let Some(from_email) = integration_config.get("from_email").and_then(Value::as_str) else {
            return DeliveryResult::failure("missing email integration from_email");
        };

        let subject = integration_config.get("reply_subject").and_then(Value::as_str).unwrap_or("Re: your message");

        let mut metadata = Map::new();
        if let Some(media) = media {
            metadata.insert("media_url".into(), Value::String(media.url.clone()));
        }

        let body = serde_json::json!({
            "from_email": from_email,
            "to_email": recipient,
            "subject": subject,
            "message": content,
            "metadata": metadata,
        });

        let resp = self
            .client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => DeliveryResult::ok(Uuid::new_v4().to_string()),
            Ok(resp) => DeliveryResult::failure(format!("email webhook returned {}", resp.status())),
            Err(e) => DeliveryResult::failure(format!("email webhook request failed: {e}")),
        }
    }
}
