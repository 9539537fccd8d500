//! C4: the channel callback dispatcher.
//!
//! Resolves a [`ChannelType`] to its [`ChannelSender`] and forwards the
//! call. Per spec §4.4 this never raises: a missing integration or sender
//! simply yields a failed [`DeliveryResult`], same as a failed HTTP call.

use crate::email::EmailSender;
use crate::message::{ChannelType, DeliveryResult, OutgoingMedia};
use crate::telegram::TelegramSender;
use crate::traits::ChannelSender;
use crate::whatsapp::WhatsAppSender;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

pub struct ChannelDispatcher {
    senders: HashMap<ChannelType, Box<dyn ChannelSender>>,
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        let mut senders: HashMap<ChannelType, Box<dyn ChannelSender>> = HashMap::new();
        senders.insert(ChannelType::WhatsApp, Box::new(WhatsAppSender::new()));
        senders.insert(ChannelType::Telegram, Box::new(TelegramSender::new()));
        senders.insert(ChannelType::Email, Box::new(EmailSender::new()));
        Self { senders }
    }
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `content` through the integration configured for `channel`.
    /// `integration_config` is the agent's per-channel attribute bag
    /// (spec §3 `AgentIntegration.config`), already resolved by the caller
    /// (the router or pipeline, which hold the `StateStore` lookup). A
    /// channel with no registered sender — or the Web channel, which has no
    /// outbound leg of its own (spec §9: the web widget reads replies over
    /// the WebSocket hub) — fails without a network call.
    pub async fn dispatch(
        &self,
        channel: ChannelType,
        agent_id: Uuid,
        integration_config: &Map<String, Value>,
        recipient: &str,
        content: &str,
        media: Option<&OutgoingMedia>,
        mention_tag: Option<&str>,
    ) -> DeliveryResult {
        let Some(sender) = self.senders.get(&channel) else {
            return DeliveryResult::failure(format!("no outbound sender registered for channel {channel}"));
        };
        sender.send(agent_id, integration_config, recipient, content, media, mention_tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn web_channel_has_no_sender() {
        let dispatcher = ChannelDispatcher::new();
        let result = dispatcher
            .dispatch(ChannelType::Web, Uuid::new_v4(), &Map::new(), "session-1", "hi", None, None)
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn whatsapp_dispatch_fails_without_network_when_config_missing() {
        let dispatcher = ChannelDispatcher::new();
        let result = dispatcher
            .dispatch(ChannelType::WhatsApp, Uuid::new_v4(), &Map::new(), "123", "hi", None, None)
            .await;
        assert!(!result.success);
    }
}
