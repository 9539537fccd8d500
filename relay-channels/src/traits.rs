//! The per-channel outbound sender contract (C4).
//!
//! Spec §4.4: "Any non-2xx response is returned as `{success: false,
//! reason}` and must not raise." Every `ChannelSender` impl therefore
//! returns a `DeliveryResult` rather than propagating an error; the only
//! thing that short-circuits dispatch entirely is a missing/disabled
//! integration, handled by `dispatcher::ChannelDispatcher` before a sender
//! is ever invoked.

use crate::message::{DeliveryResult, OutgoingMedia};
use async_trait::async_trait;
use serde_json::{Map, Value};

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Deliver `content` (with optional `media`) through this channel's
    /// outbound API. `integration_config` is the agent's channel-specific
    /// attribute bag (spec §3 `AgentIntegration.config`); `recipient` is the
    /// resolved outbound address (phone/chat id/email). `mention_tag`
    /// carries the WhatsApp group `@<tag>` mention prefix when the chat is
    /// a group and the customer's `real_number` is known (spec §4.4);
    /// other channels ignore it.
    async fn send(
        &self,
        agent_id: uuid::Uuid,
        integration_config: &Map<String, Value>,
        recipient: &str,
        content: &str,
        media: Option<&OutgoingMedia>,
        mention_tag: Option<&str>,
    ) -> DeliveryResult;
}
