//! Channel-variant types shared by the dispatcher (C4).
//!
//! `ChannelType` is a closed set per spec §9's polymorphism design note:
//! adding a channel means adding a variant and a sender implementation in
//! [`crate::dispatcher`], not a new trait object.

use serde::{Deserialize, Serialize};

/// The closed set of inbound/outbound channel variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    WhatsApp,
    Telegram,
    Email,
    Web,
}

impl ChannelType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Email => "email",
            Self::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Self::WhatsApp),
            "telegram" => Some(Self::Telegram),
            "email" => Some(Self::Email),
            "web" => Some(Self::Web),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound media attached to a reply, when the pipeline generated or
/// forwarded one (spec §4.4's `contentType: "string"|"MessageMedia"|"MessageMediaFromURL"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMedia {
    pub url: String,
    pub mime_type: Option<String>,
    /// Whether the adapter should fetch the URL itself (`MessageMediaFromURL`)
    /// versus treating `url` as an opaque already-uploaded media reference.
    pub from_url: bool,
}

/// Result of a single outbound dispatch attempt. Never an `Err` at the
/// dispatcher boundary — spec §4.4 "must not raise"; failures are reported
/// in this struct so the caller can still commit the stored reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub reason: Option<String>,
    pub provider_message_id: Option<String>,
}

impl DeliveryResult {
    pub fn ok(provider_message_id: impl Into<String>) -> Self {
        Self { success: true, reason: None, provider_message_id: Some(provider_message_id.into()) }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self { success: false, reason: Some(reason.into()), provider_message_id: None }
    }
}
