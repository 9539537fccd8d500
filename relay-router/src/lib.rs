//! Inbound message routing (C6): resolves the customer and chat an inbound
//! message belongs to, serialized per `(tenant, contact, is_group)` so
//! concurrent webhook deliveries for the same conversation never race.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

use relay_lock::{LockError, LockService};
use relay_store::{Agent, Chat, ChatStatus, HandledBy, IntegrationChannel, StateStore, StoreError};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const LOCK_TTL: Duration = Duration::from_secs(20);
const LOCK_MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("could not acquire routing lock in time")]
    LockTimeout,
    #[error("lock backend error: {0}")]
    Lock(#[from] LockError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Input to [`MessageRouter::route`]. `message_metadata` carries
/// channel-specific fields (`whatsapp_message_id`, `is_group`, `participant`,
/// `telegram_sender_id`, `media_url`, `media_type`, `push_name`, ...).
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub agent: Agent,
    pub channel: IntegrationChannel,
    pub contact: String,
    pub content: String,
    pub customer_name: Option<String>,
    pub message_metadata: Map<String, Value>,
    pub customer_metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub customer_id: Uuid,
    pub is_new_chat: bool,
    pub was_reopened: bool,
    pub handled_by: HandledBy,
    pub status: ChatStatus,
    pub channel: IntegrationChannel,
    pub agent_id: Uuid,
    pub is_merged_event: bool,
}

pub struct MessageRouter {
    store: Arc<dyn StateStore>,
    lock: Arc<dyn LockService>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn StateStore>, lock: Arc<dyn LockService>) -> Self {
        Self { store, lock }
    }

    pub async fn route(&self, req: RouteRequest) -> Result<RouteOutcome, RouteError> {
        if req.contact.trim().is_empty() || req.contact.eq_ignore_ascii_case("none") {
            return Err(RouteError::Validation("contact is empty or \"none\"".into()));
        }

        let is_group = req.message_metadata.get("is_group").and_then(Value::as_bool).unwrap_or(false);
        let tenant_id = req.agent.tenant_id;
        let lock_key = format!("router:{tenant_id}:{contact}:{is_group}", contact = req.contact);

        let lease = self
            .lock
            .acquire(&lock_key, LOCK_TTL, LOCK_MAX_WAIT)
            .await?
            .ok_or(RouteError::LockTimeout)?;

        let outcome = self.route_locked(req, is_group).await;

        // Always release, even if the critical section failed, so a
        // transient store error doesn't wedge the conversation.
        let _ = self.lock.release(&lease).await;

        outcome
    }

    async fn route_locked(&self, req: RouteRequest, is_group: bool) -> Result<RouteOutcome, RouteError> {
        let (contact, metadata) = resolve_identity(req.channel, is_group, &req.contact, req.message_metadata);

        let customer = self
            .store
            .upsert_customer(req.agent.tenant_id, req.channel, &contact, req.customer_name.as_deref(), req.customer_metadata.clone())
            .await?;

        let active = self
            .store
            .find_active_chat(req.agent.tenant_id, req.agent.id, customer.id, req.channel)
            .await?;

        let (chat, is_new_chat) = match active {
            Some(chat) => (chat, false),
            None => {
                let chat = self.store.create_chat(req.agent.tenant_id, &req.agent, customer.id, req.channel).await?;
                (chat, true)
            }
        };

        let whatsapp_lid = metadata.get("whatsapp_lid").and_then(Value::as_str).map(str::to_string);
        let merged = self.store.insert_or_merge_customer_message(&chat, &req.content, metadata).await?;

        let (status, handled_by, was_reopened) = if is_new_chat {
            (chat.status, chat.handled_by, false)
        } else {
            self.heal_chat_state(&chat).await?
        };

        self.touch_customer_contact(&customer.id, &customer.metadata, req.channel, whatsapp_lid.as_deref()).await?;

        Ok(RouteOutcome {
            chat_id: chat.id,
            message_id: merged.message_id,
            customer_id: customer.id,
            is_new_chat,
            was_reopened,
            handled_by,
            status,
            channel: req.channel,
            agent_id: req.agent.id,
            is_merged_event: merged.merged,
        })
    }

    /// Reusing an existing chat (spec §4.6 step 6): bumps
    /// `last_message_at`, reopens a resolved chat, and heals an `assigned`
    /// chat that lost its assignee back to AI-handled.
    async fn heal_chat_state(&self, chat: &Chat) -> Result<(ChatStatus, HandledBy, bool), RouteError> {
        self.store.touch_last_message_at(chat.id).await?;

        if chat.status == ChatStatus::Resolved {
            self.store.update_chat_status(chat.id, ChatStatus::Open, None).await?;
            return Ok((ChatStatus::Open, chat.handled_by, true));
        }

        if chat.status == ChatStatus::Assigned && chat.assigned_agent_id.is_none() {
            self.store.update_chat_status(chat.id, ChatStatus::Open, Some(HandledBy::Ai)).await?;
            return Ok((ChatStatus::Open, HandledBy::Ai, false));
        }

        Ok((chat.status, chat.handled_by, false))
    }

    /// Spec §4.6 step 8: rolling contact stats kept on the customer record.
    /// `whatsapp_lid`, when the inbound event carried one (group→participant
    /// swap onto an `@lid` participant), is persisted here too so a later
    /// inbound event for the same LID identity - possibly normalizing to a
    /// different phone form - can be matched back via the store's secondary
    /// `whatsapp_lid` lookup (spec §3).
    async fn touch_customer_contact(
        &self,
        customer_id: &Uuid,
        current_metadata: &Map<String, Value>,
        channel: IntegrationChannel,
        whatsapp_lid: Option<&str>,
    ) -> Result<(), RouteError> {
        let mut metadata = current_metadata.clone();
        let now = chrono::Utc::now().to_rfc3339();
        let channel_str = channel_str(channel);

        if let Some(lid) = whatsapp_lid {
            let lid_digits = relay_store::identity::normalize_whatsapp_contact(lid);
            metadata.insert("whatsapp_lid".into(), Value::String(lid_digits));
            metadata.insert("is_lid_user".into(), Value::Bool(true));
        }

        metadata.insert("last_contact_at".into(), Value::String(now.clone()));

        let count = metadata.get("message_count").and_then(Value::as_u64).unwrap_or(0) + 1;
        metadata.insert("message_count".into(), Value::from(count));

        metadata.insert("preferred_channel".into(), Value::String(channel_str.to_string()));

        let mut channels_used: Vec<String> = metadata
            .get("channels_used")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if !channels_used.iter().any(|c| c == channel_str) {
            channels_used.push(channel_str.to_string());
        }
        metadata.insert("channels_used".into(), Value::Array(channels_used.into_iter().map(Value::String).collect()));

        if !metadata.contains_key("first_contact_at") {
            metadata.insert("first_contact_at".into(), Value::String(now));
            metadata.insert("first_contact_channel".into(), Value::String(channel_str.to_string()));
        }

        self.store.update_customer_metadata(*customer_id, metadata).await?;
        Ok(())
    }
}

fn channel_str(channel: IntegrationChannel) -> &'static str {
    match channel {
        IntegrationChannel::Whatsapp => "whatsapp",
        IntegrationChannel::Telegram => "telegram",
        IntegrationChannel::Email => "email",
        IntegrationChannel::Mcp => "mcp",
    }
}

/// Spec §4.6 step 2 / §3's group→participant swap: for group messages, the
/// effective customer-identity `contact` is the participant, not the group.
/// The group id is preserved on the message as `metadata.target_group_id`.
fn resolve_identity(
    channel: IntegrationChannel,
    is_group: bool,
    contact: &str,
    mut metadata: Map<String, Value>,
) -> (String, Map<String, Value>) {
    if !is_group {
        return (contact.to_string(), metadata);
    }

    let participant = match channel {
        IntegrationChannel::Whatsapp => metadata.get("participant").and_then(Value::as_str).map(str::to_string),
        IntegrationChannel::Telegram => metadata
            .get("participant")
            .and_then(Value::as_str)
            .or_else(|| metadata.get("telegram_sender_id").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    };

    let Some(participant) = participant.filter(|p| p != contact) else {
        return (contact.to_string(), metadata);
    };

    let group_id = contact.to_string();
    metadata.insert("target_group_id".into(), Value::String(group_id.clone()));
    metadata.insert("last_seen_in_group".into(), Value::String(group_id));

    let new_contact = match channel {
        IntegrationChannel::Whatsapp => {
            if participant.ends_with("@lid") {
                metadata.insert("is_lid_user".into(), Value::Bool(true));
                metadata.insert("whatsapp_lid".into(), Value::String(participant.clone()));
            }
            relay_store::identity::normalize_whatsapp_contact(&participant)
        }
        _ => participant,
    };

    (new_contact, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_lock::InMemoryLockService;
    use relay_store::{AgentStatus, InMemoryStateStore};

    fn agent(tenant_id: Uuid, is_ai: bool) -> Agent {
        Agent { id: Uuid::new_v4(), tenant_id, user_id: if is_ai { None } else { Some(Uuid::new_v4()) }, status: AgentStatus::Active }
    }

    fn router() -> (MessageRouter, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let lock = Arc::new(InMemoryLockService::new());
        (MessageRouter::new(store.clone(), lock), store)
    }

    #[tokio::test]
    async fn empty_contact_is_a_validation_error() {
        let (router, _store) = router();
        let tenant_id = Uuid::new_v4();
        let req = RouteRequest {
            agent: agent(tenant_id, true),
            channel: IntegrationChannel::Whatsapp,
            contact: "  ".into(),
            content: "hi".into(),
            customer_name: None,
            message_metadata: Map::new(),
            customer_metadata: None,
        };
        let err = router.route(req).await;
        assert!(matches!(err, Err(RouteError::Validation(_))));
    }

    #[tokio::test]
    async fn first_message_creates_ai_handled_chat_for_ai_agent() {
        let (router, _store) = router();
        let tenant_id = Uuid::new_v4();
        let req = RouteRequest {
            agent: agent(tenant_id, true),
            channel: IntegrationChannel::Whatsapp,
            contact: "+1 555 0100".into(),
            content: "hello".into(),
            customer_name: Some("Jane".into()),
            message_metadata: Map::new(),
            customer_metadata: None,
        };
        let outcome = router.route(req).await.unwrap();
        assert!(outcome.is_new_chat);
        assert_eq!(outcome.handled_by, HandledBy::Ai);
        assert_eq!(outcome.status, ChatStatus::Open);
    }

    #[tokio::test]
    async fn first_message_creates_human_handled_chat_for_human_agent() {
        let (router, _store) = router();
        let tenant_id = Uuid::new_v4();
        let req = RouteRequest {
            agent: agent(tenant_id, false),
            channel: IntegrationChannel::Email,
            contact: "a@b.com".into(),
            content: "hello".into(),
            customer_name: None,
            message_metadata: Map::new(),
            customer_metadata: None,
        };
        let outcome = router.route(req).await.unwrap();
        assert!(outcome.is_new_chat);
        assert_eq!(outcome.handled_by, HandledBy::Human);
    }

    #[tokio::test]
    async fn group_message_swaps_contact_to_participant_and_preserves_group_id() {
        let (router, store) = router();
        let tenant_id = Uuid::new_v4();
        let mut metadata = Map::new();
        metadata.insert("is_group".into(), Value::Bool(true));
        metadata.insert("participant".into(), Value::String("6281234@c.us".into()));
        let req = RouteRequest {
            agent: agent(tenant_id, true),
            channel: IntegrationChannel::Whatsapp,
            contact: "12036304@g.us".into(),
            content: "halo admin".into(),
            customer_name: None,
            message_metadata: metadata,
            customer_metadata: None,
        };
        let outcome = router.route(req).await.unwrap();

        let customer = store
            .upsert_customer(tenant_id, IntegrationChannel::Whatsapp, "6281234", None, None)
            .await
            .unwrap();
        assert_eq!(customer.id, outcome.customer_id);
        assert_eq!(customer.phone.as_deref(), Some("6281234"));

        let history = store.fetch_history(outcome.chat_id, None, 10).await.unwrap();
        let message = history.iter().find(|m| m.id == outcome.message_id).unwrap();
        assert_eq!(message.metadata.get("target_group_id").and_then(Value::as_str), Some("12036304@g.us"));
    }

    #[tokio::test]
    async fn duplicate_whatsapp_message_id_is_merged_not_duplicated() {
        let (router, _store) = router();
        let tenant_id = Uuid::new_v4();
        let agent = agent(tenant_id, true);

        let mut metadata = Map::new();
        metadata.insert("whatsapp_message_id".into(), Value::String("wa-1".into()));
        let req = RouteRequest {
            agent: agent.clone(),
            channel: IntegrationChannel::Whatsapp,
            contact: "15550100".into(),
            content: "hello".into(),
            customer_name: None,
            message_metadata: metadata.clone(),
            customer_metadata: None,
        };
        let first = router.route(req).await.unwrap();
        assert!(!first.is_merged_event);

        let mut metadata2 = metadata;
        metadata2.insert("media_url".into(), Value::String("https://x/y.jpg".into()));
        let req2 = RouteRequest {
            agent,
            channel: IntegrationChannel::Whatsapp,
            contact: "15550100".into(),
            content: "hello".into(),
            customer_name: None,
            message_metadata: metadata2,
            customer_metadata: None,
        };
        let second = router.route(req2).await.unwrap();
        assert!(second.is_merged_event);
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(first.chat_id, second.chat_id);
    }

    #[tokio::test]
    async fn resolved_chat_reopens_on_new_message() {
        let (router, store) = router();
        let tenant_id = Uuid::new_v4();
        let agent = agent(tenant_id, true);

        let req = RouteRequest {
            agent: agent.clone(),
            channel: IntegrationChannel::Email,
            contact: "a@b.com".into(),
            content: "first".into(),
            customer_name: None,
            message_metadata: Map::new(),
            customer_metadata: None,
        };
        let first = router.route(req).await.unwrap();
        store.update_chat_status(first.chat_id, ChatStatus::Resolved, None).await.unwrap();

        let req2 = RouteRequest {
            agent,
            channel: IntegrationChannel::Email,
            contact: "a@b.com".into(),
            content: "second".into(),
            customer_name: None,
            message_metadata: Map::new(),
            customer_metadata: None,
        };
        let second = router.route(req2).await.unwrap();
        assert!(!second.is_new_chat);
        assert!(second.was_reopened);
        assert_eq!(second.status, ChatStatus::Open);
        assert_eq!(second.chat_id, first.chat_id);
    }

    #[tokio::test]
    async fn lid_group_participant_tags_customer_metadata_with_whatsapp_lid() {
        let (router, store) = router();
        let tenant_id = Uuid::new_v4();
        let agent = agent(tenant_id, true);

        let mut group_metadata = Map::new();
        group_metadata.insert("is_group".into(), Value::Bool(true));
        group_metadata.insert("participant".into(), Value::String("87654321@lid".into()));
        let outcome = router
            .route(RouteRequest {
                agent,
                channel: IntegrationChannel::Whatsapp,
                contact: "12036304@g.us".into(),
                content: "halo admin".into(),
                customer_name: None,
                message_metadata: group_metadata,
                customer_metadata: None,
            })
            .await
            .unwrap();

        // Persisted onto the customer record (not just the message) so a
        // later event can be matched back to this customer by the store's
        // secondary whatsapp_lid lookup even if its contact takes a
        // different phone form.
        let customer = store.get_customer(outcome.customer_id).await.unwrap();
        assert_eq!(customer.metadata.get("whatsapp_lid").and_then(Value::as_str), Some("87654321"));
        assert_eq!(customer.metadata.get("is_lid_user").and_then(Value::as_bool), Some(true));
    }

    #[tokio::test]
    async fn customer_metadata_tracks_contact_stats_across_messages() {
        let (router, store) = router();
        let tenant_id = Uuid::new_v4();
        let agent = agent(tenant_id, true);

        for _ in 0..2 {
            let req = RouteRequest {
                agent: agent.clone(),
                channel: IntegrationChannel::Email,
                contact: "a@b.com".into(),
                content: "hi".into(),
                customer_name: None,
                message_metadata: Map::new(),
                customer_metadata: None,
            };
            router.route(req).await.unwrap();
        }

        let customer = store.upsert_customer(tenant_id, IntegrationChannel::Email, "a@b.com", None, None).await.unwrap();
        assert_eq!(customer.metadata.get("message_count").and_then(Value::as_u64), Some(2));
        assert!(customer.metadata.contains_key("first_contact_at"));
        assert_eq!(customer.metadata.get("preferred_channel").and_then(Value::as_str), Some("email"));
    }
}
