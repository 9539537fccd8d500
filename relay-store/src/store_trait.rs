//! The typed repository contract (C2) used by the router, orchestrator and pipeline.

use crate::entities::{
    Agent, AgentIntegration, AgentSettings, Chat, Customer, IntegrationChannel, Message, Ticket, TicketActivity,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of merging an inbound customer message into the chat's history.
#[derive(Debug, Clone)]
pub struct MergedMessage {
    pub message_id: Uuid,
    pub merged: bool,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Channel-specific normalize-and-lookup-or-create, per spec's customer
    /// identity rules (phone digits-only + tolerant prefix forms for
    /// WhatsApp, `telegram_id`+group context for Telegram, address for
    /// email, `session_id` for web). Opportunistically replaces a
    /// placeholder name when a better one arrives.
    async fn upsert_customer(
        &self,
        tenant_id: Uuid,
        channel: IntegrationChannel,
        contact: &str,
        name: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> StoreResult<Customer>;

    /// Most recent chat among `{open, assigned, resolved}`, newest
    /// `last_message_at` first.
    async fn find_active_chat(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Option<Chat>>;

    /// Creates the chat if none is active, otherwise reuses `active`.
    /// Always creates as AI-handled; callers that must honor the owning
    /// agent's human/AI status (the router, spec §4.6 step 7) use
    /// [`StateStore::create_chat`] instead.
    async fn open_or_create_chat(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Chat>;

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Agent>;

    /// Loads a chat by id; used by the AI response pipeline (C8 step 1) to
    /// validate `handled_by` before doing any work.
    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat>;

    /// Loads a customer by id; used by the channel dispatcher (C4) to
    /// resolve the outbound recipient address.
    async fn get_customer(&self, customer_id: Uuid) -> StoreResult<Customer>;

    /// Loads a single message by id; used by the AI response pipeline (C8
    /// step 1) to read the triggering message's content/metadata.
    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message>;

    /// Looks up the integration bound to `(agent_id, channel)`, used by the
    /// pipeline's outbound dispatch (C8 step 10) to resolve the sending
    /// agent's channel config. Distinct from [`StateStore::find_integration`],
    /// which goes the other way (inbound address → agent) for the router.
    async fn get_integration(&self, agent_id: Uuid, channel: IntegrationChannel) -> StoreResult<Option<AgentIntegration>>;

    /// Replaces a customer's `metadata` bag wholesale (spec §4.6 step 8:
    /// `last_contact_at`/`message_count`/`preferred_channel`/
    /// `channels_used`/`first_contact_*`).
    async fn update_customer_metadata(&self, customer_id: Uuid, metadata: Map<String, Value>) -> StoreResult<()>;

    /// Creates a new chat, setting `handled_by`/`ai_agent_id`/
    /// `human_agent_id`/`assigned_agent_id` from `agent.is_ai()` (spec §4.6
    /// step 7).
    async fn create_chat(
        &self,
        tenant_id: Uuid,
        agent: &Agent,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Chat>;

    /// Idempotent insert keyed by `whatsapp_message_id` in `metadata` when
    /// present: a duplicate merges metadata (and fills empty `content`)
    /// into the existing row instead of inserting a new one.
    async fn insert_or_merge_customer_message(
        &self,
        chat: &Chat,
        content: &str,
        metadata: Map<String, Value>,
    ) -> StoreResult<MergedMessage>;

    async fn append_agent_message(
        &self,
        chat: &Chat,
        content: &str,
        sender_id: Option<Uuid>,
        metadata: Map<String, Value>,
    ) -> StoreResult<Uuid>;

    /// Merges `patch` into a message's `metadata`, used by the channel
    /// dispatch step (spec §7 PermanentUpstream) to mark
    /// `{delivery_failed: true, reason}` after a failed outbound send.
    async fn patch_message_metadata(&self, message_id: Uuid, patch: Map<String, Value>) -> StoreResult<()>;

    /// Newest-first then reversed to chronological order; identical
    /// consecutive `content` is collapsed.
    async fn fetch_history(
        &self,
        chat_id: Uuid,
        exclude_message_id: Option<Uuid>,
        limit: u32,
    ) -> StoreResult<Vec<Message>>;

    async fn get_agent_settings(&self, agent_id: Uuid) -> StoreResult<AgentSettings>;

    /// Evaluates `schedule_config` against `now`; fails open on malformed
    /// config rather than blocking delivery.
    fn within_schedule(
        &self,
        schedule_config: &crate::entities::ScheduleConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> (bool, Option<String>) {
        crate::schedule::within_schedule(schedule_config, now)
    }

    async fn find_integration(
        &self,
        tenant_id: Uuid,
        channel: IntegrationChannel,
        recipient_address: &str,
    ) -> StoreResult<Option<(AgentIntegration, Uuid)>>;

    async fn update_chat_status(
        &self,
        chat_id: Uuid,
        status: crate::entities::ChatStatus,
        handled_by: Option<crate::entities::HandledBy>,
    ) -> StoreResult<()>;

    async fn touch_last_message_at(&self, chat_id: Uuid) -> StoreResult<()>;

    async fn create_ticket(
        &self,
        tenant_id: Uuid,
        chat_id: Uuid,
        priority: crate::entities::TicketPriority,
        category: &str,
    ) -> StoreResult<Ticket>;

    async fn append_ticket_activity(
        &self,
        ticket_id: Uuid,
        kind: &str,
        detail: Option<&str>,
    ) -> StoreResult<TicketActivity>;

    async fn find_open_ticket(&self, chat_id: Uuid) -> StoreResult<Option<Ticket>>;

    /// Posts a tenant-scoped usage transaction for a successful, non-error
    /// LLM response (spec §4.8 step 11). Never called on error responses.
    async fn record_credit_usage(&self, tenant_id: Uuid, chat_id: Uuid, total_tokens: u64, cost: f64) -> StoreResult<()>;
}
