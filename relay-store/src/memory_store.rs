//! Plain in-process [`StateStore`] used by unit tests across the workspace
//! that don't need SQLite's durability.

use crate::entities::*;
use crate::store_trait::{MergedMessage, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    customers: HashMap<Uuid, Customer>,
    chats: HashMap<Uuid, Chat>,
    messages: HashMap<Uuid, Message>,
    settings: HashMap<Uuid, AgentSettings>,
    integrations: Vec<(AgentIntegration, Uuid, Uuid)>, // (integration, agent_id, tenant_id)
    tickets: HashMap<Uuid, Ticket>,
    ticket_counters: HashMap<Uuid, u64>,
    agents: HashMap<Uuid, Agent>,
    credit_transactions: Vec<(Uuid, Uuid, u64, f64)>, // (tenant_id, chat_id, total_tokens, cost)
}

#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_agent_settings(&self, settings: AgentSettings) {
        self.inner.write().unwrap().settings.insert(settings.agent_id, settings);
    }

    pub fn seed_integration(&self, integration: AgentIntegration, agent_id: Uuid, tenant_id: Uuid) {
        self.inner.write().unwrap().integrations.push((integration, agent_id, tenant_id));
    }

    pub fn seed_agent(&self, agent: Agent) {
        self.inner.write().unwrap().agents.insert(agent.id, agent);
    }

    /// Test/inspection hook: total credit transactions posted so far.
    pub fn credit_transaction_count(&self) -> usize {
        self.inner.read().unwrap().credit_transactions.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn upsert_customer(
        &self,
        tenant_id: Uuid,
        channel: IntegrationChannel,
        contact: &str,
        name: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> StoreResult<Customer> {
        if contact.trim().is_empty() || contact.eq_ignore_ascii_case("none") {
            return Err(StoreError::Validation("customer contact is empty or \"none\"".into()));
        }

        let key = match channel {
            IntegrationChannel::Whatsapp => crate::identity::normalize_whatsapp_contact(contact),
            IntegrationChannel::Email => contact.to_ascii_lowercase(),
            _ => contact.to_string(),
        };

        let mut inner = self.inner.write().unwrap();
        let existing_id = inner
            .customers
            .values()
            .find(|c| c.tenant_id == tenant_id && (c.phone.as_deref() == Some(key.as_str()) || c.email.as_deref() == Some(key.as_str())))
            .map(|c| c.id)
            .or_else(|| {
                // Secondary lookup (spec §3): a returning WhatsApp contact
                // whose current phone-form digits miss may still be
                // identifiable by a `whatsapp_lid` tag on the customer
                // record from a prior group→participant swap.
                if !matches!(channel, IntegrationChannel::Whatsapp) {
                    return None;
                }
                inner
                    .customers
                    .values()
                    .find(|c| {
                        c.tenant_id == tenant_id && c.metadata.get("whatsapp_lid").and_then(Value::as_str) == Some(key.as_str())
                    })
                    .map(|c| c.id)
            });
        if let Some(existing_id) = existing_id {
            let existing = inner.customers.get_mut(&existing_id).expect("existing_id was just found");
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                if existing.has_placeholder_name() {
                    existing.name = name.to_string();
                }
            }
            return Ok(existing.clone());
        }

        let (phone, email) = match channel {
            IntegrationChannel::Email => (None, Some(key)),
            _ => (Some(key), None),
        };
        let customer = Customer {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.filter(|n| !n.trim().is_empty()).unwrap_or("Unknown").to_string(),
            phone,
            email,
            metadata: metadata.unwrap_or_default(),
        };
        inner.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn find_active_chat(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Option<Chat>> {
        let inner = self.inner.read().unwrap();
        let mut matches: Vec<&Chat> = inner
            .chats
            .values()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.sender_agent_id == agent_id
                    && c.customer_id == customer_id
                    && c.channel == channel
                    && c.is_active()
            })
            .collect();
        matches.sort_by_key(|c| std::cmp::Reverse(c.last_message_at));
        Ok(matches.first().map(|c| (*c).clone()))
    }

    async fn open_or_create_chat(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Chat> {
        if let Some(existing) = self.find_active_chat(tenant_id, agent_id, customer_id, channel).await? {
            return Ok(existing);
        }
        let chat = Chat {
            id: Uuid::new_v4(),
            tenant_id,
            customer_id,
            channel,
            sender_agent_id: agent_id,
            ai_agent_id: Some(agent_id),
            human_agent_id: None,
            assigned_agent_id: None,
            status: ChatStatus::Open,
            handled_by: HandledBy::Ai,
            last_message_at: Utc::now(),
            unread_count: 0,
        };
        self.inner.write().unwrap().chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Agent> {
        self.inner
            .read()
            .unwrap()
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        self.inner.read().unwrap().chats.get(&chat_id).cloned().ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
    }

    async fn get_customer(&self, customer_id: Uuid) -> StoreResult<Customer> {
        self.inner
            .read()
            .unwrap()
            .customers
            .get(&customer_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("customer {customer_id}")))
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        self.inner
            .read()
            .unwrap()
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    async fn get_integration(&self, agent_id: Uuid, channel: IntegrationChannel) -> StoreResult<Option<AgentIntegration>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .integrations
            .iter()
            .find(|(integ, aid, _)| *aid == agent_id && integ.channel == channel)
            .map(|(integ, _, _)| integ.clone()))
    }

    async fn update_customer_metadata(&self, customer_id: Uuid, metadata: Map<String, Value>) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.customers.get_mut(&customer_id) {
            Some(customer) => {
                customer.metadata = metadata;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("customer {customer_id}"))),
        }
    }

    async fn create_chat(
        &self,
        tenant_id: Uuid,
        agent: &Agent,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Chat> {
        let handled_by = if agent.is_ai() { HandledBy::Ai } else { HandledBy::Human };
        let chat = Chat {
            id: Uuid::new_v4(),
            tenant_id,
            customer_id,
            channel,
            sender_agent_id: agent.id,
            ai_agent_id: agent.is_ai().then_some(agent.id),
            human_agent_id: (!agent.is_ai()).then_some(agent.id),
            assigned_agent_id: (!agent.is_ai()).then_some(agent.id),
            status: ChatStatus::Open,
            handled_by,
            last_message_at: Utc::now(),
            unread_count: 0,
        };
        self.inner.write().unwrap().chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn insert_or_merge_customer_message(
        &self,
        chat: &Chat,
        content: &str,
        metadata: Map<String, Value>,
    ) -> StoreResult<MergedMessage> {
        let mut inner = self.inner.write().unwrap();

        if let Some(wa_id) = metadata.get("whatsapp_message_id").and_then(Value::as_str) {
            if let Some(existing) = inner
                .messages
                .values_mut()
                .find(|m| m.chat_id == chat.id && m.whatsapp_message_id() == Some(wa_id))
            {
                for (k, v) in metadata {
                    existing.metadata.insert(k, v);
                }
                if existing.content.trim().is_empty() {
                    existing.content = content.to_string();
                }
                return Ok(MergedMessage { message_id: existing.id, merged: true });
            }
        }

        let message = Message {
            id: Uuid::new_v4(),
            chat_id: chat.id,
            sender_type: SenderType::Customer,
            sender_id: None,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let id = message.id;
        inner.messages.insert(id, message);
        Ok(MergedMessage { message_id: id, merged: false })
    }

    async fn append_agent_message(
        &self,
        chat: &Chat,
        content: &str,
        sender_id: Option<Uuid>,
        metadata: Map<String, Value>,
    ) -> StoreResult<Uuid> {
        let message = Message {
            id: Uuid::new_v4(),
            chat_id: chat.id,
            sender_type: if sender_id.is_some() { SenderType::Human } else { SenderType::Ai },
            sender_id,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let id = message.id;
        self.inner.write().unwrap().messages.insert(id, message);
        Ok(id)
    }

    async fn patch_message_metadata(&self, message_id: Uuid, patch: Map<String, Value>) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let message = inner.messages.get_mut(&message_id).ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        for (k, v) in patch {
            message.metadata.insert(k, v);
        }
        Ok(())
    }

    async fn fetch_history(
        &self,
        chat_id: Uuid,
        exclude_message_id: Option<Uuid>,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().unwrap();
        let mut newest_first: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && exclude_message_id.map(|id| id != m.id).unwrap_or(true))
            .cloned()
            .collect();
        newest_first.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        newest_first.truncate(limit as usize);
        newest_first.reverse();
        newest_first.dedup_by(|a, b| a.content == b.content);
        Ok(newest_first)
    }

    async fn get_agent_settings(&self, agent_id: Uuid) -> StoreResult<AgentSettings> {
        Ok(self.inner.read().unwrap().settings.get(&agent_id).cloned().unwrap_or(AgentSettings {
            agent_id,
            persona_config: Map::new(),
            advanced_config: AdvancedConfig::default(),
            schedule_config: ScheduleConfig::default(),
        }))
    }

    async fn find_integration(
        &self,
        tenant_id: Uuid,
        channel: IntegrationChannel,
        recipient_address: &str,
    ) -> StoreResult<Option<(AgentIntegration, Uuid)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .integrations
            .iter()
            .find(|(integ, _, tid)| {
                *tid == tenant_id
                    && integ.channel == channel
                    && integ.enabled
                    && integ.config.values().any(|v| v.as_str() == Some(recipient_address))
            })
            .map(|(integ, agent_id, _)| (integ.clone(), *agent_id)))
    }

    async fn update_chat_status(
        &self,
        chat_id: Uuid,
        status: ChatStatus,
        handled_by: Option<HandledBy>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(chat) = inner.chats.get_mut(&chat_id) {
            chat.status = status;
            if let Some(handled_by) = handled_by {
                chat.handled_by = handled_by;
            }
        }
        Ok(())
    }

    async fn touch_last_message_at(&self, chat_id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(chat) = inner.chats.get_mut(&chat_id) {
            chat.last_message_at = Utc::now();
        }
        Ok(())
    }

    async fn create_ticket(
        &self,
        tenant_id: Uuid,
        chat_id: Uuid,
        priority: TicketPriority,
        category: &str,
    ) -> StoreResult<Ticket> {
        let mut inner = self.inner.write().unwrap();
        let counter = inner.ticket_counters.entry(tenant_id).or_insert(0);
        *counter += 1;
        let ticket = Ticket {
            id: Uuid::new_v4(),
            tenant_id,
            chat_id,
            ticket_number: *counter,
            status: TicketStatus::Open,
            priority,
            category: category.to_string(),
            created_at: Utc::now(),
            resolved_at: None,
            closed_at: None,
        };
        inner.tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    async fn append_ticket_activity(
        &self,
        ticket_id: Uuid,
        kind: &str,
        detail: Option<&str>,
    ) -> StoreResult<TicketActivity> {
        Ok(TicketActivity {
            id: Uuid::new_v4(),
            ticket_id,
            kind: kind.to_string(),
            detail: detail.map(str::to_string),
            created_at: Utc::now(),
        })
    }

    async fn find_open_ticket(&self, chat_id: Uuid) -> StoreResult<Option<Ticket>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .tickets
            .values()
            .find(|t| t.chat_id == chat_id && matches!(t.status, TicketStatus::Open | TicketStatus::InProgress))
            .cloned())
    }

    async fn record_credit_usage(&self, tenant_id: Uuid, chat_id: Uuid, total_tokens: u64, cost: f64) -> StoreResult<()> {
        self.inner.write().unwrap().credit_transactions.push((tenant_id, chat_id, total_tokens, cost));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reopen_flow_finds_resolved_chat_as_active() {
        let store = InMemoryStateStore::new();
        let tenant = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let customer = store.upsert_customer(tenant, IntegrationChannel::Email, "a@b.com", None, None).await.unwrap();
        let chat = store.open_or_create_chat(tenant, agent, customer.id, IntegrationChannel::Email).await.unwrap();
        store.update_chat_status(chat.id, ChatStatus::Resolved, None).await.unwrap();

        let found = store.find_active_chat(tenant, agent, customer.id, IntegrationChannel::Email).await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().status, ChatStatus::Resolved);
    }

    /// Spec §3 secondary lookup: a WhatsApp contact tagged with a
    /// `whatsapp_lid` from an earlier group→participant swap must be
    /// matched back even when the contact presented this time doesn't
    /// share a stored phone form.
    #[tokio::test]
    async fn upsert_customer_matches_existing_by_whatsapp_lid_when_phone_form_misses() {
        let store = InMemoryStateStore::new();
        let tenant = Uuid::new_v4();

        let customer = store.upsert_customer(tenant, IntegrationChannel::Whatsapp, "999888777", None, None).await.unwrap();
        let mut metadata = Map::new();
        metadata.insert("whatsapp_lid".into(), Value::String("111222333".into()));
        store.update_customer_metadata(customer.id, metadata).await.unwrap();

        let rematched =
            store.upsert_customer(tenant, IntegrationChannel::Whatsapp, "111222333", Some("Returning Contact"), None).await.unwrap();

        assert_eq!(rematched.id, customer.id, "should match the existing customer via the whatsapp_lid tag, not create a new one");
    }
}
