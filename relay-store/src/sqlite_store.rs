//! SQLite-backed [`StateStore`]. Mirrors the connection-per-call idiom used
//! by the knowledge index: each operation opens its own `Connection` inside
//! `spawn_blocking` rather than holding one across an `.await`.

use crate::entities::*;
use crate::store_trait::{MergedMessage, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct SqliteStateStore {
    db_path: PathBuf,
}

impl SqliteStateStore {
    pub fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db_path })
    }

    fn open(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Seeds an agent row. Agent/tenant/integration provisioning is assumed
    /// to happen in an external admin surface; this exists for tests and
    /// for the server binary's startup seeding.
    pub async fn insert_agent(&self, agent: &Agent) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        let agent = agent.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let status = match agent.status {
                AgentStatus::Active => "active",
                AgentStatus::Busy => "busy",
                AgentStatus::Offline => "offline",
            };
            conn.execute(
                "INSERT OR REPLACE INTO agents (id, tenant_id, user_id, status) VALUES (?1,?2,?3,?4)",
                params![agent.id.to_string(), agent.tenant_id.to_string(), agent.user_id.map(|u| u.to_string()), status],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    /// Seeds an agent integration row, analogous to [`Self::insert_agent`].
    pub async fn insert_agent_integration(&self, integration: &AgentIntegration) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        let integration = integration.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let status = match integration.status {
                IntegrationStatus::Connected => "connected",
                IntegrationStatus::Pending => "pending",
                IntegrationStatus::Error => "error",
            };
            conn.execute(
                "INSERT OR REPLACE INTO agent_integrations (agent_id, channel, enabled, status, config) VALUES (?1,?2,?3,?4,?5)",
                params![
                    integration.agent_id.to_string(),
                    channel_str(integration.channel),
                    integration.enabled,
                    status,
                    json_text(&integration.config),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    user_id TEXT,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_integrations (
    agent_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    status TEXT NOT NULL,
    config TEXT NOT NULL,
    PRIMARY KEY (agent_id, channel)
);

CREATE TABLE IF NOT EXISTS agent_settings (
    agent_id TEXT PRIMARY KEY,
    persona_config TEXT NOT NULL,
    advanced_config TEXT NOT NULL,
    schedule_config TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    phone TEXT,
    email TEXT,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_customers_tenant_phone ON customers(tenant_id, phone);
CREATE INDEX IF NOT EXISTS idx_customers_tenant_email ON customers(tenant_id, email);

CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    sender_agent_id TEXT NOT NULL,
    ai_agent_id TEXT,
    human_agent_id TEXT,
    assigned_agent_id TEXT,
    status TEXT NOT NULL,
    handled_by TEXT NOT NULL,
    last_message_at TEXT NOT NULL,
    unread_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_chats_lookup ON chats(tenant_id, sender_agent_id, customer_id, channel, last_message_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    sender_type TEXT NOT NULL,
    sender_id TEXT,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);

CREATE TABLE IF NOT EXISTS tickets (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    ticket_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    category TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    closed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tickets_chat ON tickets(chat_id);

CREATE TABLE IF NOT EXISTS ticket_activities (
    id TEXT PRIMARY KEY,
    ticket_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ticket_counters (
    tenant_id TEXT PRIMARY KEY,
    next_number INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS credit_transactions (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    total_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credit_transactions_tenant ON credit_transactions(tenant_id, created_at);
"#;

fn json_text(v: &Map<String, Value>) -> String {
    Value::Object(v.clone()).to_string()
}

fn parse_json_map(s: &str) -> Map<String, Value> {
    serde_json::from_str::<Value>(s).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default()
}

fn channel_str(c: IntegrationChannel) -> &'static str {
    match c {
        IntegrationChannel::Whatsapp => "whatsapp",
        IntegrationChannel::Telegram => "telegram",
        IntegrationChannel::Email => "email",
        IntegrationChannel::Mcp => "mcp",
    }
}

fn parse_channel(s: &str) -> Option<IntegrationChannel> {
    match s {
        "whatsapp" => Some(IntegrationChannel::Whatsapp),
        "telegram" => Some(IntegrationChannel::Telegram),
        "email" => Some(IntegrationChannel::Email),
        "mcp" => Some(IntegrationChannel::Mcp),
        _ => None,
    }
}

fn status_str(s: ChatStatus) -> &'static str {
    match s {
        ChatStatus::Open => "open",
        ChatStatus::Assigned => "assigned",
        ChatStatus::Resolved => "resolved",
        ChatStatus::Closed => "closed",
    }
}

fn parse_status(s: &str) -> ChatStatus {
    match s {
        "assigned" => ChatStatus::Assigned,
        "resolved" => ChatStatus::Resolved,
        "closed" => ChatStatus::Closed,
        _ => ChatStatus::Open,
    }
}

fn handled_by_str(h: HandledBy) -> &'static str {
    match h {
        HandledBy::Ai => "ai",
        HandledBy::Human => "human",
        HandledBy::Unassigned => "unassigned",
    }
}

fn parse_handled_by(s: &str) -> HandledBy {
    match s {
        "ai" => HandledBy::Ai,
        "human" => HandledBy::Human,
        _ => HandledBy::Unassigned,
    }
}

fn row_to_chat(row: &rusqlite::Row) -> rusqlite::Result<Chat> {
    let channel: String = row.get("channel")?;
    let status: String = row.get("status")?;
    let handled_by: String = row.get("handled_by")?;
    Ok(Chat {
        id: row.get::<_, String>("id")?.parse().unwrap_or_default(),
        tenant_id: row.get::<_, String>("tenant_id")?.parse().unwrap_or_default(),
        customer_id: row.get::<_, String>("customer_id")?.parse().unwrap_or_default(),
        channel: parse_channel(&channel).unwrap_or(IntegrationChannel::Whatsapp),
        sender_agent_id: row.get::<_, String>("sender_agent_id")?.parse().unwrap_or_default(),
        ai_agent_id: row.get::<_, Option<String>>("ai_agent_id")?.and_then(|s| s.parse().ok()),
        human_agent_id: row.get::<_, Option<String>>("human_agent_id")?.and_then(|s| s.parse().ok()),
        assigned_agent_id: row.get::<_, Option<String>>("assigned_agent_id")?.and_then(|s| s.parse().ok()),
        status: parse_status(&status),
        handled_by: parse_handled_by(&handled_by),
        last_message_at: row.get::<_, String>("last_message_at")?.parse().unwrap_or_else(|_| Utc::now()),
        unread_count: row.get("unread_count")?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let sender_type: String = row.get("sender_type")?;
    let metadata: String = row.get("metadata")?;
    Ok(Message {
        id: row.get::<_, String>("id")?.parse().unwrap_or_default(),
        chat_id: row.get::<_, String>("chat_id")?.parse().unwrap_or_default(),
        sender_type: match sender_type.as_str() {
            "ai" => SenderType::Ai,
            "human" => SenderType::Human,
            "system" => SenderType::System,
            _ => SenderType::Customer,
        },
        sender_id: row.get::<_, Option<String>>("sender_id")?.and_then(|s| s.parse().ok()),
        content: row.get("content")?,
        metadata: parse_json_map(&metadata),
        created_at: row.get::<_, String>("created_at")?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
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

        let db_path = self.db_path.clone();
        let contact = contact.to_string();
        let name = name.map(str::to_string);
        let metadata = metadata.unwrap_or_default();

        tokio::task::spawn_blocking(move || -> StoreResult<Customer> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;

            let (where_col, lookup_forms): (&str, Vec<String>) = match channel {
                IntegrationChannel::Whatsapp => ("phone", crate::identity::whatsapp_lookup_forms(&contact)),
                IntegrationChannel::Telegram => ("phone", vec![contact.clone()]),
                IntegrationChannel::Email => ("email", vec![contact.to_ascii_lowercase()]),
                IntegrationChannel::Mcp => ("phone", vec![contact.clone()]),
            };

            let mut found: Option<Customer> = None;
            for form in &lookup_forms {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT id, tenant_id, name, phone, email, metadata FROM customers WHERE tenant_id = ?1 AND {where_col} = ?2"
                        ),
                        params![tenant_id.to_string(), form],
                        |row| {
                            Ok(Customer {
                                id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                                tenant_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                                name: row.get(2)?,
                                phone: row.get(3)?,
                                email: row.get(4)?,
                                metadata: parse_json_map(&row.get::<_, String>(5)?),
                            })
                        },
                    )
                    .optional()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                if row.is_some() {
                    found = row;
                    break;
                }
            }

            // Secondary lookup (spec §3): a returning WhatsApp contact whose
            // current phone-form digits don't match any stored `phone` form
            // may still be identifiable by a `whatsapp_lid` tag left on the
            // customer record during a prior group→participant swap.
            if found.is_none() && matches!(channel, IntegrationChannel::Whatsapp) {
                let lid_digits = crate::identity::normalize_whatsapp_contact(&contact);
                found = conn
                    .query_row(
                        "SELECT id, tenant_id, name, phone, email, metadata FROM customers \
                         WHERE tenant_id = ?1 AND json_extract(metadata, '$.whatsapp_lid') = ?2",
                        params![tenant_id.to_string(), lid_digits],
                        |row| {
                            Ok(Customer {
                                id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                                tenant_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                                name: row.get(2)?,
                                phone: row.get(3)?,
                                email: row.get(4)?,
                                metadata: parse_json_map(&row.get::<_, String>(5)?),
                            })
                        },
                    )
                    .optional()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }

            if let Some(mut customer) = found {
                let better_name = name.as_deref().filter(|n| !n.trim().is_empty() && customer.has_placeholder_name());
                if let Some(better_name) = better_name {
                    customer.name = better_name.to_string();
                    conn.execute(
                        "UPDATE customers SET name = ?1 WHERE id = ?2",
                        params![customer.name, customer.id.to_string()],
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                }
                return Ok(customer);
            }

            let id = Uuid::new_v4();
            let (phone, email) = match channel {
                IntegrationChannel::Whatsapp | IntegrationChannel::Telegram | IntegrationChannel::Mcp => {
                    (Some(lookup_forms[0].clone()), None)
                }
                IntegrationChannel::Email => (None, Some(lookup_forms[0].clone())),
            };
            let customer = Customer {
                id,
                tenant_id,
                name: name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| "Unknown".to_string()),
                phone,
                email,
                metadata,
            };
            conn.execute(
                "INSERT INTO customers (id, tenant_id, name, phone, email, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    customer.id.to_string(),
                    customer.tenant_id.to_string(),
                    customer.name,
                    customer.phone,
                    customer.email,
                    json_text(&customer.metadata),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(customer)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn find_active_chat(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Option<Chat>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Option<Chat>> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row(
                "SELECT * FROM chats WHERE tenant_id = ?1 AND sender_agent_id = ?2 AND customer_id = ?3 AND channel = ?4 \
                 AND status IN ('open','assigned','resolved') ORDER BY last_message_at DESC LIMIT 1",
                params![tenant_id.to_string(), agent_id.to_string(), customer_id.to_string(), channel_str(channel)],
                row_to_chat,
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
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

        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Chat> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
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
            conn.execute(
                "INSERT INTO chats (id, tenant_id, customer_id, channel, sender_agent_id, ai_agent_id, human_agent_id, \
                 assigned_agent_id, status, handled_by, last_message_at, unread_count) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    chat.id.to_string(),
                    chat.tenant_id.to_string(),
                    chat.customer_id.to_string(),
                    channel_str(chat.channel),
                    chat.sender_agent_id.to_string(),
                    chat.ai_agent_id.map(|u| u.to_string()),
                    chat.human_agent_id.map(|u| u.to_string()),
                    chat.assigned_agent_id.map(|u| u.to_string()),
                    status_str(chat.status),
                    handled_by_str(chat.handled_by),
                    chat.last_message_at.to_rfc3339(),
                    chat.unread_count,
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(chat)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_agent(&self, agent_id: Uuid) -> StoreResult<Agent> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Agent> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row(
                "SELECT id, tenant_id, user_id, status FROM agents WHERE id = ?1",
                params![agent_id.to_string()],
                |row| {
                    let status: String = row.get(3)?;
                    Ok(Agent {
                        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                        tenant_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                        user_id: row.get::<_, Option<String>>(2)?.and_then(|s| s.parse().ok()),
                        status: match status.as_str() {
                            "busy" => AgentStatus::Busy,
                            "offline" => AgentStatus::Offline,
                            _ => AgentStatus::Active,
                        },
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_chat(&self, chat_id: Uuid) -> StoreResult<Chat> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Chat> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row("SELECT * FROM chats WHERE id = ?1", params![chat_id.to_string()], row_to_chat)
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_customer(&self, customer_id: Uuid) -> StoreResult<Customer> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Customer> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row(
                "SELECT id, tenant_id, name, phone, email, metadata FROM customers WHERE id = ?1",
                params![customer_id.to_string()],
                |row| {
                    Ok(Customer {
                        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                        tenant_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                        name: row.get(2)?,
                        phone: row.get(3)?,
                        email: row.get(4)?,
                        metadata: parse_json_map(&row.get::<_, String>(5)?),
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("customer {customer_id}")))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Message> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row("SELECT * FROM messages WHERE id = ?1", params![message_id.to_string()], row_to_message)
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_integration(&self, agent_id: Uuid, channel: IntegrationChannel) -> StoreResult<Option<AgentIntegration>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Option<AgentIntegration>> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row(
                "SELECT enabled, status, config FROM agent_integrations WHERE agent_id = ?1 AND channel = ?2",
                params![agent_id.to_string(), channel_str(channel)],
                |row| {
                    let status: String = row.get(1)?;
                    let config: String = row.get(2)?;
                    Ok(AgentIntegration {
                        agent_id,
                        channel,
                        enabled: row.get(0)?,
                        status: match status.as_str() {
                            "pending" => IntegrationStatus::Pending,
                            "error" => IntegrationStatus::Error,
                            _ => IntegrationStatus::Connected,
                        },
                        config: parse_json_map(&config),
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn update_customer_metadata(&self, customer_id: Uuid, metadata: Map<String, Value>) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let changed = conn
                .execute(
                    "UPDATE customers SET metadata = ?1 WHERE id = ?2",
                    params![json_text(&metadata), customer_id.to_string()],
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("customer {customer_id}")));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn create_chat(
        &self,
        tenant_id: Uuid,
        agent: &Agent,
        customer_id: Uuid,
        channel: IntegrationChannel,
    ) -> StoreResult<Chat> {
        let db_path = self.db_path.clone();
        let agent = agent.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Chat> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
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
            conn.execute(
                "INSERT INTO chats (id, tenant_id, customer_id, channel, sender_agent_id, ai_agent_id, human_agent_id, \
                 assigned_agent_id, status, handled_by, last_message_at, unread_count) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    chat.id.to_string(),
                    chat.tenant_id.to_string(),
                    chat.customer_id.to_string(),
                    channel_str(chat.channel),
                    chat.sender_agent_id.to_string(),
                    chat.ai_agent_id.map(|u| u.to_string()),
                    chat.human_agent_id.map(|u| u.to_string()),
                    chat.assigned_agent_id.map(|u| u.to_string()),
                    status_str(chat.status),
                    handled_by_str(chat.handled_by),
                    chat.last_message_at.to_rfc3339(),
                    chat.unread_count,
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(chat)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn insert_or_merge_customer_message(
        &self,
        chat: &Chat,
        content: &str,
        metadata: Map<String, Value>,
    ) -> StoreResult<MergedMessage> {
        let db_path = self.db_path.clone();
        let chat_id = chat.id;
        let content = content.to_string();

        tokio::task::spawn_blocking(move || -> StoreResult<MergedMessage> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;

            if let Some(wa_id) = metadata.get("whatsapp_message_id").and_then(Value::as_str) {
                let existing = conn
                    .query_row(
                        "SELECT id, content, metadata FROM messages WHERE chat_id = ?1 AND \
                         json_extract(metadata, '$.whatsapp_message_id') = ?2",
                        params![chat_id.to_string(), wa_id],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                    )
                    .optional()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;

                if let Some((id, existing_content, existing_metadata)) = existing {
                    let mut merged_meta = parse_json_map(&existing_metadata);
                    for (k, v) in metadata {
                        merged_meta.insert(k, v);
                    }
                    let merged_content = if existing_content.trim().is_empty() { content.clone() } else { existing_content };
                    conn.execute(
                        "UPDATE messages SET content = ?1, metadata = ?2 WHERE id = ?3",
                        params![merged_content, json_text(&merged_meta), id],
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                    return Ok(MergedMessage { message_id: id.parse().unwrap_or_default(), merged: true });
                }
            }

            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_type, sender_id, content, metadata, created_at) \
                 VALUES (?1, ?2, 'customer', NULL, ?3, ?4, ?5)",
                params![id.to_string(), chat_id.to_string(), content, json_text(&metadata), Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(MergedMessage { message_id: id, merged: false })
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn append_agent_message(
        &self,
        chat: &Chat,
        content: &str,
        sender_id: Option<Uuid>,
        metadata: Map<String, Value>,
    ) -> StoreResult<Uuid> {
        let db_path = self.db_path.clone();
        let chat_id = chat.id;
        let content = content.to_string();
        let sender_type = if sender_id.is_some() { "human" } else { "ai" };

        tokio::task::spawn_blocking(move || -> StoreResult<Uuid> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_type, sender_id, content, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    chat_id.to_string(),
                    sender_type,
                    sender_id.map(|u| u.to_string()),
                    content,
                    json_text(&metadata),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(id)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn patch_message_metadata(&self, message_id: Uuid, patch: Map<String, Value>) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let existing: String = conn
                .query_row("SELECT metadata FROM messages WHERE id = ?1", params![message_id.to_string()], |row| row.get(0))
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
            let mut metadata = parse_json_map(&existing);
            for (k, v) in patch {
                metadata.insert(k, v);
            }
            conn.execute(
                "UPDATE messages SET metadata = ?1 WHERE id = ?2",
                params![json_text(&metadata), message_id.to_string()],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn fetch_history(
        &self,
        chat_id: Uuid,
        exclude_message_id: Option<Uuid>,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Vec<Message>> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT * FROM messages WHERE chat_id = ?1 ORDER BY created_at DESC LIMIT ?2")
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let rows = stmt
                .query_map(params![chat_id.to_string(), limit], row_to_message)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut newest_first = Vec::new();
            for row in rows {
                let msg = row.map_err(|e| StoreError::Backend(e.to_string()))?;
                if exclude_message_id.map(|id| id == msg.id).unwrap_or(false) {
                    continue;
                }
                newest_first.push(msg);
            }

            newest_first.reverse();
            newest_first.dedup_by(|a, b| a.content == b.content);
            Ok(newest_first)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn get_agent_settings(&self, agent_id: Uuid) -> StoreResult<AgentSettings> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<AgentSettings> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let row = conn
                .query_row(
                    "SELECT persona_config, advanced_config, schedule_config FROM agent_settings WHERE agent_id = ?1",
                    params![agent_id.to_string()],
                    |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                    },
                )
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            match row {
                Some((persona, advanced, schedule)) => Ok(AgentSettings {
                    agent_id,
                    persona_config: parse_json_map(&persona),
                    advanced_config: serde_json::from_str(&advanced).unwrap_or_default(),
                    schedule_config: serde_json::from_str(&schedule).unwrap_or_default(),
                }),
                None => Ok(AgentSettings {
                    agent_id,
                    persona_config: Map::new(),
                    advanced_config: AdvancedConfig::default(),
                    schedule_config: ScheduleConfig::default(),
                }),
            }
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn find_integration(
        &self,
        tenant_id: Uuid,
        channel: IntegrationChannel,
        recipient_address: &str,
    ) -> StoreResult<Option<(AgentIntegration, Uuid)>> {
        let db_path = self.db_path.clone();
        let recipient_address = recipient_address.to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<Option<(AgentIntegration, Uuid)>> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT ai.agent_id, ai.enabled, ai.status, ai.config \
                     FROM agent_integrations ai JOIN agents a ON a.id = ai.agent_id \
                     WHERE a.tenant_id = ?1 AND ai.channel = ?2 AND ai.enabled = 1",
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let rows = stmt
                .query_map(params![tenant_id.to_string(), channel_str(channel)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            for row in rows {
                let (agent_id, enabled, status, config) = row.map_err(|e| StoreError::Backend(e.to_string()))?;
                let config = parse_json_map(&config);
                let matches = config.values().any(|v| v.as_str() == Some(recipient_address.as_str()));
                if matches {
                    let agent_id: Uuid = agent_id.parse().unwrap_or_default();
                    let integration = AgentIntegration {
                        agent_id,
                        channel,
                        enabled,
                        status: match status.as_str() {
                            "pending" => IntegrationStatus::Pending,
                            "error" => IntegrationStatus::Error,
                            _ => IntegrationStatus::Connected,
                        },
                        config,
                    };
                    return Ok(Some((integration, agent_id)));
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn update_chat_status(
        &self,
        chat_id: Uuid,
        status: ChatStatus,
        handled_by: Option<HandledBy>,
    ) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            match handled_by {
                Some(handled_by) => conn.execute(
                    "UPDATE chats SET status = ?1, handled_by = ?2 WHERE id = ?3",
                    params![status_str(status), handled_by_str(handled_by), chat_id.to_string()],
                ),
                None => conn.execute(
                    "UPDATE chats SET status = ?1 WHERE id = ?2",
                    params![status_str(status), chat_id.to_string()],
                ),
            }
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn touch_last_message_at(&self, chat_id: Uuid) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.execute(
                "UPDATE chats SET last_message_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), chat_id.to_string()],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn create_ticket(
        &self,
        tenant_id: Uuid,
        chat_id: Uuid,
        priority: TicketPriority,
        category: &str,
    ) -> StoreResult<Ticket> {
        let db_path = self.db_path.clone();
        let category = category.to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<Ticket> {
            let mut conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let tx = conn.transaction().map_err(|e| StoreError::Backend(e.to_string()))?;

            tx.execute(
                "INSERT INTO ticket_counters (tenant_id, next_number) VALUES (?1, 2) \
                 ON CONFLICT(tenant_id) DO UPDATE SET next_number = next_number + 1",
                params![tenant_id.to_string()],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            let ticket_number: i64 = tx
                .query_row(
                    "SELECT next_number - 1 FROM ticket_counters WHERE tenant_id = ?1",
                    params![tenant_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let priority_str = match priority {
                TicketPriority::Low => "low",
                TicketPriority::Medium => "medium",
                TicketPriority::High => "high",
                TicketPriority::Urgent => "urgent",
            };
            let ticket = Ticket {
                id: Uuid::new_v4(),
                tenant_id,
                chat_id,
                ticket_number: ticket_number as u64,
                status: TicketStatus::Open,
                priority,
                category,
                created_at: Utc::now(),
                resolved_at: None,
                closed_at: None,
            };
            tx.execute(
                "INSERT INTO tickets (id, tenant_id, chat_id, ticket_number, status, priority, category, created_at, resolved_at, closed_at) \
                 VALUES (?1,?2,?3,?4,'open',?5,?6,?7,NULL,NULL)",
                params![
                    ticket.id.to_string(),
                    ticket.tenant_id.to_string(),
                    ticket.chat_id.to_string(),
                    ticket.ticket_number as i64,
                    priority_str,
                    ticket.category,
                    ticket.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(ticket)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn append_ticket_activity(
        &self,
        ticket_id: Uuid,
        kind: &str,
        detail: Option<&str>,
    ) -> StoreResult<TicketActivity> {
        let db_path = self.db_path.clone();
        let kind = kind.to_string();
        let detail = detail.map(str::to_string);
        tokio::task::spawn_blocking(move || -> StoreResult<TicketActivity> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let activity = TicketActivity { id: Uuid::new_v4(), ticket_id, kind, detail, created_at: Utc::now() };
            conn.execute(
                "INSERT INTO ticket_activities (id, ticket_id, kind, detail, created_at) VALUES (?1,?2,?3,?4,?5)",
                params![
                    activity.id.to_string(),
                    activity.ticket_id.to_string(),
                    activity.kind,
                    activity.detail,
                    activity.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(activity)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn find_open_ticket(&self, chat_id: Uuid) -> StoreResult<Option<Ticket>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Option<Ticket>> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.query_row(
                "SELECT id, tenant_id, chat_id, ticket_number, status, priority, category, created_at, resolved_at, closed_at \
                 FROM tickets WHERE chat_id = ?1 AND status IN ('open','in_progress') ORDER BY created_at DESC LIMIT 1",
                params![chat_id.to_string()],
                |row| {
                    let status: String = row.get(4)?;
                    let priority: String = row.get(5)?;
                    Ok(Ticket {
                        id: row.get::<_, String>(0)?.parse().unwrap_or_default(),
                        tenant_id: row.get::<_, String>(1)?.parse().unwrap_or_default(),
                        chat_id: row.get::<_, String>(2)?.parse().unwrap_or_default(),
                        ticket_number: row.get::<_, i64>(3)? as u64,
                        status: match status.as_str() {
                            "in_progress" => TicketStatus::InProgress,
                            "resolved" => TicketStatus::Resolved,
                            "closed" => TicketStatus::Closed,
                            _ => TicketStatus::Open,
                        },
                        priority: match priority.as_str() {
                            "low" => TicketPriority::Low,
                            "high" => TicketPriority::High,
                            "urgent" => TicketPriority::Urgent,
                            _ => TicketPriority::Medium,
                        },
                        category: row.get(6)?,
                        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
                        resolved_at: row.get::<_, Option<String>>(8)?.and_then(|s| s.parse().ok()),
                        closed_at: row.get::<_, Option<String>>(9)?.and_then(|s| s.parse().ok()),
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn record_credit_usage(&self, tenant_id: Uuid, chat_id: Uuid, total_tokens: u64, cost: f64) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT INTO credit_transactions (id, tenant_id, chat_id, total_tokens, cost, created_at) VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id.to_string(),
                    chat_id.to_string(),
                    total_tokens as i64,
                    cost,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (SqliteStateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStateStore::new(dir.path().join("state.db")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_customer_creates_then_reuses_by_normalized_phone() {
        let (store, _dir) = store();
        let tenant = Uuid::new_v4();
        let c1 = store
            .upsert_customer(tenant, IntegrationChannel::Whatsapp, "+1 555 0100@c.us", Some("Unknown"), None)
            .await
            .unwrap();
        let c2 = store
            .upsert_customer(tenant, IntegrationChannel::Whatsapp, "15550100@c.us", Some("Jane"), None)
            .await
            .unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c2.name, "Jane");
    }

    #[tokio::test]
    async fn upsert_customer_matches_existing_by_whatsapp_lid_when_phone_form_misses() {
        let (store, _dir) = store();
        let tenant = Uuid::new_v4();
        let customer = store.upsert_customer(tenant, IntegrationChannel::Whatsapp, "999888777", None, None).await.unwrap();

        let mut metadata = Map::new();
        metadata.insert("whatsapp_lid".into(), Value::String("111222333".into()));
        store.update_customer_metadata(customer.id, metadata).await.unwrap();

        let rematched =
            store.upsert_customer(tenant, IntegrationChannel::Whatsapp, "111222333", Some("Returning Contact"), None).await.unwrap();

        assert_eq!(rematched.id, customer.id, "should match the existing customer via the whatsapp_lid tag, not create a new one");
    }

    #[tokio::test]
    async fn upsert_customer_rejects_empty_contact() {
        let (store, _dir) = store();
        let err = store.upsert_customer(Uuid::new_v4(), IntegrationChannel::Email, "", None, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn message_dedupe_merges_by_whatsapp_message_id() {
        let (store, _dir) = store();
        let tenant = Uuid::new_v4();
        let customer = store.upsert_customer(tenant, IntegrationChannel::Whatsapp, "15550100", None, None).await.unwrap();
        let chat = store.open_or_create_chat(tenant, Uuid::new_v4(), customer.id, IntegrationChannel::Whatsapp).await.unwrap();

        let mut meta = Map::new();
        meta.insert("whatsapp_message_id".to_string(), Value::String("wa-1".to_string()));
        let first = store.insert_or_merge_customer_message(&chat, "hello", meta.clone()).await.unwrap();
        assert!(!first.merged);

        meta.insert("media_url".to_string(), Value::String("https://x/y.jpg".to_string()));
        let second = store.insert_or_merge_customer_message(&chat, "hello", meta).await.unwrap();
        assert!(second.merged);
        assert_eq!(first.message_id, second.message_id);
    }

    #[tokio::test]
    async fn ticket_numbers_are_monotonic_per_tenant() {
        let (store, _dir) = store();
        let tenant = Uuid::new_v4();
        let chat_id = Uuid::new_v4();
        let t1 = store.create_ticket(tenant, chat_id, TicketPriority::Low, "billing").await.unwrap();
        let t2 = store.create_ticket(tenant, chat_id, TicketPriority::High, "billing").await.unwrap();
        assert_eq!(t2.ticket_number, t1.ticket_number + 1);
    }
}
