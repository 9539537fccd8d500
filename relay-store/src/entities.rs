//! Typed entities for the tenant/agent/customer/chat/message/ticket model.
//!
//! Attribute-bag fields (`config`, `metadata`, `persona_config`, ...) keep
//! their known fields typed and carry everything else in `extra` so upstream
//! channel configs can evolve without a migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

fn empty_extra() -> Map<String, Value> {
    Map::new()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: AgentStatus,
}

impl Agent {
    /// An agent is AI-driven iff it has no human `user_id`.
    pub fn is_ai(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationChannel {
    Whatsapp,
    Telegram,
    Email,
    Mcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Connected,
    Pending,
    Error,
}

/// One channel credential/config bound to an agent. Unique per
/// `(agent_id, channel)` — enforced by the store's schema, not in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIntegration {
    pub agent_id: Uuid,
    pub channel: IntegrationChannel,
    pub enabled: bool,
    pub status: IntegrationStatus,
    #[serde(default = "empty_extra")]
    pub config: Map<String, Value>,
}

impl AgentIntegration {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperature {
    Consistent,
    Balanced,
    Creative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    #[serde(default)]
    pub temperature: Option<Temperature>,
    #[serde(default)]
    pub handoff_triggers: Vec<String>,
}

fn default_history_limit() -> u32 {
    5
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self { history_limit: default_history_limit(), temperature: None, handoff_triggers: Vec::new() }
    }
}

/// A single weekday working-hours window, e.g. `{"day": "mon", "start": "09:00", "end": "18:00"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHoursWindow {
    pub day: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub working_hours: Vec<WorkingHoursWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_id: Uuid,
    #[serde(default = "empty_extra")]
    pub persona_config: Map<String, Value>,
    #[serde(default)]
    pub advanced_config: AdvancedConfig,
    #[serde(default)]
    pub schedule_config: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(default = "empty_extra")]
    pub metadata: Map<String, Value>,
}

impl Customer {
    pub fn has_placeholder_name(&self) -> bool {
        matches!(self.name.as_str(), "" | "Unknown" | "unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Open,
    Assigned,
    Resolved,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandledBy {
    Ai,
    Human,
    Unassigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub channel: IntegrationChannel,
    pub sender_agent_id: Uuid,
    pub ai_agent_id: Option<Uuid>,
    pub human_agent_id: Option<Uuid>,
    pub assigned_agent_id: Option<Uuid>,
    pub status: ChatStatus,
    pub handled_by: HandledBy,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
}

impl Chat {
    pub fn is_active(&self) -> bool {
        matches!(self.status, ChatStatus::Open | ChatStatus::Assigned | ChatStatus::Resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    Ai,
    Human,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_type: SenderType,
    pub sender_id: Option<Uuid>,
    pub content: String,
    #[serde(default = "empty_extra")]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn whatsapp_message_id(&self) -> Option<&str> {
        self.metadata.get("whatsapp_message_id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub chat_id: Uuid,
    pub ticket_number: u64,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketActivity {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub kind: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
