//! Inbound webhook ingestion (spec §6 "Inbound webhook payloads"): resolves
//! the owning agent/integration, routes the message through C6, and
//! enqueues it with the debounce orchestrator (C7).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use relay_router::RouteRequest;
use relay_store::{IntegrationChannel, IntegrationStatus};

use crate::error::{from_route, from_store, ApiError, Error};
use crate::state::AppState;

/// Inbound payload shape (spec §6). `recipient_address` is the agent's
/// outbound address for this channel (WA phone number, TG bot/session id,
/// the email mailbox) and is what ties the event to exactly one
/// `(tenant, agent, integration)` per the ownership invariant (spec §3).
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub channel: IntegrationChannel,
    pub recipient_address: String,
    pub contact: String,
    pub content: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub message_metadata: Map<String, Value>,
    #[serde(default)]
    pub customer_metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub is_new_chat: bool,
    pub was_reopened: bool,
    pub is_merged_event: bool,
}

pub async fn ingest_webhook(
    Path(tenant_id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let (integration, agent_id) = state
        .store
        .find_integration(tenant_id, payload.channel, &payload.recipient_address)
        .await
        .map_err(from_store)?
        .ok_or_else(|| Error::NotFound(format!("no integration owns recipient_address '{}'", payload.recipient_address)))?;

    if !integration.enabled || integration.status != IntegrationStatus::Connected {
        return Err(Error::IntegrationDisabled(format!("integration for agent {agent_id} is not usable")).into());
    }

    let agent = state.store.get_agent(agent_id).await.map_err(from_store)?;

    let req = RouteRequest {
        agent,
        channel: payload.channel,
        contact: payload.contact,
        content: payload.content,
        customer_name: payload.customer_name,
        message_metadata: payload.message_metadata,
        customer_metadata: payload.customer_metadata,
    };

    let outcome = state.router.route(req).await.map_err(from_route)?;

    let mut live_payload = Map::new();
    live_payload.insert("chat_id".into(), Value::String(outcome.chat_id.to_string()));
    live_payload.insert("message_id".into(), Value::String(outcome.message_id.to_string()));
    live_payload.insert("sender_type".into(), Value::String("customer".into()));
    state.ws_hub.broadcast_new_message(tenant_id, live_payload).await;

    if !outcome.is_merged_event {
        state
            .orchestrator
            .enqueue(outcome.chat_id, outcome.message_id, "normal")
            .await
            .map_err(crate::error::from_orchestrator)?;
    }

    Ok(Json(WebhookResponse {
        success: true,
        chat_id: outcome.chat_id,
        message_id: outcome.message_id,
        is_new_chat: outcome.is_new_chat,
        was_reopened: outcome.was_reopened,
        is_merged_event: outcome.is_merged_event,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_payload_deserializes_minimal_fields() {
        let raw = r#"{"channel":"whatsapp","recipient_address":"15550001111","contact":"15552223333","content":"hi"}"#;
        let payload: WebhookPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.channel, IntegrationChannel::Whatsapp);
        assert_eq!(payload.content, "hi");
        assert!(payload.customer_name.is_none());
    }
}
