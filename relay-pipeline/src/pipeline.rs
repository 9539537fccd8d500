//! The AI response pipeline (C8) and its Ticket Guard integration (C9):
//! `PipelineProcessor::process` is what a debounce worker (C7) calls once a
//! chat's quiescence window elapses (spec §4.8-§4.9).

use crate::alert_cooldown::AlertCooldown;
use crate::error::{from_execution, from_knowledge, from_store, Error, Result};
use crate::prompt::{build_system_prompt, PromptInputs};
use crate::sanitize::sanitize_markdown;
use crate::ticket_guard::{self, TicketGuardConfig};
use crate::{credits, vision};
use async_trait::async_trait;
use relay_agent::{AgentExecutor, ExecutionRequest, LlmMessage, LlmProxyClient};
use relay_channels::{ChannelDispatcher, ChannelType};
use relay_knowledge::{format_context, KnowledgeIndex, DEFAULT_K};
use relay_store::{Chat, Customer, HandledBy, IntegrationChannel, SenderType, StateStore, Temperature};
use relay_tools::ToolExecutor;
use relay_ws::WebSocketHub;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Sent once per cooldown window when the pipeline fails on an upstream
/// error (spec §4.8 "Failure and rate-limit").
const CANNED_APOLOGY: &str = "Sorry, I'm having trouble responding right now. A member of our team will follow up shortly.";

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl PipelineOutcome {
    pub fn ok() -> Self {
        Self { success: true, reason: None }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self { success: false, reason: Some(reason.into()) }
    }
}

#[async_trait]
pub trait PipelineProcessor: Send + Sync {
    async fn process(&self, chat_id: Uuid, latest_msg_id: Uuid, priority: &str) -> PipelineOutcome;
}

/// Tunable knobs the composition root assembles from `AppConfig` (spec §5);
/// `priority` (the debounce worker's queue priority) isn't consumed here -
/// resolved as an Open Question, it has no documented effect on C8's own
/// steps and is only logged for observability.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_images: usize,
    pub tool_loop_max_turns: u32,
    pub credit_rate_per_token: f64,
    pub alert_cooldown: Duration,
    pub retrieval_k: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_images: 3,
            tool_loop_max_turns: 8,
            credit_rate_per_token: 0.000_002,
            alert_cooldown: Duration::from_secs(60),
            retrieval_k: DEFAULT_K,
        }
    }
}

pub struct AiResponsePipeline {
    store: Arc<dyn StateStore>,
    knowledge: Arc<dyn KnowledgeIndex>,
    llm: Arc<dyn LlmProxyClient>,
    tools: Arc<dyn ToolExecutor>,
    dispatcher: Arc<ChannelDispatcher>,
    ws_hub: Arc<WebSocketHub>,
    ticket_guard_config: TicketGuardConfig,
    alert_cooldown: AlertCooldown,
    settings: PipelineSettings,
}

impl AiResponsePipeline {
    pub fn new(
        store: Arc<dyn StateStore>,
        knowledge: Arc<dyn KnowledgeIndex>,
        llm: Arc<dyn LlmProxyClient>,
        tools: Arc<dyn ToolExecutor>,
        dispatcher: Arc<ChannelDispatcher>,
        ws_hub: Arc<WebSocketHub>,
        settings: PipelineSettings,
    ) -> Self {
        let alert_cooldown = AlertCooldown::new(settings.alert_cooldown);
        Self {
            store,
            knowledge,
            llm,
            tools,
            dispatcher,
            ws_hub,
            ticket_guard_config: TicketGuardConfig::default(),
            alert_cooldown,
            settings,
        }
    }

    async fn process_inner(&self, chat_id: Uuid, latest_msg_id: Uuid) -> Result<()> {
        let chat = self.store.get_chat(chat_id).await.map_err(from_store)?;
        if !chat.is_active() || chat.handled_by != HandledBy::Ai {
            return Ok(());
        }
        let triggering = self.store.get_message(latest_msg_id).await.map_err(from_store)?;
        let agent_id = chat.ai_agent_id.unwrap_or(chat.sender_agent_id);
        let agent_settings = self.store.get_agent_settings(agent_id).await.map_err(from_store)?;
        let customer = self.store.get_customer(chat.customer_id).await.map_err(from_store)?;

        let history_limit = agent_settings.advanced_config.history_limit.max(1);
        let mut history =
            self.store.fetch_history(chat_id, Some(latest_msg_id), history_limit * 2).await.map_err(from_store)?;
        history.truncate(history_limit);

        // C9: evaluate before doing any retrieval/LLM work, so a trivial
        // greeting or spam message never pays for a full RAG+tool-loop turn.
        let message_count = history.len() as u32 + 1;
        let ticket_eval = ticket_guard::evaluate(
            self.llm.as_ref(),
            chat.tenant_id,
            &self.ticket_guard_config,
            &triggering.content,
            &customer.name,
            message_count,
        )
        .await;

        if ticket_eval.should_create_ticket && self.store.find_open_ticket(chat.id).await.map_err(from_store)?.is_none() {
            let ticket = self
                .store
                .create_ticket(chat.tenant_id, chat.id, ticket_eval.suggested_priority, &ticket_eval.suggested_category)
                .await
                .map_err(from_store)?;
            self.store.append_ticket_activity(ticket.id, "opened", Some(ticket_eval.reason.as_str())).await.map_err(from_store)?;

            let mut payload = Map::new();
            payload.insert("ticket_id".into(), Value::String(ticket.id.to_string()));
            payload.insert("chat_id".into(), Value::String(chat.id.to_string()));
            payload.insert("priority".into(), Value::String(format!("{:?}", ticket.priority).to_lowercase()));
            self.ws_hub.broadcast_chat_update(chat.tenant_id, "ticket_created", payload).await;
        }

        // A guard-supplied canned reply (fast-path greeting, or a smart-guard
        // classifier that chose to hand one back) answers the customer
        // without spending a full LLM turn.
        if !ticket_eval.auto_reply_hint.is_empty() {
            self.deliver_reply(&chat, Some(agent_id), &ticket_eval.auto_reply_hint).await?;
            return Ok(());
        }

        let image_urls = vision::collect_images(&triggering.metadata, &history, self.settings.max_images);
        let vision_text = if image_urls.is_empty() {
            String::new()
        } else {
            vision::intercept_vision(self.llm.as_ref(), chat.tenant_id, &image_urls).await
        };

        let rag_query =
            if vision_text.trim().is_empty() { triggering.content.clone() } else { format!("{}\n{}", triggering.content, vision_text) };
        let chunks = self.knowledge.retrieve(chat.tenant_id, &rag_query, self.settings.retrieval_k).await.map_err(from_knowledge)?;
        let rag_context = format_context(&chunks);

        let tool_specs = self.tools.list_specs(chat.tenant_id, agent_id).await;
        let tool_names: Vec<String> = tool_specs.iter().map(|s| s.name.clone()).collect();
        let system_prompt = build_system_prompt(&PromptInputs {
            persona_config: &agent_settings.persona_config,
            handoff_triggers: &agent_settings.advanced_config.handoff_triggers,
            tool_names: &tool_names,
            rag_context: &rag_context,
            user_sent_image: !image_urls.is_empty(),
        });

        let mut messages = vec![LlmMessage::system(system_prompt)];
        for entry in &history {
            messages.push(history_message(entry.sender_type, &entry.content));
        }
        messages.push(LlmMessage::user_multimodal(triggering.content.clone(), &image_urls));

        let temperature = match agent_settings.advanced_config.temperature {
            Some(Temperature::Consistent) => 0.3,
            Some(Temperature::Creative) => 1.0,
            Some(Temperature::Balanced) | None => 0.7,
        };

        let executor = AgentExecutor::new(self.llm.clone(), self.tools.clone());
        let exec_request = ExecutionRequest {
            tenant_id: chat.tenant_id,
            agent_id,
            category: "support".into(),
            name_user: customer.name.clone(),
            temperature,
            max_turns: self.settings.tool_loop_max_turns,
        };
        let outcome = executor.run(&exec_request, messages).await.map_err(from_execution)?;
        if outcome.is_error {
            return Err(Error::TransientUpstream("llm proxy returned an error response".into()));
        }

        self.deliver_reply(&chat, Some(agent_id), &outcome.content).await?;

        let cost = credits::compute_cost(outcome.total_tokens, self.settings.credit_rate_per_token);
        self.store.record_credit_usage(chat.tenant_id, chat.id, outcome.total_tokens, cost).await.map_err(from_store)?;

        Ok(())
    }

    /// Persists, dispatches to the chat's channel, and broadcasts over the
    /// WebSocket hub (spec §4.8 steps 9-10). An integration that's missing
    /// or disabled, or a channel with no outbound leg (`Mcp`), falls back to
    /// WebSocket-only delivery rather than failing the whole turn.
    async fn deliver_reply(&self, chat: &Chat, sender_id: Option<Uuid>, content: &str) -> Result<()> {
        let sanitized = sanitize_markdown(content);
        let message_id = self.store.append_agent_message(chat, &sanitized, sender_id, Map::new()).await.map_err(from_store)?;

        if let Some(channel_type) = channel_type_for(chat.channel) {
            let integration = self.store.get_integration(chat.sender_agent_id, chat.channel).await.map_err(from_store)?;
            if let Some(integration) = integration.filter(|i| i.enabled) {
                let customer = self.store.get_customer(chat.customer_id).await.map_err(from_store)?;
                let recipient = recipient_address(chat.channel, &customer);
                let result = self
                    .dispatcher
                    .dispatch(channel_type, chat.sender_agent_id, &integration.config, &recipient, &sanitized, None, None)
                    .await;
                if !result.success {
                    let mut patch = Map::new();
                    patch.insert("delivery_failed".into(), Value::Bool(true));
                    if let Some(reason) = result.reason {
                        patch.insert("delivery_failure_reason".into(), Value::String(reason));
                    }
                    let _ = self.store.patch_message_metadata(message_id, patch).await;
                }
            }
        }

        let mut payload = Map::new();
        payload.insert("chat_id".into(), Value::String(chat.id.to_string()));
        payload.insert("message_id".into(), Value::String(message_id.to_string()));
        payload.insert("content".into(), Value::String(sanitized));
        self.ws_hub.broadcast_new_message(chat.tenant_id, payload).await;
        self.store.touch_last_message_at(chat.id).await.map_err(from_store)?;
        Ok(())
    }

    /// Spec §4.8 "Failure and rate-limit": a `NotFound`/`Validation`/
    /// `IntegrationDisabled`/`LockTimeout` error means there was nothing
    /// valid to respond to and is logged only. Anything else (an upstream
    /// LLM failure) gets one apology per cooldown window per chat.
    async fn handle_failure(&self, chat_id: Uuid, error: &Error) {
        if error.is_expected() {
            return;
        }
        if !self.alert_cooldown.try_acquire(chat_id) {
            return;
        }
        let Ok(chat) = self.store.get_chat(chat_id).await else {
            return;
        };
        let _ = self.deliver_reply(&chat, None, CANNED_APOLOGY).await;
    }
}

#[async_trait]
impl PipelineProcessor for AiResponsePipeline {
    async fn process(&self, chat_id: Uuid, latest_msg_id: Uuid, priority: &str) -> PipelineOutcome {
        tracing::debug!(%chat_id, %latest_msg_id, priority, "ai response pipeline triggered");
        match self.process_inner(chat_id, latest_msg_id).await {
            Ok(()) => PipelineOutcome::ok(),
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "ai response pipeline failed");
                self.handle_failure(chat_id, &e).await;
                PipelineOutcome::failure(e.to_string())
            }
        }
    }
}

fn history_message(sender_type: SenderType, content: &str) -> LlmMessage {
    match sender_type {
        SenderType::Customer => LlmMessage::user_text(content),
        SenderType::Ai | SenderType::Human => LlmMessage::assistant_text(content),
        SenderType::System => LlmMessage::system(content),
    }
}

/// `Mcp` has no outbound leg of its own, same as `ChannelType::Web` on the
/// dispatcher side - both fall back to WebSocket-only delivery.
fn channel_type_for(channel: IntegrationChannel) -> Option<ChannelType> {
    match channel {
        IntegrationChannel::Whatsapp => Some(ChannelType::WhatsApp),
        IntegrationChannel::Telegram => Some(ChannelType::Telegram),
        IntegrationChannel::Email => Some(ChannelType::Email),
        IntegrationChannel::Mcp => None,
    }
}

fn recipient_address(channel: IntegrationChannel, customer: &Customer) -> String {
    match channel {
        IntegrationChannel::Whatsapp => customer.phone.clone().unwrap_or_default(),
        IntegrationChannel::Telegram => {
            customer.metadata.get("telegram_id").and_then(Value::as_str).unwrap_or_default().to_string()
        }
        IntegrationChannel::Email => customer.email.clone().unwrap_or_default(),
        IntegrationChannel::Mcp => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agent::{LlmChoice, LlmError, LlmRequest, LlmResponse, LlmResponseMessage, ResponseMetadata, TokenUsage};
    use relay_knowledge::InMemoryKnowledgeIndex;
    use relay_store::{Agent, AgentSettings, AgentStatus, ChatStatus, AdvancedConfig, InMemoryStateStore};
    use relay_tools::NoopToolExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedLlm {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProxyClient for ScriptedLlm {
        async fn complete(&self, _request: LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                choices: vec![LlmChoice {
                    message: LlmResponseMessage { content: Some(self.reply.clone()), tool_calls: None },
                }],
                usage: TokenUsage { total_tokens: 42 },
                metadata: ResponseMetadata { is_error: false },
            })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmProxyClient for FailingLlm {
        async fn complete(&self, _request: LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
            Err(LlmError::Upstream { status: 503, body: "boom".into() })
        }
    }

    async fn seed_chat(store: &InMemoryStateStore) -> (Uuid, Uuid) {
        let tenant_id = Uuid::new_v4();
        let agent = Agent { id: Uuid::new_v4(), tenant_id, user_id: None, status: AgentStatus::Active };
        let customer = store
            .upsert_customer(tenant_id, IntegrationChannel::Email, "jane@example.com", Some("Jane"), None)
            .await
            .unwrap();
        let chat = store.create_chat(tenant_id, &agent, customer.id, IntegrationChannel::Email).await.unwrap();
        let message_id = store
            .insert_or_merge_customer_message(&chat, "I need help resetting my password please", Map::new())
            .await
            .unwrap()
            .message_id;
        (chat.id, message_id)
    }

    fn pipeline(llm: Arc<dyn LlmProxyClient>, store: Arc<InMemoryStateStore>) -> AiResponsePipeline {
        AiResponsePipeline::new(
            store,
            Arc::new(InMemoryKnowledgeIndex::default()),
            llm,
            Arc::new(NoopToolExecutor),
            Arc::new(ChannelDispatcher::new()),
            Arc::new(WebSocketHub::new()),
            PipelineSettings::default(),
        )
    }

    #[tokio::test]
    async fn successful_turn_persists_reply_and_records_credit_usage() {
        let store = Arc::new(InMemoryStateStore::default());
        let (chat_id, message_id) = seed_chat(&store).await;

        let llm = Arc::new(ScriptedLlm { reply: "Here's how to reset your password.".into(), calls: AtomicUsize::new(0) });
        let pipeline = pipeline(llm, store.clone());

        let outcome = pipeline.process(chat_id, message_id, "normal").await;
        assert!(outcome.success, "{:?}", outcome.reason);
        assert_eq!(store.credit_transaction_count(), 1);
    }

    #[tokio::test]
    async fn llm_failure_sends_one_apology_per_cooldown_window() {
        let store = Arc::new(InMemoryStateStore::default());
        let (chat_id, message_id) = seed_chat(&store).await;

        let pipeline = pipeline(Arc::new(FailingLlm), store.clone());

        let first = pipeline.process(chat_id, message_id, "normal").await;
        assert!(!first.success);
        let second = pipeline.process(chat_id, message_id, "normal").await;
        assert!(!second.success);

        let history = store.fetch_history(chat_id, None, 50).await.unwrap();
        let apologies = history.iter().filter(|m| m.content.contains("having trouble responding")).count();
        assert_eq!(apologies, 1, "second failure within the cooldown window must not send a second apology");
    }

    #[tokio::test]
    async fn inactive_chat_is_a_silent_no_op() {
        let store = Arc::new(InMemoryStateStore::default());
        let (chat_id, message_id) = seed_chat(&store).await;
        store.update_chat_status(chat_id, ChatStatus::Closed, None).await.unwrap();

        let llm = Arc::new(ScriptedLlm { reply: "should not be sent".into(), calls: AtomicUsize::new(0) });
        let pipeline = pipeline(llm.clone(), store);

        let outcome = pipeline.process(chat_id, message_id, "normal").await;
        assert!(outcome.success);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn channel_type_mapping_has_no_outbound_leg_for_mcp() {
        assert!(channel_type_for(IntegrationChannel::Mcp).is_none());
        assert_eq!(channel_type_for(IntegrationChannel::Whatsapp), Some(ChannelType::WhatsApp));
    }

    /// Records the message count of the main conversation turn (identified
    /// by `category == "support"`, as opposed to the ticket guard's
    /// `"ticket_classification"` call) so the history back-fill fix can be
    /// asserted on without a real LLM.
    struct CapturingLlm {
        main_turn_message_count: std::sync::Mutex<Option<usize>>,
    }

    #[async_trait]
    impl LlmProxyClient for CapturingLlm {
        async fn complete(&self, request: LlmRequest) -> std::result::Result<LlmResponse, LlmError> {
            if request.category == "ticket_classification" {
                return Ok(LlmResponse {
                    choices: vec![LlmChoice {
                        message: LlmResponseMessage { content: Some(r#"{"should_create_ticket": false}"#.into()), tool_calls: None },
                    }],
                    usage: TokenUsage { total_tokens: 1 },
                    metadata: ResponseMetadata { is_error: false },
                });
            }
            *self.main_turn_message_count.lock().unwrap() = Some(request.messages.len());
            Ok(LlmResponse {
                choices: vec![LlmChoice {
                    message: LlmResponseMessage { content: Some("got it, looking into that now".into()), tool_calls: None },
                }],
                usage: TokenUsage { total_tokens: 10 },
                metadata: ResponseMetadata { is_error: false },
            })
        }
    }

    /// Spec §4.8 step 2: history is fetched over a `2 * history_limit`
    /// candidate window and capped at `history_limit` afterward, so
    /// consecutive-duplicate collapse doesn't leave the final window
    /// thinner than `history_limit` when older, distinct turns could have
    /// back-filled it.
    #[tokio::test]
    async fn history_window_backfills_past_consecutive_duplicates() {
        let store = Arc::new(InMemoryStateStore::default());
        let tenant_id = Uuid::new_v4();
        let agent = Agent { id: Uuid::new_v4(), tenant_id, user_id: None, status: AgentStatus::Active };
        store.seed_agent_settings(AgentSettings {
            agent_id: agent.id,
            persona_config: Map::new(),
            advanced_config: AdvancedConfig { history_limit: 2, ..AdvancedConfig::default() },
            schedule_config: Default::default(),
        });
        let customer =
            store.upsert_customer(tenant_id, IntegrationChannel::Email, "jane@example.com", Some("Jane"), None).await.unwrap();
        let chat = store.create_chat(tenant_id, &agent, customer.id, IntegrationChannel::Email).await.unwrap();

        // Chronologically: "bar", then two consecutive "foo"s, then the
        // triggering message. A naive `limit = history_limit` fetch only
        // sees the newest two ("foo", "foo"), which collapse to one entry;
        // the `2 * history_limit` window reaches back to "bar" too.
        store.insert_or_merge_customer_message(&chat, "bar", Map::new()).await.unwrap();
        store.insert_or_merge_customer_message(&chat, "foo", Map::new()).await.unwrap();
        store.insert_or_merge_customer_message(&chat, "foo", Map::new()).await.unwrap();
        let message_id =
            store.insert_or_merge_customer_message(&chat, "my account is locked", Map::new()).await.unwrap().message_id;

        let llm = Arc::new(CapturingLlm { main_turn_message_count: std::sync::Mutex::new(None) });
        let pipeline = pipeline(llm.clone(), store);

        let outcome = pipeline.process(chat.id, message_id, "normal").await;
        assert!(outcome.success, "{:?}", outcome.reason);

        // system prompt + 2 history turns ("bar", "foo") + the triggering
        // user turn == 4. The pre-fix call would have produced 3.
        assert_eq!(llm.main_turn_message_count.lock().unwrap().unwrap(), 4);
    }
}
