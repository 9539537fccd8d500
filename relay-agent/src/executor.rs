//! The LLM tool-calling loop (spec §4.8 step 8): up to `max_turns` rounds
//! of "call the proxy, execute any tool calls, feed results back" before
//! the final assistant text is accumulated and returned.

use crate::llm_client::{LlmError, LlmMessage, LlmProxyClient, LlmRequest, ToolCall};
use crate::tool_spec::ToolDefinition;
use relay_tools::ToolExecutor;
use std::sync::Arc;
use uuid::Uuid;

/// Everything the loop needs beyond the running message list: identity for
/// tool dispatch and the request fields the proxy expects verbatim.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub category: String,
    pub name_user: String,
    pub temperature: f64,
    pub max_turns: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub content: String,
    pub total_tokens: u64,
    pub is_error: bool,
    pub turns_used: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("tool loop exceeded max_turns ({0}) without a final answer")]
    MaxTurnsExceeded(u32),
}

pub struct AgentExecutor {
    llm: Arc<dyn LlmProxyClient>,
    tools: Arc<dyn ToolExecutor>,
}

impl AgentExecutor {
    pub fn new(llm: Arc<dyn LlmProxyClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self { llm, tools }
    }

    /// Runs the bounded tool loop starting from `messages` (system +
    /// history + current user turn, already assembled by the caller per
    /// spec §4.8 steps 6-7). Returns the final assistant text and
    /// accumulated usage, or an error if the proxy call itself failed —
    /// the caller (the pipeline) maps that to the canned apology per §4.8
    /// "Failure and rate-limit", never retrying the call itself.
    pub async fn run(&self, request: &ExecutionRequest, mut messages: Vec<LlmMessage>) -> Result<ExecutionOutcome, ExecutionError> {
        let tool_defs = self.tool_definitions(request.tenant_id, request.agent_id).await;
        let mut total_tokens = 0u64;

        for turn in 1..=request.max_turns {
            let llm_request = LlmRequest {
                messages: messages.clone(),
                files: Vec::new(),
                category: request.category.clone(),
                name_user: request.name_user.clone(),
                temperature: request.temperature,
                tenant_id: request.tenant_id,
                tools: if tool_defs.is_empty() { None } else { Some(tool_defs.clone()) },
                tool_choice: if tool_defs.is_empty() { None } else { Some("auto".into()) },
            };

            let response = self.llm.complete(llm_request).await?;
            total_tokens += response.usage.total_tokens;

            let Some(choice) = response.choices.into_iter().next() else {
                return Ok(ExecutionOutcome { content: String::new(), total_tokens, is_error: true, turns_used: turn });
            };

            if let Some(tool_calls) = choice.message.tool_calls.filter(|c| !c.is_empty()) {
                messages.push(LlmMessage::assistant_tool_calls(tool_calls.clone()));
                for call in &tool_calls {
                    let output = self.execute_one(request.tenant_id, request.agent_id, call).await;
                    messages.push(LlmMessage::tool_result(call.id.clone(), output));
                }
                continue;
            }

            let content = choice.message.content.unwrap_or_default();
            return Ok(ExecutionOutcome { content, total_tokens, is_error: response.metadata.is_error, turns_used: turn });
        }

        Err(ExecutionError::MaxTurnsExceeded(request.max_turns))
    }

    async fn execute_one(&self, tenant_id: Uuid, agent_id: Uuid, call: &ToolCall) -> String {
        let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
        let result = self.tools.execute(tenant_id, agent_id, &call.function.name, arguments).await;
        if result.success {
            result.output
        } else {
            format!("error: {}", result.error.unwrap_or_else(|| "tool call failed".into()))
        }
    }

    async fn tool_definitions(&self, tenant_id: Uuid, agent_id: Uuid) -> Vec<ToolDefinition> {
        self.tools.list_specs(tenant_id, agent_id).await.into_iter().map(ToolDefinition::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{LlmChoice, LlmResponse, LlmResponseMessage, ResponseMetadata, TokenUsage, ToolCallFunction};
    use async_trait::async_trait;
    use relay_tools::{NoopToolExecutor, ToolResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<LlmResponse>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProxyClient for ScriptedLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses.lock().await.remove(0))
        }
    }

    fn text_response(text: &str, tokens: u64) -> LlmResponse {
        LlmResponse {
            choices: vec![LlmChoice { message: LlmResponseMessage { content: Some(text.into()), tool_calls: None } }],
            usage: TokenUsage { total_tokens: tokens },
            metadata: ResponseMetadata { is_error: false },
        }
    }

    fn tool_call_response(name: &str, args: &str) -> LlmResponse {
        LlmResponse {
            choices: vec![LlmChoice {
                message: LlmResponseMessage {
                    content: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".into(),
                        call_type: "function".into(),
                        function: ToolCallFunction { name: name.into(), arguments: args.into() },
                    }]),
                },
            }],
            usage: TokenUsage { total_tokens: 5 },
            metadata: ResponseMetadata { is_error: false },
        }
    }

    #[tokio::test]
    async fn stops_at_first_turn_with_no_tool_calls() {
        let llm = Arc::new(ScriptedLlm { responses: Mutex::new(vec![text_response("hello", 10)]), calls: AtomicUsize::new(0) });
        let executor = AgentExecutor::new(llm, Arc::new(NoopToolExecutor));
        let req = ExecutionRequest {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            category: "support".into(),
            name_user: "Ada".into(),
            temperature: 0.7,
            max_turns: 5,
        };
        let outcome = executor.run(&req, vec![LlmMessage::user_text("hi")]).await.unwrap();
        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.total_tokens, 10);
        assert_eq!(outcome.turns_used, 1);
    }

    struct EchoTools;

    #[async_trait]
    impl ToolExecutor for EchoTools {
        async fn execute(&self, _t: Uuid, _a: Uuid, tool_name: &str, _args: serde_json::Value) -> ToolResult {
            ToolResult::success(format!("ran {tool_name}"))
        }
        async fn list_specs(&self, _t: Uuid, _a: Uuid) -> Vec<relay_tools::ToolSpec> {
            vec![relay_tools::ToolSpec { name: "crm__lookup".into(), description: "d".into(), parameters: serde_json::json!({}) }]
        }
    }

    #[tokio::test]
    async fn executes_tool_call_then_returns_final_answer() {
        let responses = vec![tool_call_response("crm__lookup", "{}"), text_response("done", 3)];
        let llm = Arc::new(ScriptedLlm { responses: Mutex::new(responses), calls: AtomicUsize::new(0) });
        let executor = AgentExecutor::new(llm, Arc::new(EchoTools));
        let req = ExecutionRequest {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            category: "support".into(),
            name_user: "Ada".into(),
            temperature: 0.3,
            max_turns: 5,
        };
        let outcome = executor.run(&req, vec![LlmMessage::user_text("hi")]).await.unwrap();
        assert_eq!(outcome.content, "done");
        assert_eq!(outcome.turns_used, 2);
    }

    #[tokio::test]
    async fn max_turns_exceeded_is_an_error() {
        let responses = vec![tool_call_response("crm__lookup", "{}"); 5];
        let llm = Arc::new(ScriptedLlm { responses: Mutex::new(responses), calls: AtomicUsize::new(0) });
        let executor = AgentExecutor::new(llm, Arc::new(EchoTools));
        let req = ExecutionRequest {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            category: "support".into(),
            name_user: "Ada".into(),
            temperature: 0.3,
            max_turns: 5,
        };
        let result = executor.run(&req, vec![LlmMessage::user_text("hi")]).await;
        assert!(matches!(result, Err(ExecutionError::MaxTurnsExceeded(5))));
    }
}
