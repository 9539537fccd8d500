//! The LLM tool-calling loop for the AI response pipeline (C8 step 8):
//! calls the configured LLM proxy (spec §6) with the assembled system
//! prompt and conversation, executes any `tool_calls` through the Tool
//! Executor (`relay-tools`), feeds results back as `role: "tool"`
//! messages, and repeats up to `max_turns` before returning the final
//! assistant text and accumulated token usage.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod context;
pub mod executor;
pub mod llm_client;
pub mod tool_spec;

pub use context::ToolContext;
pub use executor::{AgentExecutor, ExecutionError, ExecutionOutcome, ExecutionRequest};
pub use llm_client::{
    HttpLlmProxyClient, LlmChoice, LlmError, LlmFileRef, LlmMessage, LlmProxyClient, LlmRequest, LlmResponse,
    LlmResponseMessage, ResponseMetadata, TokenUsage, ToolCall, ToolCallFunction,
};
pub use tool_spec::ToolDefinition;
