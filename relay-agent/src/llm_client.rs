//! The LLM proxy client (spec §6 "LLM proxy"): the single HTTP endpoint
//! the AI response pipeline's tool loop (C8 step 8) calls.
//!
//! Grounded on the teacher's `reqwest`-based provider-HTTP idiom (see the
//! retired `relay-pipeline::provider` multi-provider registry this
//! replaces): a plain JSON POST, no SDK, mapped onto this system's single
//! configured proxy endpoint rather than a per-vendor API. The
//! multi-provider abstraction the teacher carried doesn't fit — the spec
//! names one endpoint with one OpenAI-compatible wire shape, not a set of
//! vendor backends to choose between.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One message in the conversation sent to the proxy. `content` is a
/// `serde_json::Value` rather than a plain string because spec §4.8 step 7
/// requires the current user turn to be multimodal (`text + image_url[]`)
/// when the inbound message carried images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: "system".into(), content: serde_json::Value::String(text.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: "user".into(), content: serde_json::Value::String(text.into()), tool_calls: None, tool_call_id: None }
    }

    /// A multimodal user turn: text plus zero or more image URLs, per spec
    /// §4.8 step 7.
    pub fn user_multimodal(text: impl Into<String>, image_urls: &[String]) -> Self {
        if image_urls.is_empty() {
            return Self::user_text(text);
        }
        let mut parts = vec![serde_json::json!({"type": "text", "text": text.into()})];
        parts.extend(image_urls.iter().map(|url| serde_json::json!({"type": "image_url", "image_url": {"url": url}})));
        Self { role: "user".into(), content: serde_json::Value::Array(parts), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: serde_json::Value::String(text.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: "assistant".into(), content: serde_json::Value::Null, tool_calls: Some(tool_calls), tool_call_id: None }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: serde_json::Value::String(output.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Plain-text view of `content`, used for history/context-building
    /// where a multimodal turn is flattened back to its text part.
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .find_map(|p| p.get("text").and_then(|t| t.as_str()))
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded arguments, OpenAI-style (a string, not a nested object).
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFileRef {
    #[serde(rename = "type")]
    pub file_type: String,
    pub url: String,
}

/// Request body for the spec §6 LLM proxy endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub messages: Vec<LlmMessage>,
    #[serde(default)]
    pub files: Vec<LlmFileRef>,
    pub category: String,
    pub name_user: String,
    pub temperature: f64,
    pub tenant_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<crate::tool_spec::ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<LlmChoice>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmChoice {
    pub message: LlmResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm proxy request failed: {0}")]
    Request(String),
    #[error("llm proxy timed out")]
    Timeout,
    #[error("llm proxy returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

/// Spec §5: HTTP calls to the LLM proxy use a total timeout (default 300s);
/// connection errors map to a canned failure, and the pipeline must not
/// retry the call itself.
#[async_trait]
pub trait LlmProxyClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

pub struct HttpLlmProxyClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLlmProxyClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LlmProxyClient for HttpLlmProxyClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let response = self.client.post(&self.endpoint).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream { status: status.as_u16(), body });
        }

        response.json::<LlmResponse>().await.map_err(|e| LlmError::Request(e.to_string()))
    }
}
