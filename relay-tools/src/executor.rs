//! The Tool Executor contract (spec §6): `execute(tenant_id, agent_id,
//! tool_name, arguments) -> {status, output}`, dispatched to the MCP-style
//! server a namespaced tool name (`server__resource`) points at.
//!
//! Tool *implementations* live outside this system — per spec §1 they're
//! external collaborators (document ingestion, file managers, third-party
//! integrations). This crate only knows how to route a call to the server
//! that owns it and normalize the result; it never executes a capability
//! itself.

use crate::namespace;
use crate::traits::ToolResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Executes a namespaced tool call for `tenant_id`/`agent_id`. Never
    /// returns an `Err` for an ordinary tool failure — that's reported as
    /// `ToolResult::failure` so the pipeline's tool loop can feed it back
    /// to the model as a `role: "tool"` message (spec §4.8 step 8).
    async fn execute(&self, tenant_id: Uuid, agent_id: Uuid, tool_name: &str, arguments: serde_json::Value) -> ToolResult;

    /// Tool specs advertised to the LLM proxy's `tools` field, scoped to
    /// whatever servers are registered for `tenant_id`/`agent_id`.
    async fn list_specs(&self, tenant_id: Uuid, agent_id: Uuid) -> Vec<crate::traits::ToolSpec>;
}

/// One MCP-style tool server: a base URL this executor POSTs namespaced
/// tool calls to, and the specs it advertises.
#[derive(Debug, Clone)]
pub struct ToolServer {
    pub name: String,
    pub base_url: String,
    pub specs: Vec<crate::traits::ToolSpec>,
}

/// HTTP-backed [`ToolExecutor`]: routes `server__resource` calls to the
/// registered server's `{base_url}/tools/{resource}` endpoint. Grounded on
/// the webhook-POST idiom used throughout the channel dispatcher (C4) and
/// LLM proxy client — a plain `reqwest::Client` call with a JSON body, no
/// SDK.
pub struct HttpToolExecutor {
    client: reqwest::Client,
    servers: HashMap<String, ToolServer>,
}

impl HttpToolExecutor {
    pub fn new(servers: Vec<ToolServer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct ToolCallRequest<'a> {
    tenant_id: Uuid,
    agent_id: Uuid,
    resource: &'a str,
    arguments: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct ToolCallResponse {
    status: String,
    #[serde(default)]
    output: String,
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(&self, tenant_id: Uuid, agent_id: Uuid, tool_name: &str, arguments: serde_json::Value) -> ToolResult {
        let Some((server_name, resource)) = namespace::split(tool_name) else {
            return ToolResult::failure(format!("tool name '{tool_name}' is not namespaced as server__resource"));
        };
        let Some(server) = self.servers.get(server_name) else {
            return ToolResult::failure(format!("no tool server registered for '{server_name}'"));
        };

        let url = format!("{}/tools/{}", server.base_url.trim_end_matches('/'), resource);
        let body = ToolCallRequest { tenant_id, agent_id, resource, arguments };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(format!("tool server '{server_name}' unreachable: {e}")),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return ToolResult::failure(format!("tool server '{server_name}' returned {status}: {text}"));
        }

        match response.json::<ToolCallResponse>().await {
            Ok(parsed) if parsed.status == "ok" => ToolResult::success(parsed.output),
            Ok(parsed) => ToolResult::failure_with_output(parsed.output, format!("tool reported status '{}'", parsed.status)),
            Err(e) => ToolResult::failure(format!("malformed response from tool server '{server_name}': {e}")),
        }
    }

    async fn list_specs(&self, _tenant_id: Uuid, _agent_id: Uuid) -> Vec<crate::traits::ToolSpec> {
        self.servers.values().flat_map(|s| s.specs.clone()).collect()
    }
}

/// Degrade path when no tool servers are configured for a tenant: every
/// call fails cleanly and no tools are advertised, so the pipeline's
/// system prompt (spec §4.8 step 6) simply omits a tool list.
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn execute(&self, _tenant_id: Uuid, _agent_id: Uuid, tool_name: &str, _arguments: serde_json::Value) -> ToolResult {
        ToolResult::failure(format!("no tool executor configured; cannot run '{tool_name}'"))
    }

    async fn list_specs(&self, _tenant_id: Uuid, _agent_id: Uuid) -> Vec<crate::traits::ToolSpec> {
        Vec::new()
    }
}

/// Fans a call out by tenant to a per-tenant [`ToolExecutor`], falling back
/// to [`NoopToolExecutor`] for tenants with none registered.
pub struct TenantScopedExecutor {
    by_tenant: HashMap<Uuid, Arc<dyn ToolExecutor>>,
    fallback: Arc<dyn ToolExecutor>,
}

impl TenantScopedExecutor {
    pub fn new() -> Self {
        Self { by_tenant: HashMap::new(), fallback: Arc::new(NoopToolExecutor) }
    }

    pub fn register(&mut self, tenant_id: Uuid, executor: Arc<dyn ToolExecutor>) {
        self.by_tenant.insert(tenant_id, executor);
    }

    fn resolve(&self, tenant_id: Uuid) -> Arc<dyn ToolExecutor> {
        self.by_tenant.get(&tenant_id).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for TenantScopedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for TenantScopedExecutor {
    async fn execute(&self, tenant_id: Uuid, agent_id: Uuid, tool_name: &str, arguments: serde_json::Value) -> ToolResult {
        self.resolve(tenant_id).execute(tenant_id, agent_id, tool_name, arguments).await
    }

    async fn list_specs(&self, tenant_id: Uuid, agent_id: Uuid) -> Vec<crate::traits::ToolSpec> {
        self.resolve(tenant_id).list_specs(tenant_id, agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_executor_fails_every_call() {
        let exec = NoopToolExecutor;
        let result = exec.execute(Uuid::new_v4(), Uuid::new_v4(), "crm__lookup_order", serde_json::json!({})).await;
        assert!(!result.success);
        assert!(exec.list_specs(Uuid::new_v4(), Uuid::new_v4()).await.is_empty());
    }

    #[tokio::test]
    async fn http_executor_rejects_unnamespaced_tool() {
        let exec = HttpToolExecutor::new(vec![]);
        let result = exec.execute(Uuid::new_v4(), Uuid::new_v4(), "lookup_order", serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not namespaced"));
    }

    #[tokio::test]
    async fn http_executor_rejects_unknown_server() {
        let exec = HttpToolExecutor::new(vec![]);
        let result = exec.execute(Uuid::new_v4(), Uuid::new_v4(), "crm__lookup_order", serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no tool server"));
    }

    #[tokio::test]
    async fn tenant_scoped_executor_falls_back_to_noop() {
        let scoped = TenantScopedExecutor::new();
        let result = scoped.execute(Uuid::new_v4(), Uuid::new_v4(), "crm__lookup_order", serde_json::json!({})).await;
        assert!(!result.success);
    }
}
