//! Identity context carried into a tool loop run: which tenant/agent a
//! tool call executes on behalf of.

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
}

impl ToolContext {
    pub fn new(tenant_id: Uuid, agent_id: Uuid) -> Self {
        Self { tenant_id, agent_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_context_creation() {
        let tenant_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let ctx = ToolContext::new(tenant_id, agent_id);
        assert_eq!(ctx.tenant_id, tenant_id);
        assert_eq!(ctx.agent_id, agent_id);
    }
}
