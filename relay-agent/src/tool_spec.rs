//! Converts [`relay_tools::ToolSpec`] into the OpenAI-style `tools` shape
//! the LLM proxy request expects (spec §6: `tools?`).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub def_type: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl From<relay_tools::ToolSpec> for ToolDefinition {
    fn from(spec: relay_tools::ToolSpec) -> Self {
        Self {
            def_type: "function".into(),
            function: ToolFunctionDefinition { name: spec.name, description: spec.description, parameters: spec.parameters },
        }
    }
}
