//! System prompt assembly (spec §4.8 step 6).

use serde_json::{Map, Value};

/// Below this length, `custom_instructions` is treated as unset and a
/// default scaffold is used instead. Not specified by the spec; resolved as
/// an Open Question (see DESIGN.md) at a value that rejects a stray word or
/// two while accepting a real paragraph.
const MIN_CUSTOM_INSTRUCTIONS_LEN: usize = 20;

const DEFAULT_INSTRUCTIONS_SCAFFOLD: &str =
    "Be concise, accurate, and courteous. Ask a clarifying question when the request is ambiguous \
     rather than guessing.";

pub struct PromptInputs<'a> {
    pub persona_config: &'a Map<String, Value>,
    pub handoff_triggers: &'a [String],
    pub tool_names: &'a [String],
    pub rag_context: &'a str,
    pub user_sent_image: bool,
}

fn persona_str<'a>(persona: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    persona.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).unwrap_or(default)
}

/// Builds the single system message sent as the first entry of the LLM
/// request's `messages` (spec §4.8 step 7).
pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let name = persona_str(inputs.persona_config, "name", "Assistant");
    let tone = persona_str(inputs.persona_config, "tone", "friendly and professional");
    let language = persona_str(inputs.persona_config, "language", "the customer's language");

    let mut sections = vec![format!(
        "You are {name}, a customer service assistant. Respond in a {tone} tone. Always reply in {language}."
    )];

    let custom = inputs.persona_config.get("custom_instructions").and_then(Value::as_str).unwrap_or_default();
    if custom.trim().chars().count() >= MIN_CUSTOM_INSTRUCTIONS_LEN {
        sections.push(custom.trim().to_string());
    } else {
        sections.push(DEFAULT_INSTRUCTIONS_SCAFFOLD.to_string());
    }

    if !inputs.handoff_triggers.is_empty() {
        sections.push(format!(
            "If the customer's message contains any of these phrases, stop and recommend escalating to a human agent instead of answering yourself: {}.",
            inputs.handoff_triggers.join(", ")
        ));
    }

    if !inputs.tool_names.is_empty() {
        sections.push(format!("You may call the following tools when they would help: {}.", inputs.tool_names.join(", ")));
    }

    if !inputs.rag_context.trim().is_empty() {
        sections.push(format!("KNOWLEDGE BASE:\n{}", inputs.rag_context));
    }

    if inputs.user_sent_image {
        sections.push("The customer attached an image with this message.".to_string());
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(fields: &[(&str, &str)]) -> Map<String, Value> {
        fields.iter().map(|(k, v)| (k.to_string(), Value::String((*v).to_string()))).collect()
    }

    #[test]
    fn uses_default_scaffold_when_instructions_too_short() {
        let persona = persona(&[("custom_instructions", "be nice")]);
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &[],
            tool_names: &[],
            rag_context: "",
            user_sent_image: false,
        });
        assert!(prompt.contains(DEFAULT_INSTRUCTIONS_SCAFFOLD));
    }

    #[test]
    fn uses_custom_instructions_when_long_enough() {
        let persona = persona(&[("custom_instructions", "Always mention our 30-day return policy before closing.")]);
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &[],
            tool_names: &[],
            rag_context: "",
            user_sent_image: false,
        });
        assert!(prompt.contains("30-day return policy"));
        assert!(!prompt.contains(DEFAULT_INSTRUCTIONS_SCAFFOLD));
    }

    #[test]
    fn includes_knowledge_base_section_when_rag_context_present() {
        let persona = Map::new();
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &[],
            tool_names: &[],
            rag_context: "[Source: guide.md]\nhow to reset a password",
            user_sent_image: false,
        });
        assert!(prompt.contains("KNOWLEDGE BASE:"));
        assert!(prompt.contains("reset a password"));
    }

    #[test]
    fn omits_knowledge_base_section_when_empty() {
        let persona = Map::new();
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &[],
            tool_names: &[],
            rag_context: "",
            user_sent_image: false,
        });
        assert!(!prompt.contains("KNOWLEDGE BASE"));
    }

    #[test]
    fn flags_user_sent_image() {
        let persona = Map::new();
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &[],
            tool_names: &[],
            rag_context: "",
            user_sent_image: true,
        });
        assert!(prompt.contains("attached an image"));
    }

    #[test]
    fn includes_handoff_triggers_when_configured() {
        let persona = Map::new();
        let triggers = vec!["speak to a human".to_string(), "cancel my order".to_string()];
        let prompt = build_system_prompt(&PromptInputs {
            persona_config: &persona,
            handoff_triggers: &triggers,
            tool_names: &[],
            rag_context: "",
            user_sent_image: false,
        });
        assert!(prompt.contains("speak to a human"));
    }
}
