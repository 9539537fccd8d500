//! Ticket Guard (C9): decides whether an inbound message should open a
//! support ticket, via a fast keyword guard and a fallback LLM classifier
//! (spec §4.9).

use relay_agent::{LlmMessage, LlmProxyClient, LlmRequest};
use relay_store::TicketPriority;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct TicketEvaluation {
    pub should_create_ticket: bool,
    pub reason: String,
    pub suggested_priority: TicketPriority,
    pub suggested_category: String,
    pub auto_reply_hint: String,
}

const FAST_GUARD_REPLY_HINT: &str = "Thanks for reaching out! A member of our team will be with you shortly.";

/// Keyword sets driving both guard layers. The spec names these as
/// "configured" without specifying an external schema for them; resolved as
/// an Open Question by embedding a fixed default set here (see DESIGN.md)
/// rather than inventing a config format the spec doesn't describe.
pub struct TicketGuardConfig {
    pub greetings: Vec<&'static str>,
    pub short_spam: Vec<&'static str>,
    pub negative_intents: Vec<&'static str>,
    pub positive_intents: Vec<&'static str>,
    pub urgent_keywords: Vec<&'static str>,
    pub high_keywords: Vec<&'static str>,
}

impl Default for TicketGuardConfig {
    fn default() -> Self {
        Self {
            greetings: vec!["hi", "hello", "hey", "helo", "hallo", "halo", "yo"],
            short_spam: vec!["ok", "k", "?", "test"],
            negative_intents: vec!["broken", "not working", "refund", "cancel", "angry", "complaint", "scam"],
            positive_intents: vec!["thanks", "thank you", "great", "awesome", "resolved"],
            urgent_keywords: vec!["urgent", "emergency", "asap", "down", "outage", "can't access", "locked out"],
            high_keywords: vec!["error", "broken", "not working", "failed", "refund"],
        }
    }
}

fn alphanumeric_lower(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase).collect()
}

fn fast_guard(config: &TicketGuardConfig, text: &str, message_count: u32) -> Option<TicketEvaluation> {
    if message_count > 5 {
        return None;
    }
    let normalized = alphanumeric_lower(text);
    let is_greeting = config.greetings.iter().any(|g| *g == normalized);
    let is_short_spam = normalized.chars().count() < 4 && config.short_spam.iter().any(|s| *s == normalized);
    if !is_greeting && !is_short_spam {
        return None;
    }
    Some(TicketEvaluation {
        should_create_ticket: true,
        reason: "Initial Greeting (Fast Guard)".into(),
        suggested_priority: TicketPriority::Low,
        suggested_category: "other".into(),
        auto_reply_hint: FAST_GUARD_REPLY_HINT.into(),
    })
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    should_create_ticket: bool,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    auto_reply_hint: Option<String>,
}

fn parse_priority(s: Option<&str>) -> TicketPriority {
    match s.map(str::to_ascii_lowercase).as_deref() {
        Some("medium") => TicketPriority::Medium,
        Some("high") => TicketPriority::High,
        Some("urgent") => TicketPriority::Urgent,
        _ => TicketPriority::Low,
    }
}

fn classifier_prompt(config: &TicketGuardConfig, customer_name: &str, text: &str) -> String {
    format!(
        "Classify this customer service message from \"{customer_name}\": \"{text}\"\n\n\
         Negative-intent phrases (favor ticket creation): {negative}\n\
         Positive-intent phrases (favor no ticket): {positive}\n\
         Urgent-priority keywords: {urgent}\n\
         High-priority keywords: {high}\n\n\
         Reply with ONLY a JSON object of this exact shape, no prose: \
         {{\"should_create_ticket\": bool, \"priority\": \"low\"|\"medium\"|\"high\"|\"urgent\", \
         \"category\": string, \"reason\": string, \"auto_reply_hint\": string}}",
        negative = config.negative_intents.join(", "),
        positive = config.positive_intents.join(", "),
        urgent = config.urgent_keywords.join(", "),
        high = config.high_keywords.join(", "),
    )
}

/// Spec §4.9 `evaluate`: the fast guard first, falling back to a classifier
/// LLM call. A malformed classifier response defaults `priority` to `low`
/// and `should_create_ticket` to `false` rather than failing the pipeline.
pub async fn evaluate(
    llm: &dyn LlmProxyClient,
    tenant_id: Uuid,
    config: &TicketGuardConfig,
    text: &str,
    customer_name: &str,
    message_count: u32,
) -> TicketEvaluation {
    if let Some(fast) = fast_guard(config, text, message_count) {
        return fast;
    }

    let request = LlmRequest {
        messages: vec![LlmMessage::user_text(classifier_prompt(config, customer_name, text))],
        files: Vec::new(),
        category: "ticket_classification".into(),
        name_user: customer_name.to_string(),
        temperature: 0.0,
        tenant_id,
        tools: None,
        tool_choice: None,
    };

    let raw = match llm.complete(request).await {
        Ok(response) => response.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "ticket classifier call failed, defaulting to no ticket");
            return TicketEvaluation {
                should_create_ticket: false,
                reason: "classifier unavailable".into(),
                suggested_priority: TicketPriority::Low,
                suggested_category: "other".into(),
                auto_reply_hint: String::new(),
            };
        }
    };

    match serde_json::from_str::<ClassifierResponse>(raw.trim()) {
        Ok(parsed) => TicketEvaluation {
            should_create_ticket: parsed.should_create_ticket,
            reason: parsed.reason.unwrap_or_else(|| "classified by smart guard".into()),
            suggested_priority: parse_priority(parsed.priority.as_deref()),
            suggested_category: parsed.category.unwrap_or_else(|| "other".into()),
            auto_reply_hint: parsed.auto_reply_hint.unwrap_or_default(),
        },
        Err(e) => {
            tracing::warn!(error = %e, raw = %raw, "ticket classifier returned non-JSON output");
            TicketEvaluation {
                should_create_ticket: false,
                reason: "classifier response could not be parsed".into(),
                suggested_priority: TicketPriority::Low,
                suggested_category: "other".into(),
                auto_reply_hint: String::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_agent::{LlmChoice, LlmError, LlmResponse, LlmResponseMessage, ResponseMetadata, TokenUsage};

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmProxyClient for ScriptedLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                choices: vec![LlmChoice { message: LlmResponseMessage { content: Some(self.0.clone()), tool_calls: None } }],
                usage: TokenUsage::default(),
                metadata: ResponseMetadata::default(),
            })
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmProxyClient for FailingLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Err(LlmError::Timeout)
        }
    }

    #[tokio::test]
    async fn greeting_triggers_fast_guard() {
        let config = TicketGuardConfig::default();
        let evaluation = evaluate(&FailingLlm, Uuid::new_v4(), &config, "Hello!", "Jane", 1).await;
        assert!(evaluation.should_create_ticket);
        assert_eq!(evaluation.reason, "Initial Greeting (Fast Guard)");
        assert_eq!(evaluation.suggested_priority, TicketPriority::Low);
    }

    #[tokio::test]
    async fn fast_guard_does_not_apply_after_five_messages() {
        let config = TicketGuardConfig::default();
        let llm = ScriptedLlm(r#"{"should_create_ticket":false,"priority":"low","category":"other","reason":"chit-chat","auto_reply_hint":""}"#.into());
        let evaluation = evaluate(&llm, Uuid::new_v4(), &config, "Hello!", "Jane", 6).await;
        assert!(!evaluation.should_create_ticket);
    }

    #[tokio::test]
    async fn smart_guard_parses_classifier_json() {
        let config = TicketGuardConfig::default();
        let llm = ScriptedLlm(
            r#"{"should_create_ticket":true,"priority":"urgent","category":"billing","reason":"refund request","auto_reply_hint":"hang tight"}"#
                .into(),
        );
        let evaluation = evaluate(&llm, Uuid::new_v4(), &config, "I need a refund right now, this is urgent", "Jane", 3).await;
        assert!(evaluation.should_create_ticket);
        assert_eq!(evaluation.suggested_priority, TicketPriority::Urgent);
        assert_eq!(evaluation.suggested_category, "billing");
    }

    #[tokio::test]
    async fn malformed_classifier_output_defaults_to_no_ticket_low_priority() {
        let config = TicketGuardConfig::default();
        let llm = ScriptedLlm("not json".into());
        let evaluation = evaluate(&llm, Uuid::new_v4(), &config, "something unusual", "Jane", 3).await;
        assert!(!evaluation.should_create_ticket);
        assert_eq!(evaluation.suggested_priority, TicketPriority::Low);
    }
}
