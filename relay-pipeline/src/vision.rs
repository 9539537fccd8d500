//! Image collection and vision interception (spec §4.8 steps 3-4).

use relay_agent::{LlmMessage, LlmProxyClient, LlmRequest};
use relay_store::Message;
use serde_json::{Map, Value};
use uuid::Uuid;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

fn looks_like_image(media_url: Option<&str>, media_type: Option<&str>) -> Option<String> {
    let url = media_url?;
    if let Some(media_type) = media_type {
        if media_type.to_ascii_lowercase().starts_with("image") {
            return Some(url.to_string());
        }
    }
    let ext = url.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()).then(|| url.to_string())
}

fn media_image_url(metadata: &Map<String, Value>) -> Option<String> {
    let media_url = metadata.get("media_url").and_then(Value::as_str);
    let media_type = metadata.get("media_type").and_then(Value::as_str);
    looks_like_image(media_url, media_type)
}

/// Gathers up to `max_images` image URLs from the triggering message and the
/// two most recent history entries, deduplicated, most-recent-first.
pub fn collect_images(current_metadata: &Map<String, Value>, history: &[Message], max_images: usize) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(url) = media_image_url(current_metadata) {
        urls.push(url);
    }
    for msg in history.iter().rev().take(2) {
        if let Some(url) = media_image_url(&msg.metadata) {
            urls.push(url);
        }
    }

    let mut seen = std::collections::HashSet::new();
    urls.retain(|u| seen.insert(u.clone()));
    urls.truncate(max_images);
    urls
}

const VISION_EXTRACTION_PROMPT: &str =
    "Extract any error codes and the main error text visible in this image. Ignore UI chrome, \
     buttons and decoration. Reply with the extracted text only, or \"no error visible\" if none.";

/// Spec §4.8 step 4: one LLM call against the first image only, used to seed
/// `rag_query` with anything an OCR-style read would catch (error codes a
/// customer can't type themselves). Degrades to an empty string on any LLM
/// failure — vision is an enrichment, never a precondition for answering.
pub async fn intercept_vision(llm: &dyn LlmProxyClient, tenant_id: Uuid, image_urls: &[String]) -> String {
    let Some(first) = image_urls.first() else {
        return String::new();
    };

    let request = LlmRequest {
        messages: vec![LlmMessage::system(VISION_EXTRACTION_PROMPT), LlmMessage::user_multimodal("", std::slice::from_ref(first))],
        files: Vec::new(),
        category: "vision".into(),
        name_user: "system".into(),
        temperature: 0.0,
        tenant_id,
        tools: None,
        tool_choice: None,
    };

    match llm.complete(request).await {
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "vision interception failed, continuing without it");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(media_url: Option<&str>, media_type: Option<&str>) -> Message {
        let mut metadata = Map::new();
        if let Some(u) = media_url {
            metadata.insert("media_url".into(), Value::String(u.into()));
        }
        if let Some(t) = media_type {
            metadata.insert("media_type".into(), Value::String(t.into()));
        }
        Message {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_type: relay_store::SenderType::Customer,
            sender_id: None,
            content: String::new(),
            metadata,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn current_message_image_by_media_type() {
        let mut current = Map::new();
        current.insert("media_url".into(), Value::String("https://x/y".into()));
        current.insert("media_type".into(), Value::String("image/jpeg".into()));
        let urls = collect_images(&current, &[], 4);
        assert_eq!(urls, vec!["https://x/y".to_string()]);
    }

    #[test]
    fn current_message_image_by_extension() {
        let mut current = Map::new();
        current.insert("media_url".into(), Value::String("https://x/screenshot.PNG".into()));
        let urls = collect_images(&current, &[], 4);
        assert_eq!(urls, vec!["https://x/screenshot.PNG".to_string()]);
    }

    #[test]
    fn non_image_media_is_ignored() {
        let mut current = Map::new();
        current.insert("media_url".into(), Value::String("https://x/clip.mp4".into()));
        current.insert("media_type".into(), Value::String("video/mp4".into()));
        assert!(collect_images(&current, &[], 4).is_empty());
    }

    #[test]
    fn history_contributes_only_last_two_and_is_deduped() {
        let history = vec![
            msg(Some("https://x/1.jpg"), None),
            msg(Some("https://x/2.jpg"), None),
            msg(Some("https://x/2.jpg"), None),
        ];
        let urls = collect_images(&Map::new(), &history, 4);
        assert_eq!(urls, vec!["https://x/2.jpg".to_string()]);
    }

    #[test]
    fn truncates_to_max_images() {
        let mut current = Map::new();
        current.insert("media_url".into(), Value::String("https://x/0.jpg".into()));
        let history = vec![msg(Some("https://x/1.jpg"), None), msg(Some("https://x/2.jpg"), None)];
        let urls = collect_images(&current, &history, 2);
        assert_eq!(urls.len(), 2);
    }
}
