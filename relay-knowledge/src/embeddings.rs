//! Embedding providers for the vector half of hybrid retrieval.

use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed(&[text]).await?.into_iter().next().unwrap_or_default())
    }
}

/// Zero-dimension stand-in used when no embedding backend is configured;
/// retrieval degrades to keyword-only candidates (spec §4.3 allows this
/// implicitly via the "no rerank, use candidate order" degrade path).
pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn name(&self) -> &str {
        "noop"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| Vec::new()).collect())
    }
}

/// OpenAI-compatible `/embeddings` client (also serves self-hosted
/// OpenAI-API-compatible embedding servers).
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedding {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("embedding request failed ({status}): {body}");
        }

        let body: serde_json::Value = resp.json().await?;
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow::anyhow!("malformed embedding response"))?;

        data.iter()
            .map(|entry| {
                entry
                    .get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                    .ok_or_else(|| anyhow::anyhow!("malformed embedding entry"))
            })
            .collect()
    }
}

pub fn create_embedding_provider(base_url: Option<&str>, api_key: Option<&str>, model: Option<&str>, dimensions: usize) -> Arc<dyn EmbeddingProvider> {
    match (base_url, api_key) {
        (Some(base_url), Some(api_key)) => {
            Arc::new(OpenAiEmbedding::new(base_url, api_key, model.unwrap_or("text-embedding-3-small"), dimensions))
        }
        _ => Arc::new(NoopEmbedding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_embedding_returns_empty_vectors() {
        let provider = NoopEmbedding;
        let vecs = provider.embed(&["a", "b"]).await.unwrap();
        assert_eq!(vecs.len(), 2);
        assert!(vecs[0].is_empty());
    }
}
