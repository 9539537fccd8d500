//! Cross-encoder rerank (spec §4.3 step 2).
//!
//! Scores `(query, candidate)` pairs in batches. Deliberately has no score
//! threshold — per spec, if keyword matching surfaced a candidate at all it
//! is considered relevant; rerank only orders the pool. Model load failures
//! degrade to "no rerank, use candidate order" rather than failing the
//! request (spec §4.3 "Model loading").

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;

pub const MAX_PAIR_CHARS: usize = 512;
pub const DEFAULT_BATCH_SIZE: usize = 16;

#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Scores each `(query, candidate)` pair; output is in the same order
    /// as `candidates`, higher is more relevant.
    async fn score(&self, query: &str, candidates: &[&str]) -> anyhow::Result<Vec<f32>>;
}

/// HTTP-backed cross-encoder (a self-hosted reranker endpoint, e.g. a
/// sentence-transformers cross-encoder served behind a small HTTP shim).
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    url: String,
}

impl HttpCrossEncoder {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), url: url.into() }
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score(&self, query: &str, candidates: &[&str]) -> anyhow::Result<Vec<f32>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "query": query, "candidates": candidates }))
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("reranker returned {}", resp.status());
        }

        let body: serde_json::Value = resp.json().await?;
        let scores = body
            .get("scores")
            .and_then(|s| s.as_array())
            .ok_or_else(|| anyhow::anyhow!("malformed reranker response"))?;

        Ok(scores.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
    }
}

/// Lazy-loaded, degrade-safe wrapper: the first call attempts to reach the
/// configured reranker; a failure is cached so every later call degrades
/// immediately instead of retrying a dead endpoint per request.
pub struct LazyReranker {
    url: Option<String>,
    encoder: OnceCell<Option<Arc<dyn CrossEncoder>>>,
}

impl LazyReranker {
    pub fn new(url: Option<String>) -> Self {
        Self { url, encoder: OnceCell::new() }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    async fn encoder(&self) -> Option<Arc<dyn CrossEncoder>> {
        if let Some(cached) = self.encoder.get() {
            return cached.clone();
        }
        let loaded: Option<Arc<dyn CrossEncoder>> = match &self.url {
            Some(url) => {
                let enc: Arc<dyn CrossEncoder> = Arc::new(HttpCrossEncoder::new(url.clone()));
                Some(enc)
            }
            None => None,
        };
        let _ = self.encoder.set(loaded.clone());
        loaded
    }

    /// Reorders `candidates` by rerank score, batching pairs at
    /// `DEFAULT_BATCH_SIZE`. On any failure (no encoder configured, or the
    /// call errors), returns `candidates` untouched — "no rerank, use
    /// candidate order".
    pub async fn rerank<T>(&self, query: &str, candidates: Vec<T>, text_of: impl Fn(&T) -> &str) -> Vec<T> {
        let Some(encoder) = self.encoder().await else {
            return candidates;
        };

        // Batched manually (rather than via `chunks()`) since `T` isn't
        // required to be `Clone`.
        let mut out = Vec::with_capacity(candidates.len());
        let mut iter = candidates.into_iter().peekable();
        let mut buf: Vec<T> = Vec::new();
        while iter.peek().is_some() {
            buf.clear();
            for _ in 0..DEFAULT_BATCH_SIZE {
                match iter.next() {
                    Some(item) => buf.push(item),
                    None => break,
                }
            }
            let texts: Vec<&str> = buf.iter().map(|c| {
                let t = text_of(c);
                &t[..t.len().min(MAX_PAIR_CHARS)]
            }).collect();

            match encoder.score(query, &texts).await {
                Ok(scores) if scores.len() == buf.len() => {
                    for (item, score) in buf.drain(..).zip(scores) {
                        out.push((score, item));
                    }
                }
                _ => {
                    for item in buf.drain(..) {
                        out.push((0.0, item));
                    }
                }
            }
        }

        out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        out.into_iter().map(|(_, item)| item).collect()
    }
}
