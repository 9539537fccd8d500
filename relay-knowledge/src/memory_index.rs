//! In-process `KnowledgeIndex` for unit tests elsewhere in the workspace
//! (router/pipeline tests construct this instead of a temp SQLite+Qdrant
//! pair). Keyword matching only — good enough for fixture-sized corpora.

use crate::entities::{KnowledgeChunk, ScoredChunk};
use crate::traits::{KnowledgeIndex, KnowledgeResult};
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryKnowledgeIndex {
    chunks: RwLock<Vec<KnowledgeChunk>>,
}

impl InMemoryKnowledgeIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryKnowledgeIndex {
    async fn retrieve(&self, tenant_id: Uuid, query: &str, k: usize) -> KnowledgeResult<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().await;
        let terms: Vec<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|c| c.tenant_id == tenant_id && !c.is_trashed)
            .filter_map(|c| {
                let lower = c.text.to_lowercase();
                let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                (hits > 0).then(|| ScoredChunk::new(c.clone(), hits as f32))
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut top: Vec<ScoredChunk> = scored.into_iter().take(k.max(1)).collect();

        let mut present: std::collections::HashSet<(String, u32)> =
            top.iter().map(|s| (s.chunk.doc_id.clone(), s.chunk.chunk_index)).collect();
        let neighbours: Vec<(String, u32)> = top.iter().map(|s| (s.chunk.doc_id.clone(), s.chunk.chunk_index + 1)).collect();
        for (doc_id, idx) in neighbours {
            if present.contains(&(doc_id.clone(), idx)) {
                continue;
            }
            if let Some(neighbour) = chunks.iter().find(|c| c.tenant_id == tenant_id && c.doc_id == doc_id && c.chunk_index == idx && !c.is_trashed) {
                present.insert((doc_id, idx));
                top.push(ScoredChunk::new(neighbour.clone(), 0.0));
            }
        }

        top.sort_by(|a, b| a.chunk.doc_id.cmp(&b.chunk.doc_id).then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index)));
        Ok(top)
    }

    async fn mark_trashed(&self, tenant_id: Uuid, doc_id: &str, flag: bool) -> KnowledgeResult<()> {
        let mut chunks = self.chunks.write().await;
        for c in chunks.iter_mut().filter(|c| c.tenant_id == tenant_id && c.doc_id == doc_id) {
            c.is_trashed = flag;
        }
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, doc_id: &str) -> KnowledgeResult<u64> {
        let mut chunks = self.chunks.write().await;
        let before = chunks.len();
        chunks.retain(|c| !(c.tenant_id == tenant_id && c.doc_id == doc_id));
        Ok((before - chunks.len()) as u64)
    }

    async fn upsert_chunks(&self, new_chunks: Vec<KnowledgeChunk>) -> KnowledgeResult<()> {
        let mut chunks = self.chunks.write().await;
        chunks.extend(new_chunks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heals_and_filters_by_tenant() {
        let index = InMemoryKnowledgeIndex::new();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        index
            .upsert_chunks(vec![
                KnowledgeChunk { chunk_id: Uuid::new_v4(), tenant_id: t1, doc_id: "d".into(), filename: "f.md".into(), chunk_index: 0, text: "Section A heading".into(), section_title: None, is_trashed: false },
                KnowledgeChunk { chunk_id: Uuid::new_v4(), tenant_id: t1, doc_id: "d".into(), filename: "f.md".into(), chunk_index: 1, text: "body mentions RC 12".into(), section_title: None, is_trashed: false },
                KnowledgeChunk { chunk_id: Uuid::new_v4(), tenant_id: t2, doc_id: "d".into(), filename: "f.md".into(), chunk_index: 0, text: "RC 12 other tenant".into(), section_title: None, is_trashed: false },
            ])
            .await
            .unwrap();

        let results = index.retrieve(t1, "RC 12", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|c| c.chunk.tenant_id == t1));
    }
}
