//! Hybrid retrieval with rerank and context healing — the full algorithm in
//! spec §4.3: candidate pool → rerank → context healing → sort → format.

use crate::entities::{KnowledgeChunk, ScoredChunk};
use crate::qdrant::QdrantChunkIndex;
use crate::reranker::LazyReranker;
use crate::sqlite::SqliteChunkStore;
use crate::traits::{KnowledgeError, KnowledgeIndex, KnowledgeResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const CANDIDATE_POOL_SIZE: usize = 100;
pub const DEFAULT_K: usize = 5;

pub struct HybridKnowledgeIndex {
    store: Arc<SqliteChunkStore>,
    vector: Option<Arc<QdrantChunkIndex>>,
    reranker: LazyReranker,
}

impl HybridKnowledgeIndex {
    pub fn new(store: Arc<SqliteChunkStore>, vector: Option<Arc<QdrantChunkIndex>>, reranker: LazyReranker) -> Self {
        Self { store, vector, reranker }
    }

    /// Union of up to `CANDIDATE_POOL_SIZE` keyword and `CANDIDATE_POOL_SIZE`
    /// vector candidates, keyed by `(doc_id, chunk_index)` with equal
    /// weight between the two retrievers (spec §4.3 step 1).
    async fn candidate_pool(&self, tenant_id: Uuid, query: &str) -> KnowledgeResult<Vec<ScoredChunk>> {
        let keyword = self
            .store
            .keyword_candidates(tenant_id, query, CANDIDATE_POOL_SIZE)
            .await
            .map_err(|e| KnowledgeError::Backend(e.to_string()))?;

        let vector = match &self.vector {
            Some(v) => v.vector_candidates(tenant_id, query, CANDIDATE_POOL_SIZE).await.unwrap_or_default(),
            None => Vec::new(),
        };

        let mut pool: HashMap<(String, u32), ScoredChunk> = HashMap::new();
        for candidate in keyword.into_iter().chain(vector) {
            let key = (candidate.chunk.doc_id.clone(), candidate.chunk.chunk_index);
            pool.entry(key)
                .and_modify(|existing| if candidate.score > existing.score { *existing = clone_scored(&candidate) })
                .or_insert(candidate);
        }
        Ok(pool.into_values().collect())
    }

    /// Fetches `(doc_id, chunk_index + 1)` for each selected chunk when it
    /// exists and isn't already present (spec §4.3 step 3).
    async fn heal(&self, tenant_id: Uuid, selected: Vec<ScoredChunk>) -> Vec<KnowledgeChunk> {
        let mut present: std::collections::HashSet<(String, u32)> =
            selected.iter().map(|s| (s.chunk.doc_id.clone(), s.chunk.chunk_index)).collect();
        let mut chunks: Vec<KnowledgeChunk> = selected.into_iter().map(|s| s.chunk).collect();

        let neighbours: Vec<(String, u32)> = chunks.iter().map(|c| (c.doc_id.clone(), c.chunk_index + 1)).collect();
        for (doc_id, idx) in neighbours {
            if present.contains(&(doc_id.clone(), idx)) {
                continue;
            }
            if let Ok(Some(neighbour)) = self.store.get_chunk(tenant_id, &doc_id, idx).await {
                present.insert((doc_id, idx));
                chunks.push(neighbour);
            }
        }
        chunks
    }
}

fn clone_scored(s: &ScoredChunk) -> ScoredChunk {
    ScoredChunk::new(s.chunk.clone(), s.score)
}

#[async_trait]
impl KnowledgeIndex for HybridKnowledgeIndex {
    async fn retrieve(&self, tenant_id: Uuid, query: &str, k: usize) -> KnowledgeResult<Vec<ScoredChunk>> {
        let pool = self.candidate_pool(tenant_id, query).await?;
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let reranked = self.reranker.rerank(query, pool, |c| c.chunk.text.as_str()).await;
        let top_k: Vec<ScoredChunk> = reranked.into_iter().take(k.max(1)).collect();

        let mut healed = self.heal(tenant_id, top_k).await;
        healed.sort_by(|a, b| a.doc_id.cmp(&b.doc_id).then(a.chunk_index.cmp(&b.chunk_index)));

        Ok(healed.into_iter().map(|c| ScoredChunk::new(c, 0.0)).collect())
    }

    async fn mark_trashed(&self, tenant_id: Uuid, doc_id: &str, flag: bool) -> KnowledgeResult<()> {
        self.store.mark_trashed(tenant_id, doc_id, flag).await.map_err(|e| KnowledgeError::Backend(e.to_string()))
    }

    async fn delete(&self, tenant_id: Uuid, doc_id: &str) -> KnowledgeResult<u64> {
        self.store.delete(tenant_id, doc_id).await.map_err(|e| KnowledgeError::Backend(e.to_string()))
    }

    async fn upsert_chunks(&self, chunks: Vec<KnowledgeChunk>) -> KnowledgeResult<()> {
        if let Some(vector) = &self.vector {
            vector.upsert_chunks(&chunks).await.map_err(|e| KnowledgeError::Backend(e.to_string()))?;
        }
        let n = chunks.len();
        self.store
            .upsert_chunks(chunks, vec![None; n])
            .await
            .map_err(|e| KnowledgeError::Backend(e.to_string()))
    }
}

/// Joins formatted chunks per spec §4.3 step 4.
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks.iter().map(|c| c.chunk.formatted()).collect::<Vec<_>>().join("\n\n###\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reranker::LazyReranker;

    async fn store() -> Arc<SqliteChunkStore> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(SqliteChunkStore::new(dir.path().join("kb.db")).unwrap())
    }

    fn chunk(tenant: Uuid, doc: &str, idx: u32, text: &str, title: Option<&str>) -> KnowledgeChunk {
        KnowledgeChunk {
            chunk_id: Uuid::new_v4(),
            tenant_id: tenant,
            doc_id: doc.to_string(),
            filename: "guide.md".to_string(),
            chunk_index: idx,
            text: text.to_string(),
            section_title: title.map(str::to_string),
            is_trashed: false,
        }
    }

    #[tokio::test]
    async fn retrieval_heals_split_context() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        store
            .upsert_chunks(
                vec![
                    chunk(tenant, "d", 0, "Section A heading", Some("A")),
                    chunk(tenant, "d", 1, "Section A body mentions RC 12.", Some("A")),
                    chunk(tenant, "d", 2, "Section B unrelated", Some("B")),
                ],
                vec![None, None, None],
            )
            .await
            .unwrap();

        let index = HybridKnowledgeIndex::new(store, None, LazyReranker::disabled());
        let results = index.retrieve(tenant, "RC 12", 5).await.unwrap();

        let indices: Vec<u32> = results.iter().map(|c| c.chunk.chunk_index).collect();
        assert!(indices.contains(&1), "direct hit must be present: {indices:?}");
        assert!(indices.contains(&0), "healed neighbour must be present: {indices:?}");
    }

    #[tokio::test]
    async fn retrieval_excludes_trashed_and_sorts_by_position() {
        let store = store().await;
        let tenant = Uuid::new_v4();
        let mut trashed = chunk(tenant, "d", 5, "trashed RC 12 content", None);
        trashed.is_trashed = true;
        store
            .upsert_chunks(vec![chunk(tenant, "d", 0, "RC 12 error code explained", None), trashed], vec![None, None])
            .await
            .unwrap();

        let index = HybridKnowledgeIndex::new(store, None, LazyReranker::disabled());
        let results = index.retrieve(tenant, "RC 12", 5).await.unwrap();
        assert!(results.iter().all(|c| !c.chunk.is_trashed));
        assert!(results.iter().all(|c| c.chunk.chunk_index != 5));
    }

    #[test]
    fn format_context_joins_with_separator() {
        let tenant = Uuid::new_v4();
        let chunks = vec![
            ScoredChunk::new(chunk(tenant, "d", 0, "first", Some("Intro")), 1.0),
            ScoredChunk::new(chunk(tenant, "d", 1, "second", None), 0.9),
        ];
        let formatted = format_context(&chunks);
        assert!(formatted.contains("[Source: guide.md | Intro]\nfirst"));
        assert!(formatted.contains("\n\n###\n\n"));
        assert!(formatted.contains("[Source: guide.md]\nsecond"));
    }
}
