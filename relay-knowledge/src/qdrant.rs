//! Qdrant-backed vector half of hybrid retrieval. Each tenant owns its own
//! collection (`kb_{tenant_id}`) so the knowledge index is physically
//! partitioned per tenant, not just filtered (spec §3 tenant isolation).

use crate::embeddings::EmbeddingProvider;
use crate::entities::{KnowledgeChunk, ScoredChunk};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointId, PointStruct, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

pub struct QdrantChunkIndex {
    client: Qdrant,
    embedding: Arc<dyn EmbeddingProvider>,
}

impl QdrantChunkIndex {
    pub fn connect(url: &str, embedding: Arc<dyn EmbeddingProvider>) -> anyhow::Result<Self> {
        Ok(Self { client: Qdrant::from_url(url).build()?, embedding })
    }

    fn collection_name(tenant_id: Uuid) -> String {
        format!("kb_{tenant_id}")
    }

    async fn ensure_collection(&self, name: &str) -> anyhow::Result<()> {
        let dim = self.embedding.dimensions();
        if dim == 0 {
            anyhow::bail!("embedding provider has zero dimensions, cannot index vectors");
        }
        let collections = self.client.list_collections().await?;
        if !collections.collections.iter().any(|c| c.name == name) {
            self.client
                .create_collection(CreateCollectionBuilder::new(name).vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)))
                .await?;
        }
        Ok(())
    }

    fn point_id(chunk_id: Uuid) -> u64 {
        let mut hasher = DefaultHasher::new();
        chunk_id.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn upsert_chunks(&self, chunks: &[KnowledgeChunk]) -> anyhow::Result<()> {
        for chunk in chunks {
            let collection = Self::collection_name(chunk.tenant_id);
            self.ensure_collection(&collection).await?;
            let embedding = self.embedding.embed_one(&chunk.text).await?;

            let mut payload = std::collections::HashMap::new();
            payload.insert("doc_id".to_string(), qdrant_client::qdrant::Value::from(chunk.doc_id.clone()));
            payload.insert("chunk_index".to_string(), qdrant_client::qdrant::Value::from(chunk.chunk_index as i64));
            payload.insert("filename".to_string(), qdrant_client::qdrant::Value::from(chunk.filename.clone()));
            payload.insert("text".to_string(), qdrant_client::qdrant::Value::from(chunk.text.clone()));
            if let Some(title) = &chunk.section_title {
                payload.insert("section_title".to_string(), qdrant_client::qdrant::Value::from(title.clone()));
            }
            payload.insert("is_trashed".to_string(), qdrant_client::qdrant::Value::from(chunk.is_trashed));

            let point = PointStruct::new(PointId::from(Self::point_id(chunk.chunk_id)), embedding, payload);
            self.client.upsert_points(UpsertPointsBuilder::new(&collection, vec![point]).wait(true)).await?;
        }
        Ok(())
    }

    /// Up to `limit` candidates by cosine similarity within the tenant's
    /// own collection (spec §4.3 step 1, vector half).
    pub async fn vector_candidates(&self, tenant_id: Uuid, query: &str, limit: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let collection = Self::collection_name(tenant_id);
        let collections = self.client.list_collections().await?;
        if !collections.collections.iter().any(|c| c.name == collection) {
            return Ok(Vec::new());
        }

        let embedding = self.embedding.embed_one(query).await?;
        let results = self
            .client
            .search_points(SearchPointsBuilder::new(&collection, embedding, limit as u64).with_payload(true))
            .await?;

        Ok(results
            .result
            .into_iter()
            .filter_map(|point| {
                let payload = point.payload;
                let is_trashed = payload.get("is_trashed").and_then(|v| v.as_bool()).unwrap_or(false);
                if is_trashed {
                    return None;
                }
                let chunk = KnowledgeChunk {
                    chunk_id: Uuid::new_v4(),
                    tenant_id,
                    doc_id: payload.get("doc_id")?.as_str()?.to_string(),
                    filename: payload.get("filename").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    chunk_index: payload.get("chunk_index").and_then(|v| v.as_integer()).unwrap_or(0) as u32,
                    text: payload.get("text")?.as_str()?.to_string(),
                    section_title: payload.get("section_title").and_then(|v| v.as_str()).map(str::to_string),
                    is_trashed,
                };
                Some(ScoredChunk::new(chunk, point.score))
            })
            .collect())
    }
}
