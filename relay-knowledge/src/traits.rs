//! The `KnowledgeIndex` contract (C3) used by the retrieval pipeline (C8).

use crate::entities::{KnowledgeChunk, ScoredChunk};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("backend error: {0}")]
    Backend(String),
}

pub type KnowledgeResult<T> = Result<T, KnowledgeError>;

#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    /// Hybrid keyword+vector retrieval with rerank and context healing (spec
    /// §4.3). Always filters to `tenant_id` and excludes `is_trashed` chunks.
    async fn retrieve(&self, tenant_id: Uuid, query: &str, k: usize) -> KnowledgeResult<Vec<ScoredChunk>>;

    /// Flips `is_trashed` for every chunk of `doc_id`. Trashed chunks are
    /// never returned by `retrieve`.
    async fn mark_trashed(&self, tenant_id: Uuid, doc_id: &str, flag: bool) -> KnowledgeResult<()>;

    /// Removes every chunk of `doc_id`, returning the count removed.
    async fn delete(&self, tenant_id: Uuid, doc_id: &str) -> KnowledgeResult<u64>;

    /// Ingestion boundary: add or replace a document's chunks. Document
    /// ingestion proper (layout/table extraction) is an external
    /// collaborator per spec §1; this is the narrow interface the core
    /// needs to seed a tenant's collection.
    async fn upsert_chunks(&self, chunks: Vec<KnowledgeChunk>) -> KnowledgeResult<()>;
}
