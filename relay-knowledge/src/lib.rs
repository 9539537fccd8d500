//! Per-tenant knowledge index (C3): hybrid keyword+vector retrieval with
//! cross-encoder rerank and context healing, per spec §4.3.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod embeddings;
pub mod entities;
pub mod memory_index;
pub mod qdrant;
pub mod reranker;
pub mod retrieval;
pub mod sqlite;
pub mod traits;
pub mod vector;

pub use embeddings::{create_embedding_provider, EmbeddingProvider, NoopEmbedding, OpenAiEmbedding};
pub use entities::{KnowledgeChunk, ScoredChunk};
pub use memory_index::InMemoryKnowledgeIndex;
pub use qdrant::QdrantChunkIndex;
pub use reranker::{CrossEncoder, LazyReranker};
pub use retrieval::{format_context, HybridKnowledgeIndex, CANDIDATE_POOL_SIZE, DEFAULT_K};
pub use sqlite::SqliteChunkStore;
pub use traits::{KnowledgeError, KnowledgeIndex, KnowledgeResult};
