//! The chunk model for the per-tenant knowledge index (C3).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One chunk of an ingested document, scoped to a tenant's collection.
///
/// `doc_id` + `chunk_index` identify a chunk's position within its source
/// document; context healing (spec §4.3 step 3) walks this ordering to pull
/// in a selected chunk's immediate successor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub chunk_id: Uuid,
    pub tenant_id: Uuid,
    pub doc_id: String,
    pub filename: String,
    pub chunk_index: u32,
    pub text: String,
    pub section_title: Option<String>,
    #[serde(default)]
    pub is_trashed: bool,
}

impl KnowledgeChunk {
    /// `[Source: filename | section_title]\n<text>` per spec §4.3 step 4.
    /// Falls back to the filename alone when no section title is known.
    pub fn formatted(&self) -> String {
        match &self.section_title {
            Some(title) if !title.is_empty() => {
                format!("[Source: {} | {}]\n{}", self.filename, title, self.text)
            }
            _ => format!("[Source: {}]\n{}", self.filename, self.text),
        }
    }
}

/// A chunk with its retrieval score, prior to rerank.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

impl ScoredChunk {
    pub fn new(chunk: KnowledgeChunk, score: f32) -> Self {
        Self { chunk, score }
    }
}
