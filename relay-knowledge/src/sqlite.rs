//! SQLite-backed chunk store: source of truth for chunk rows plus the
//! keyword (FTS5/BM25-class) half of hybrid retrieval, and the optional
//! fallback vector column used when no Qdrant instance is configured.

use crate::entities::{KnowledgeChunk, ScoredChunk};
use crate::vector::{bytes_to_vec, cosine_similarity, vec_to_bytes};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct SqliteChunkStore {
    db_path: PathBuf,
}

impl SqliteChunkStore {
    pub fn new(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                section_title TEXT,
                is_trashed INTEGER NOT NULL DEFAULT 0,
                embedding BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(tenant_id, doc_id, chunk_index);

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                chunk_id UNINDEXED,
                tenant_id UNINDEXED,
                text
            );
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            f(&conn)
        })
        .await?
    }

    pub async fn upsert_chunks(&self, chunks: Vec<KnowledgeChunk>, embeddings: Vec<Option<Vec<f32>>>) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            for (chunk, embedding) in chunks.into_iter().zip(embeddings.into_iter().chain(std::iter::repeat(None))) {
                conn.execute(
                    "INSERT INTO chunks (chunk_id, tenant_id, doc_id, filename, chunk_index, text, section_title, is_trashed, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(chunk_id) DO UPDATE SET
                        text = excluded.text, section_title = excluded.section_title,
                        is_trashed = excluded.is_trashed, embedding = excluded.embedding",
                    params![
                        chunk.chunk_id.to_string(),
                        chunk.tenant_id.to_string(),
                        chunk.doc_id,
                        chunk.filename,
                        chunk.chunk_index,
                        chunk.text,
                        chunk.section_title,
                        chunk.is_trashed as i64,
                        embedding.map(|e| vec_to_bytes(&e)),
                    ],
                )?;
                conn.execute(
                    "DELETE FROM chunks_fts WHERE chunk_id = ?1",
                    params![chunk.chunk_id.to_string()],
                )?;
                let row = conn.query_row(
                    "SELECT text FROM chunks WHERE chunk_id = ?1",
                    params![chunk.chunk_id.to_string()],
                    |r| r.get::<_, String>(0),
                )?;
                conn.execute(
                    "INSERT INTO chunks_fts (chunk_id, tenant_id, text) VALUES (?1, ?2, ?3)",
                    params![chunk.chunk_id.to_string(), chunk.tenant_id.to_string(), row],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Up to `limit` candidates ranked by FTS5 BM25 (spec §4.3 step 1,
    /// keyword half). Excludes trashed chunks.
    pub async fn keyword_candidates(&self, tenant_id: Uuid, query: &str, limit: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        let query = query.to_string();
        self.with_conn(move |conn| {
            let fts_query = sanitize_fts_query(&query);
            if fts_query.is_empty() {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(
                "SELECT c.chunk_id, c.tenant_id, c.doc_id, c.filename, c.chunk_index, c.text, c.section_title, c.is_trashed, bm25(chunks_fts) as rank
                 FROM chunks_fts
                 JOIN chunks c ON c.chunk_id = chunks_fts.chunk_id
                 WHERE chunks_fts.text MATCH ?1 AND c.tenant_id = ?2 AND c.is_trashed = 0
                 ORDER BY rank LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![fts_query, tenant_id.to_string(), limit as i64], row_to_scored)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    /// Fallback vector search over the `embedding` column (used only when
    /// no Qdrant collection is configured — a cosine scan is fine at the
    /// sizes this fallback is meant for).
    pub async fn vector_candidates(&self, tenant_id: Uuid, query_embedding: Vec<f32>, limit: usize) -> anyhow::Result<Vec<ScoredChunk>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, tenant_id, doc_id, filename, chunk_index, text, section_title, is_trashed, embedding
                 FROM chunks WHERE tenant_id = ?1 AND is_trashed = 0 AND embedding IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![tenant_id.to_string()], |r| {
                let chunk = row_to_chunk(r)?;
                let bytes: Vec<u8> = r.get(8)?;
                Ok((chunk, bytes_to_vec(&bytes)))
            })?;

            let mut scored: Vec<ScoredChunk> = rows
                .filter_map(Result::ok)
                .map(|(chunk, emb)| {
                    let score = cosine_similarity(&query_embedding, &emb);
                    ScoredChunk::new(chunk, score)
                })
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);
            Ok(scored)
        })
        .await
    }

    pub async fn get_chunk(&self, tenant_id: Uuid, doc_id: &str, chunk_index: u32) -> anyhow::Result<Option<KnowledgeChunk>> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT chunk_id, tenant_id, doc_id, filename, chunk_index, text, section_title, is_trashed
                 FROM chunks WHERE tenant_id = ?1 AND doc_id = ?2 AND chunk_index = ?3 AND is_trashed = 0",
                params![tenant_id.to_string(), doc_id, chunk_index],
                row_to_chunk,
            )
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e.into()) })
        })
        .await
    }

    pub async fn mark_trashed(&self, tenant_id: Uuid, doc_id: &str, flag: bool) -> anyhow::Result<()> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE chunks SET is_trashed = ?1 WHERE tenant_id = ?2 AND doc_id = ?3",
                params![flag as i64, tenant_id.to_string(), doc_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, tenant_id: Uuid, doc_id: &str) -> anyhow::Result<u64> {
        let doc_id = doc_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE tenant_id = ?1 AND doc_id = ?2)",
                params![tenant_id.to_string(), doc_id],
            )?;
            let count = conn.execute(
                "DELETE FROM chunks WHERE tenant_id = ?1 AND doc_id = ?2",
                params![tenant_id.to_string(), doc_id],
            )?;
            Ok(count as u64)
        })
        .await
    }
}

fn row_to_chunk(r: &rusqlite::Row) -> rusqlite::Result<KnowledgeChunk> {
    Ok(KnowledgeChunk {
        chunk_id: r.get::<_, String>(0)?.parse().unwrap_or_default(),
        tenant_id: r.get::<_, String>(1)?.parse().unwrap_or_default(),
        doc_id: r.get(2)?,
        filename: r.get(3)?,
        chunk_index: r.get::<_, i64>(4)? as u32,
        text: r.get(5)?,
        section_title: r.get(6)?,
        is_trashed: r.get::<_, i64>(7)? != 0,
    })
}

fn row_to_scored(r: &rusqlite::Row) -> rusqlite::Result<ScoredChunk> {
    let chunk = row_to_chunk(r)?;
    // BM25 in SQLite is "lower is better"; invert to a positive relevance score.
    let rank: f64 = r.get(8)?;
    Ok(ScoredChunk::new(chunk, -(rank as f32)))
}

/// FTS5 MATCH syntax trips on bare punctuation; keep only word characters
/// and join with OR so any query term can surface a candidate.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tenant: Uuid, doc: &str, idx: u32, text: &str) -> KnowledgeChunk {
        KnowledgeChunk {
            chunk_id: Uuid::new_v4(),
            tenant_id: tenant,
            doc_id: doc.to_string(),
            filename: "doc.md".to_string(),
            chunk_index: idx,
            text: text.to_string(),
            section_title: None,
            is_trashed: false,
        }
    }

    #[tokio::test]
    async fn keyword_search_finds_matching_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::new(dir.path().join("kb.db")).unwrap();
        let tenant = Uuid::new_v4();
        store
            .upsert_chunks(vec![chunk(tenant, "d", 0, "Section A body mentions RC 12.")], vec![None])
            .await
            .unwrap();

        let hits = store.keyword_candidates(tenant, "RC 12", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn trashed_chunk_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::new(dir.path().join("kb.db")).unwrap();
        let tenant = Uuid::new_v4();
        let mut c = chunk(tenant, "d", 0, "trashed content marker");
        c.is_trashed = true;
        store.upsert_chunks(vec![c], vec![None]).await.unwrap();

        let hits = store.keyword_candidates(tenant, "trashed content", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn other_tenant_chunks_never_surface() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::new(dir.path().join("kb.db")).unwrap();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_chunks(vec![chunk(t1, "d", 0, "secret tenant data")], vec![None]).await.unwrap();

        let hits = store.keyword_candidates(t2, "secret tenant data", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn mark_trashed_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::new(dir.path().join("kb.db")).unwrap();
        let tenant = Uuid::new_v4();
        store.upsert_chunks(vec![chunk(tenant, "d", 0, "hello world")], vec![None]).await.unwrap();

        store.mark_trashed(tenant, "d", true).await.unwrap();
        assert!(store.keyword_candidates(tenant, "hello world", 10).await.unwrap().is_empty());

        let deleted = store.delete(tenant, "d").await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn context_healing_neighbour_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::new(dir.path().join("kb.db")).unwrap();
        let tenant = Uuid::new_v4();
        store
            .upsert_chunks(
                vec![chunk(tenant, "d", 0, "Section A heading"), chunk(tenant, "d", 1, "Section A body")],
                vec![None, None],
            )
            .await
            .unwrap();

        let next = store.get_chunk(tenant, "d", 1).await.unwrap();
        assert!(next.is_some());
        let missing = store.get_chunk(tenant, "d", 2).await.unwrap();
        assert!(missing.is_none());
    }
}
