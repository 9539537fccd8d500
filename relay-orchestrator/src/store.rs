//! Shared KV backing the debounce worker's per-chat state (spec §4.7):
//! a `queue:ctx:{chat_id}` hash and a `worker:active:{chat_id}` TTL flag.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("backend error: {0}")]
    Backend(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub msg_id: Uuid,
    pub priority: String,
    pub run_at_unix: i64,
}

#[async_trait]
pub trait DebounceStore: Send + Sync {
    async fn upsert_queue(&self, chat_id: Uuid, msg_id: Uuid, priority: &str, run_at_unix: i64) -> OrchestratorResult<()>;

    async fn read_queue(&self, chat_id: Uuid) -> OrchestratorResult<Option<QueueEntry>>;

    async fn clear_queue(&self, chat_id: Uuid) -> OrchestratorResult<()>;

    /// `SET NX EX`-style atomic claim: `true` iff this call claimed the flag.
    async fn try_acquire_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<bool>;

    async fn heartbeat_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<()>;

    async fn clear_worker(&self, chat_id: Uuid) -> OrchestratorResult<()>;

    /// Chat ids holding a queue entry with no live worker flag (crash recovery).
    async fn scan_orphaned_chats(&self) -> OrchestratorResult<Vec<Uuid>>;
}

fn queue_key(chat_id: Uuid) -> String {
    format!("queue:ctx:{chat_id}")
}

fn worker_key(chat_id: Uuid) -> String {
    format!("worker:active:{chat_id}")
}

/// Redis-backed [`DebounceStore`], the production implementation.
pub struct RedisDebounceStore {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisDebounceStore {
    pub async fn new(redis_url: &str) -> OrchestratorResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| OrchestratorError::Backend(e.to_string()))?;
        let conn = client.get_connection_manager().await.ok();
        Ok(Self { client, conn: RwLock::new(conn) })
    }

    async fn connection(&self) -> OrchestratorResult<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| OrchestratorError::Backend(e.to_string()))?;
        *self.conn.write().await = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl DebounceStore for RedisDebounceStore {
    async fn upsert_queue(&self, chat_id: Uuid, msg_id: Uuid, priority: &str, run_at_unix: i64) -> OrchestratorResult<()> {
        let mut conn = self.connection().await?;
        conn.hset_multiple::<_, _, _, ()>(
            queue_key(chat_id),
            &[("run_at", run_at_unix.to_string()), ("msg_id", msg_id.to_string()), ("priority", priority.to_string())],
        )
        .await
        .map_err(|e| OrchestratorError::Backend(e.to_string()))
    }

    async fn read_queue(&self, chat_id: Uuid) -> OrchestratorResult<Option<QueueEntry>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(queue_key(chat_id)).await.map_err(|e| OrchestratorError::Backend(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let run_at_unix = fields.get("run_at").and_then(|s| s.parse().ok()).unwrap_or(0);
        let msg_id = fields.get("msg_id").and_then(|s| s.parse().ok()).unwrap_or_default();
        let priority = fields.get("priority").cloned().unwrap_or_else(|| "normal".to_string());
        Ok(Some(QueueEntry { msg_id, priority, run_at_unix }))
    }

    async fn clear_queue(&self, chat_id: Uuid) -> OrchestratorResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(queue_key(chat_id)).await.map_err(|e| OrchestratorError::Backend(e.to_string()))
    }

    async fn try_acquire_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<bool> {
        let mut conn = self.connection().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(worker_key(chat_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| OrchestratorError::Backend(e.to_string()))?;
        Ok(acquired.is_some())
    }

    async fn heartbeat_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<()> {
        let mut conn = self.connection().await?;
        conn.expire::<_, ()>(worker_key(chat_id), ttl.as_secs() as i64)
            .await
            .map_err(|e| OrchestratorError::Backend(e.to_string()))
    }

    async fn clear_worker(&self, chat_id: Uuid) -> OrchestratorResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(worker_key(chat_id)).await.map_err(|e| OrchestratorError::Backend(e.to_string()))
    }

    async fn scan_orphaned_chats(&self) -> OrchestratorResult<Vec<Uuid>> {
        let mut conn = self.connection().await?;
        let mut orphaned = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("queue:ctx:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| OrchestratorError::Backend(e.to_string()))?;

            for key in keys {
                let Some(id_str) = key.strip_prefix("queue:ctx:") else { continue };
                let Ok(chat_id) = Uuid::parse_str(id_str) else { continue };
                let alive: bool =
                    conn.exists(worker_key(chat_id)).await.map_err(|e| OrchestratorError::Backend(e.to_string()))?;
                if !alive {
                    orphaned.push(chat_id);
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(orphaned)
    }
}

#[derive(Default)]
struct InMemoryState {
    queues: HashMap<Uuid, QueueEntry>,
    workers: HashMap<Uuid, Instant>,
}

/// Single-process [`DebounceStore`] for tests and Redis-less deployments.
#[derive(Default)]
pub struct InMemoryDebounceStore {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryDebounceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DebounceStore for InMemoryDebounceStore {
    async fn upsert_queue(&self, chat_id: Uuid, msg_id: Uuid, priority: &str, run_at_unix: i64) -> OrchestratorResult<()> {
        self.inner.lock().await.queues.insert(chat_id, QueueEntry { msg_id, priority: priority.to_string(), run_at_unix });
        Ok(())
    }

    async fn read_queue(&self, chat_id: Uuid) -> OrchestratorResult<Option<QueueEntry>> {
        Ok(self.inner.lock().await.queues.get(&chat_id).cloned())
    }

    async fn clear_queue(&self, chat_id: Uuid) -> OrchestratorResult<()> {
        self.inner.lock().await.queues.remove(&chat_id);
        Ok(())
    }

    async fn try_acquire_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<bool> {
        let mut inner = self.inner.lock().await;
        let expired = inner.workers.get(&chat_id).map(|exp| Instant::now() >= *exp).unwrap_or(true);
        if expired {
            inner.workers.insert(chat_id, Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn heartbeat_worker(&self, chat_id: Uuid, ttl: Duration) -> OrchestratorResult<()> {
        if let Some(expiry) = self.inner.lock().await.workers.get_mut(&chat_id) {
            *expiry = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn clear_worker(&self, chat_id: Uuid) -> OrchestratorResult<()> {
        self.inner.lock().await.workers.remove(&chat_id);
        Ok(())
    }

    async fn scan_orphaned_chats(&self) -> OrchestratorResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .queues
            .keys()
            .filter(|chat_id| inner.workers.get(chat_id).map(|exp| now >= *exp).unwrap_or(true))
            .copied()
            .collect())
    }
}
