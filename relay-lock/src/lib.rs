#![warn(clippy::all)]
#![allow(clippy::pedantic)]

//! Per-key mutual exclusion with TTL and bounded wait (C1), backed by Redis
//! `SET NX EX` for acquisition and a Lua compare-and-delete for release.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("backend error: {0}")]
    Backend(String),
}

pub type LockResult<T> = Result<T, LockError>;

/// A held lock. Carries the random token needed to release it safely.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration, max_wait: Duration) -> LockResult<Option<Lease>>;
    async fn release(&self, lease: &Lease) -> LockResult<()>;
    async fn extend(&self, lease: &Lease, ttl: Duration) -> LockResult<bool>;
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Released only if the stored value still matches our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Extends TTL only if the stored value still matches our token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockService {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisLockService {
    pub async fn new(redis_url: &str) -> LockResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| LockError::Backend(e.to_string()))?;
        let conn = client.get_connection_manager().await.ok();
        Ok(Self { client, conn: RwLock::new(conn) })
    }

    async fn connection(&self) -> LockResult<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        *self.conn.write().await = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, ttl: Duration, max_wait: Duration) -> LockResult<Option<Lease>> {
        let token = random_token();
        let deadline = Instant::now() + max_wait;
        let mut conn = self.connection().await?;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

            if acquired.is_some() {
                return Ok(Some(Lease { key: key.to_string(), token }));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn release(&self, lease: &Lease) -> LockResult<()> {
        let mut conn = self.connection().await?;
        redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.connection().await?;
        let result: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(result == 1)
    }
}

/// Single-process lock table for tests and for running the whole stack
/// without a Redis instance.
#[derive(Default)]
pub struct InMemoryLockService {
    held: Arc<tokio::sync::Mutex<std::collections::HashMap<String, (String, Instant)>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration, max_wait: Duration) -> LockResult<Option<Lease>> {
        let token = random_token();
        let deadline = Instant::now() + max_wait;

        loop {
            {
                let mut held = self.held.lock().await;
                let expired = held.get(key).map(|(_, exp)| Instant::now() >= *exp).unwrap_or(true);
                if expired {
                    held.insert(key.to_string(), (token.clone(), Instant::now() + ttl));
                    return Ok(Some(Lease { key: key.to_string(), token }));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn release(&self, lease: &Lease) -> LockResult<()> {
        let mut held = self.held.lock().await;
        if held.get(&lease.key).map(|(tok, _)| tok == &lease.token).unwrap_or(false) {
            held.remove(&lease.key);
        }
        Ok(())
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> LockResult<bool> {
        let mut held = self.held.lock().await;
        if let Some(entry) = held.get_mut(&lease.key) {
            if entry.0 == lease.token {
                entry.1 = Instant::now() + ttl;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let svc = InMemoryLockService::new();
        let lease = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(200)).await.unwrap().unwrap();
        let blocked = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(150)).await.unwrap();
        assert!(blocked.is_none());

        svc.release(&lease).await.unwrap();
        let reacquired = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(200)).await.unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn release_with_stale_token_is_noop() {
        let svc = InMemoryLockService::new();
        let lease = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(200)).await.unwrap().unwrap();
        let stale = Lease { key: "k".to_string(), token: "not-the-token".to_string() };
        svc.release(&stale).await.unwrap();

        let blocked = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(100)).await.unwrap();
        assert!(blocked.is_none(), "release with mismatched token must not release the real holder's lock");
        svc.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let svc = InMemoryLockService::new();
        let _lease = svc.acquire("k", Duration::from_millis(50), Duration::from_millis(200)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let reacquired = svc.acquire("k", Duration::from_secs(5), Duration::from_millis(200)).await.unwrap();
        assert!(reacquired.is_some());
    }
}
