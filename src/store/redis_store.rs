//! Redis-backed store with automatic reconnection

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{KeyValueStore, StoreError, StoreResult};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Unavailable(format!("timed out: {}", err))
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Redis client shared by every request.
///
/// `ConnectionManager` multiplexes commands over one connection and
/// reconnects on its own; cloning it only clones the handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis. Supports both redis:// and rediss:// URLs.
    ///
    /// `timeout` bounds the initial connect and every later command.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        tracing::info!(url = %redact(url), "Connected to Redis");
        Ok(Self { conn, timeout })
    }

    async fn bounded<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            match ttl {
                Some(ttl) => {
                    // PX keeps sub-second TTLs intact; Redis rejects 0.
                    let millis = (ttl.as_millis() as u64).max(1);
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("PX")
                        .arg(millis)
                        .query_async::<()>(&mut conn)
                        .await
                }
                None => conn.set::<_, _, ()>(key, value).await,
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.del::<_, i64>(key).await.map(|_| ()) })
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.sadd::<_, _, i64>(key, member).await.map(|n| n > 0) })
            .await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.smembers(key).await }).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.srem::<_, _, i64>(key, member).await.map(|n| n > 0) })
            .await
    }
}

/// Strips credentials from a connection URL before it is logged.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}
