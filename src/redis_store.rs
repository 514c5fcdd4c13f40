//! Networked [`CacheStore`] on Redis, shared by every process that points at
//! the same server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::{Result, SpfyError};

/// Stores each entry as `{key}:etag` and `{key}:response`, written and
/// expired together in one atomic pipeline.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to `url`, e.g. `redis://127.0.0.1/`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(cache_error)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_error)?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn cache_error(err: redis::RedisError) -> SpfyError {
    SpfyError::Cache(format!("redis: {err}"))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn etag(&self, key: &CacheKey) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key.etag_key()).await.map_err(cache_error)
    }

    async fn body(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key.response_key()).await.map_err(cache_error)
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);
        redis::pipe()
            .atomic()
            .set_ex(key.etag_key(), entry.etag(), secs)
            .set_ex(key.response_key(), entry.body(), secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn touch(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl) as i64;
        redis::pipe()
            .atomic()
            .expire(key.etag_key(), secs)
            .expire(key.response_key(), secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![key.etag_key(), key.response_key()])
            .await
            .map_err(cache_error)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ttl_secs;

    #[test]
    fn ttl_rounds_down_but_never_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 1);
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }
}
