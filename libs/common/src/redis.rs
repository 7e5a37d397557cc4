//! Async Redis client wrapper.
//!
//! Thin layer over the `redis` crate exposing only the hash operations the
//! gateway uses for the device settings cache. The connection manager
//! reconnects transparently after broker hiccups.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::Result;

/// Redis asynchronous client
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
    url: String,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient").field("url", &self.url).finish()
    }
}

impl RedisClient {
    /// Connect to a Redis server, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            url: url.to_string(),
        })
    }

    /// Build a redis URL from host/port/password parts.
    pub fn build_url(host: &str, port: u16, password: &str) -> String {
        if password.is_empty() {
            format!("redis://{host}:{port}")
        } else {
            format!("redis://:{password}@{host}:{port}")
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.hget(key, field).await?)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.hexists(key, field).await?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
