//! Device-side settings cache over the key-value store.
//!
//! Contract: `tracker_setting{uid}` holds the in-progress settings read —
//! fields `task`, `reading`, `start` (epoch seconds, stale after 600 s) and
//! `data` (accumulated chunks). The read is consumable once `data` is
//! present and `reading` is gone. `tracker_action{uid}` holds a JSON
//! command list under field `d`.

use std::time::{SystemTime, UNIX_EPOCH};

use common::RedisClient;
use serde_json::Value;

use crate::error::Result;

/// Seconds after which an unfinished settings read expires
const READING_EXPIRY_SECS: u64 = 600;

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Settings cache for one protocol listener.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    redis: RedisClient,
}

impl SettingsStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn settings_key(uid: &str) -> String {
        format!("tracker_setting{uid}")
    }

    fn action_key(uid: &str) -> String {
        format!("tracker_action{uid}")
    }

    /// True while a settings read is running and not yet stale.
    pub async fn is_reading(&self, uid: &str) -> Result<bool> {
        let key = Self::settings_key(uid);
        if !self.redis.hexists(&key, "reading").await? {
            return Ok(false);
        }
        let start: u64 = self
            .redis
            .hget(&key, "start")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(start + READING_EXPIRY_SECS > now_epoch())
    }

    /// True when accumulated settings are ready to consume.
    pub async fn is_ready(&self, uid: &str) -> Result<bool> {
        let key = Self::settings_key(uid);
        Ok(self.redis.hexists(&key, "data").await? && !self.redis.hexists(&key, "reading").await?)
    }

    /// Mark the start of a settings read for a task.
    pub async fn start_reading(&self, uid: &str, task: &str) -> Result<()> {
        let key = Self::settings_key(uid);
        self.redis.hset(&key, "task", task).await?;
        self.redis.hset(&key, "reading", "1").await?;
        self.redis.hset(&key, "start", &now_epoch().to_string()).await?;
        Ok(())
    }

    /// Append a received settings chunk.
    pub async fn add_settings(&self, uid: &str, chunk: &str) -> Result<()> {
        let key = Self::settings_key(uid);
        let mut data = self.redis.hget(&key, "data").await?.unwrap_or_default();
        data.push_str(chunk);
        data.push(',');
        self.redis.hset(&key, "data", &data).await?;
        Ok(())
    }

    /// Mark the accumulated settings as complete.
    pub async fn finish_reading(&self, uid: &str) -> Result<()> {
        self.redis.hdel(&Self::settings_key(uid), "reading").await?;
        Ok(())
    }

    /// Accumulated settings data, if any.
    pub async fn settings(&self, uid: &str) -> Result<Option<String>> {
        Ok(self.redis.hget(&Self::settings_key(uid), "data").await?)
    }

    /// Drop everything stored for a device.
    pub async fn delete(&self, uid: &str) -> Result<()> {
        self.redis.del(&Self::settings_key(uid)).await?;
        Ok(())
    }

    /// Pending command descriptions from `tracker_action{uid}` field `d`.
    pub async fn pending_actions(&self, uid: &str) -> Result<Vec<Value>> {
        Self::json_list(self.redis.hget(&Self::action_key(uid), "d").await?)
    }

    /// Gateway-wide command descriptions from `tracker_controller` field `d`.
    pub async fn controller_actions(&self) -> Result<Vec<Value>> {
        Self::json_list(self.redis.hget("tracker_controller", "d").await?)
    }

    fn json_list(raw: Option<String>) -> Result<Vec<Value>> {
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        let value: Value = serde_json::from_str(&raw)?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    /// Stored configuration frame for a device (hex under `data`), used by
    /// the Teltonika provisioning callback.
    pub async fn config_frame(&self, uid: &str) -> Result<Option<Vec<u8>>> {
        if !self.is_ready(uid).await? {
            return Ok(None);
        }
        let Some(data) = self.settings(uid).await? else {
            return Ok(None);
        };
        let trimmed = data.trim_end_matches(',');
        Ok(hex::decode(trimmed).ok())
    }
}
