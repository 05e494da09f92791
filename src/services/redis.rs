//! Redis-backed draft store

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde_json::Value;

use super::drafts::DraftStore;
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct RedisDraftStore {
    client: Client,
    ttl_secs: u64,
}

impl RedisDraftStore {
    /// Connect and check the server answers before handing out the store
    pub async fn new(url: &str, ttl_secs: u64) -> AppResult<Self> {
        let client = Client::open(url)
            .map_err(|e| AppError::Internal(format!("Failed to create Redis client: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to connect to Redis: {}", e)))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::Internal(format!("Redis connection test failed: {}", e)))?;

        Ok(Self { client, ttl_secs })
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to get Redis connection: {}", e)))
    }
}

fn draft_key(key: &str) -> String {
    format!("draft:{}", key)
}

#[async_trait]
impl DraftStore for RedisDraftStore {
    async fn save_draft(&self, key: &str, payload: &Value) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let body = serde_json::to_string(payload)?;
        conn.set_ex::<_, _, ()>(draft_key(key), body, self.ttl_secs)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to store draft in Redis: {}", e)))
    }

    async fn load_draft(&self, key: &str) -> AppResult<Option<Value>> {
        let mut conn = self.connection().await?;
        let stored: Option<String> = conn
            .get(draft_key(key))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to read draft from Redis: {}", e)))?;

        match stored {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn clear_draft(&self, key: &str) -> AppResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(draft_key(key))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to delete draft from Redis: {}", e)))
    }
}
