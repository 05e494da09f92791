//! Local drafts of unsaved form data
//!
//! A draft is written before a save is attempted and cleared once the save
//! succeeds, so a failed save leaves the user's input recoverable.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{error::AppResult, repository::lock};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn save_draft(&self, key: &str, payload: &Value) -> AppResult<()>;

    async fn load_draft(&self, key: &str) -> AppResult<Option<Value>>;

    async fn clear_draft(&self, key: &str) -> AppResult<()>;
}

/// Process-local draft store, used when Redis is unavailable
#[derive(Default)]
pub struct MemoryDraftStore {
    drafts: Mutex<HashMap<String, Value>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.drafts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn save_draft(&self, key: &str, payload: &Value) -> AppResult<()> {
        lock(&self.drafts).insert(key.to_string(), payload.clone());
        Ok(())
    }

    async fn load_draft(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(lock(&self.drafts).get(key).cloned())
    }

    async fn clear_draft(&self, key: &str) -> AppResult<()> {
        lock(&self.drafts).remove(key);
        Ok(())
    }
}
