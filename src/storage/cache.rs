//! Timeline snapshot cache.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::Post;

/// Ephemeral store for merged timelines, keyed by owner.
#[async_trait]
pub trait TimelineCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<Post>>>;

    async fn set(&self, key: &str, posts: Vec<Post>) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<Post>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimelineCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<Post>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, posts: Vec<Post>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), posts);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
