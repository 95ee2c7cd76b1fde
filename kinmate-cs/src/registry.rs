//! Per-user assistant cache
//!
//! Assistant handles are expensive to build, so one is kept per active user
//! and dropped when the session is finalized.

use crate::collaborators::{Assistant, AssistantFactory};
use kinmate_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct AssistantRegistry {
    factory: Arc<dyn AssistantFactory>,
    assistants: RwLock<HashMap<String, Arc<dyn Assistant>>>,
}

impl AssistantRegistry {
    pub fn new(factory: Arc<dyn AssistantFactory>) -> Self {
        Self {
            factory,
            assistants: RwLock::new(HashMap::new()),
        }
    }

    /// Cached assistant for `user_id`, built on first use
    pub async fn get_or_create(&self, user_id: &str) -> Result<Arc<dyn Assistant>> {
        if let Some(assistant) = self.assistants.read().await.get(user_id) {
            return Ok(Arc::clone(assistant));
        }

        let mut assistants = self.assistants.write().await;
        // Another task may have built it while we waited for the write lock
        if let Some(assistant) = assistants.get(user_id) {
            return Ok(Arc::clone(assistant));
        }
        let assistant = self.factory.create(user_id).await?;
        info!(user_id, "Created assistant");
        assistants.insert(user_id.to_string(), Arc::clone(&assistant));
        Ok(assistant)
    }

    /// Drop the cached assistant; returns whether one existed
    pub async fn release(&self, user_id: &str) -> bool {
        let removed = self.assistants.write().await.remove(user_id).is_some();
        debug!(user_id, removed, "Released assistant");
        removed
    }

    pub async fn len(&self) -> usize {
        self.assistants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assistants.read().await.is_empty()
    }
}
