//! In-process `SessionStore` used by tests and the replay binary.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::{MessageSummary, SessionMessage, SessionStats, SessionStore};

#[derive(Default)]
struct Tables {
    messages: HashMap<String, Vec<SessionMessage>>,
    metadata: HashMap<String, Value>,
    stats: HashMap<String, SessionStats>,
    summaries: HashMap<String, Vec<MessageSummary>>,
}

/// Hash-map backed store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    metadata_writes: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set_metadata` calls so far (flush counting in tests).
    pub fn metadata_writes(&self) -> usize {
        self.metadata_writes
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn append_message(
        &self,
        session_id: &str,
        message: &SessionMessage,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_metadata(&self, session_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.tables.read().await.metadata.get(session_id).cloned())
    }

    async fn set_metadata(&self, session_id: &str, value: &Value) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .metadata
            .insert(session_id.to_string(), value.clone());
        self.metadata_writes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn save_session_stats(
        &self,
        session_id: &str,
        stats: &SessionStats,
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .stats
            .insert(session_id.to_string(), stats.clone());
        Ok(())
    }

    async fn get_session_stats(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionStats>, StoreError> {
        Ok(self.tables.read().await.stats.get(session_id).cloned())
    }

    async fn save_message_summary(
        &self,
        session_id: &str,
        summary: &MessageSummary,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let list = tables.summaries.entry(session_id.to_string()).or_default();
        match list.iter_mut().find(|s| s.event_id == summary.event_id) {
            Some(existing) => *existing = summary.clone(),
            None => list.push(summary.clone()),
        }
        Ok(())
    }

    async fn list_message_summaries(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageSummary>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .summaries
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
