//! `SessionStore` trait: the persistence contract the core depends on.
//!
//! No schema is assumed beyond "blob keyed by session id" plus a message
//! list and two summary tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A message in a session's permanent log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub role: String,
    /// What produced the message, e.g. `trajectory_root` or `final_output`.
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate statistics written once when a session completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub item_count: usize,
    pub action_count: usize,
    pub error_count: usize,
    pub worker_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub final_state: String,
    pub total_cost: Decimal,
}

/// Cost/latency summary for one model-backed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub event_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    pub latency_ms: u64,
}

/// Backend-agnostic session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(
        &self,
        session_id: &str,
        message: &SessionMessage,
    ) -> Result<(), StoreError>;

    async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, StoreError>;

    // ── Metadata blob ───────────────────────────────────────────────

    async fn get_metadata(&self, session_id: &str) -> Result<Option<Value>, StoreError>;

    async fn set_metadata(&self, session_id: &str, value: &Value) -> Result<(), StoreError>;

    /// Read the current blob, deep-merge `patch` into it, write it back.
    /// Keys absent from `patch` are preserved.
    async fn merge_metadata(&self, session_id: &str, patch: &Value) -> Result<Value, StoreError> {
        let mut current = self
            .get_metadata(session_id)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        super::merge_json(&mut current, patch);
        self.set_metadata(session_id, &current).await?;
        Ok(current)
    }

    // ── Statistics ──────────────────────────────────────────────────

    async fn save_session_stats(
        &self,
        session_id: &str,
        stats: &SessionStats,
    ) -> Result<(), StoreError>;

    async fn get_session_stats(&self, session_id: &str)
    -> Result<Option<SessionStats>, StoreError>;

    async fn save_message_summary(
        &self,
        session_id: &str,
        summary: &MessageSummary,
    ) -> Result<(), StoreError>;

    async fn list_message_summaries(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageSummary>, StoreError>;
}
