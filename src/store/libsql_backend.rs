//! libSQL backend: durable `SessionStore` implementation.
//!
//! Supports local file and in-memory databases. Metadata blobs and stats are
//! stored as JSON text.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{MessageSummary, SessionMessage, SessionStats, SessionStore};

/// libSQL session store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Session store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn next_message_seq(&self, session_id: &str) -> Result<i64, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(seq), 0) FROM session_messages WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("next_message_seq: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) + 1),
            Ok(None) => Ok(1),
            Err(e) => Err(StoreError::Query(format!("next_message_seq: {e}"))),
        }
    }
}

/// Parse an RFC 3339 string, falling back to the epoch minimum.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl SessionStore for LibSqlStore {
    async fn append_message(
        &self,
        session_id: &str,
        message: &SessionMessage,
    ) -> Result<(), StoreError> {
        let seq = self.next_message_seq(session_id).await?;
        self.conn
            .execute(
                "INSERT INTO session_messages (id, session_id, role, kind, content, created_at, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.as_str(),
                    session_id,
                    message.role.as_str(),
                    message.kind.as_str(),
                    message.content.as_str(),
                    message.created_at.to_rfc3339(),
                    seq
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message: {e}")))?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, role, kind, content, created_at FROM session_messages
                 WHERE session_id = ?1 ORDER BY seq",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_messages: {e}")))?
        {
            let read = |idx: i32| -> Result<String, StoreError> {
                row.get::<String>(idx)
                    .map_err(|e| StoreError::Query(format!("list_messages column {idx}: {e}")))
            };
            messages.push(SessionMessage {
                id: read(0)?,
                role: read(1)?,
                kind: read(2)?,
                content: read(3)?,
                created_at: parse_datetime(&read(4)?),
            });
        }
        Ok(messages)
    }

    async fn get_metadata(&self, session_id: &str) -> Result<Option<Value>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT metadata FROM session_metadata WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_metadata: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row.get(0).unwrap_or_else(|_| "{}".to_string());
                Ok(Some(serde_json::from_str(&raw)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_metadata: {e}"))),
        }
    }

    async fn set_metadata(&self, session_id: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.conn
            .execute(
                "INSERT INTO session_metadata (session_id, metadata, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE SET
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at",
                params![session_id, raw],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_metadata: {e}")))?;
        Ok(())
    }

    async fn save_session_stats(
        &self,
        session_id: &str,
        stats: &SessionStats,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(stats)?;
        self.conn
            .execute(
                "INSERT INTO session_stats (session_id, stats, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(session_id) DO UPDATE SET
                    stats = excluded.stats,
                    updated_at = excluded.updated_at",
                params![session_id, raw],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_session_stats: {e}")))?;
        Ok(())
    }

    async fn get_session_stats(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionStats>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT stats FROM session_stats WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_session_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_session_stats: {e}")))?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_session_stats: {e}"))),
        }
    }

    async fn save_message_summary(
        &self,
        session_id: &str,
        summary: &MessageSummary,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO message_summaries
                    (session_id, event_id, input_tokens, output_tokens, cost, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    summary.event_id.as_str(),
                    summary.input_tokens as i64,
                    summary.output_tokens as i64,
                    summary.cost.to_string(),
                    summary.latency_ms as i64
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_message_summary: {e}")))?;
        Ok(())
    }

    async fn list_message_summaries(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageSummary>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT event_id, input_tokens, output_tokens, cost, latency_ms
                 FROM message_summaries WHERE session_id = ?1 ORDER BY created_at, event_id",
                params![session_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_message_summaries: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_message_summaries: {e}")))?
        {
            let cost: String = row.get(3).unwrap_or_else(|_| "0".to_string());
            summaries.push(MessageSummary {
                event_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("list_message_summaries: {e}")))?,
                input_tokens: row.get::<i64>(1).unwrap_or(0).max(0) as u64,
                output_tokens: row.get::<i64>(2).unwrap_or(0).max(0) as u64,
                cost: Decimal::from_str(&cost).unwrap_or(Decimal::ZERO),
                latency_ms: row.get::<i64>(4).unwrap_or(0).max(0) as u64,
            });
        }
        Ok(summaries)
    }
}
