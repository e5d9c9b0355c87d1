//! In-memory trajectory records.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::events::{Actor, EnrichedEvent, PageContext, TabId};
use crate::store::{MessageSummary, SessionStats};

/// One entry of a session's trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceItem {
    pub actor: Actor,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Raw state tag the item was produced from.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl TraceItem {
    pub fn from_event(event: &EnrichedEvent, content: String) -> Self {
        Self {
            actor: event.event.actor,
            content,
            timestamp: event.event.timestamp,
            state: event.state().as_str().to_string(),
            event_id: Some(event.event_id.clone()),
            page: event.event.page().cloned(),
            action: event.event.action().map(str::to_string),
            is_error: event.event.is_error(),
        }
    }
}

/// Latest progress reported by one worker of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgress {
    pub worker_index: u32,
    pub task_id: Uuid,
    pub state: String,
    pub message: String,
    pub updated_at: i64,
}

/// Final screenshot of a tab, kept in memory only.
#[derive(Debug, Clone)]
pub struct PreviewSnapshot {
    pub tab_id: TabId,
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Persisted shape of a trajectory, also handed to readers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectorySnapshot {
    pub root_id: String,
    #[serde(default)]
    pub items: Vec<TraceItem>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub workers: Vec<WorkerProgress>,
}

/// Trajectory state for one session.
#[derive(Debug)]
pub struct TrajectorySession {
    pub session_id: String,
    /// Never changes once minted or adopted.
    root_id: String,
    pub items: Vec<TraceItem>,
    seen: HashSet<String>,
    pub completed: bool,
    pub workers: Vec<WorkerProgress>,
    pub previews: Vec<PreviewSnapshot>,
    pub started_at: DateTime<Utc>,
    pub total_cost: Decimal,
    /// First terminal event already handled (stats written).
    pub terminal_seen: bool,
    pub root_mirrored: bool,
    pub final_mirrored: bool,
}

impl TrajectorySession {
    /// Fresh session with a newly minted root id.
    pub fn new(session_id: &str) -> Self {
        Self::with_root(session_id, format!("root_{}", Uuid::new_v4().simple()))
    }

    fn with_root(session_id: &str, root_id: String) -> Self {
        Self {
            session_id: session_id.to_string(),
            root_id,
            items: Vec::new(),
            seen: HashSet::new(),
            completed: false,
            workers: Vec::new(),
            previews: Vec::new(),
            started_at: Utc::now(),
            total_cost: Decimal::ZERO,
            terminal_seen: false,
            root_mirrored: false,
            final_mirrored: false,
        }
    }

    /// Rebuild a session from its persisted metadata blob, if the blob holds
    /// a root id for this session.
    pub fn adopt(session_id: &str, blob: &Value) -> Option<Self> {
        let root_id = blob
            .get("rootIds")
            .and_then(|ids| ids.get(session_id))
            .and_then(Value::as_str)?
            .to_string();

        let persisted: TrajectorySnapshot = blob
            .get("trajectory")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok())
            .filter(|t: &TrajectorySnapshot| t.root_id == root_id)
            .unwrap_or_default();

        let mut session = Self::with_root(session_id, root_id);
        session.seen = persisted
            .items
            .iter()
            .filter_map(|item| item.event_id.clone())
            .collect();
        session.root_mirrored = !persisted.items.is_empty();
        session.final_mirrored = persisted.completed;
        session.terminal_seen = persisted.completed;
        session.completed = persisted.completed;
        session.items = persisted.items;
        session.workers = persisted.workers;
        Some(session)
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    /// Mark an event id as recorded. Returns false if it was already seen.
    pub fn mark_seen(&mut self, event_id: &str) -> bool {
        self.seen.insert(event_id.to_string())
    }

    /// Append an item. No-op if its event id was already recorded.
    pub fn push(&mut self, item: TraceItem) -> bool {
        if let Some(id) = &item.event_id
            && self.items.iter().any(|i| i.event_id.as_ref() == Some(id))
        {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Whether `content` repeats the last item from the same actor.
    pub fn repeats_last(&self, actor: Actor, content: &str) -> bool {
        self.items
            .iter()
            .rev()
            .find(|i| i.actor == actor)
            .is_some_and(|i| i.content == content)
    }

    /// Replace-by-worker-index.
    pub fn upsert_worker(&mut self, progress: WorkerProgress) {
        match self
            .workers
            .iter_mut()
            .find(|w| w.worker_index == progress.worker_index)
        {
            Some(existing) => *existing = progress,
            None => {
                self.workers.push(progress);
                self.workers.sort_by_key(|w| w.worker_index);
            }
        }
    }

    pub fn set_preview(&mut self, tab_id: TabId, bytes: Vec<u8>) {
        self.previews.retain(|p| p.tab_id != tab_id);
        self.previews.push(PreviewSnapshot {
            tab_id,
            bytes,
            captured_at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> TrajectorySnapshot {
        TrajectorySnapshot {
            root_id: self.root_id.clone(),
            items: self.items.clone(),
            completed: self.completed,
            workers: self.workers.clone(),
        }
    }

    /// Patch merged into the session's metadata blob on flush.
    pub fn persisted_patch(&self) -> Value {
        let mut root_ids = serde_json::Map::new();
        root_ids.insert(self.session_id.clone(), json!(self.root_id));
        json!({
            "trajectory": self.snapshot(),
            "rootIds": root_ids,
        })
    }

    pub fn stats(&self, final_state: &str) -> SessionStats {
        SessionStats {
            item_count: self.items.len(),
            action_count: self.items.iter().filter(|i| i.action.is_some()).count(),
            error_count: self.items.iter().filter(|i| i.is_error).count(),
            worker_count: self.workers.len(),
            started_at: self.started_at,
            completed_at: Utc::now(),
            final_state: final_state.to_string(),
            total_cost: self.total_cost,
        }
    }
}

/// Summary row for a terminal event carrying usage.
pub fn summary_for(event: &EnrichedEvent) -> Option<MessageSummary> {
    event.event.usage().map(|usage| MessageSummary {
        event_id: event.event_id.clone(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost: usage.cost,
        latency_ms: usage.latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(event_id: &str, actor: Actor, content: &str) -> TraceItem {
        TraceItem {
            actor,
            content: content.into(),
            timestamp: 1,
            state: "act.ok".into(),
            event_id: Some(event_id.into()),
            page: None,
            action: Some("click".into()),
            is_error: false,
        }
    }

    #[test]
    fn adopt_keeps_root_and_items() {
        let mut original = TrajectorySession::new("s1");
        original.push(item("evt_a", Actor::Navigator, "clicked"));
        original.mark_seen("evt_a");
        let mut blob = serde_json::json!({"title": "unrelated"});
        crate::store::merge_json(&mut blob, &original.persisted_patch());

        let adopted = TrajectorySession::adopt("s1", &blob).unwrap();
        assert_eq!(adopted.root_id(), original.root_id());
        assert_eq!(adopted.items, original.items);
        assert!(adopted.has_seen("evt_a"));
        assert!(adopted.root_mirrored);
    }

    #[test]
    fn adopt_requires_root_for_session() {
        let blob = serde_json::json!({"rootIds": {"other": "root_x"}});
        assert!(TrajectorySession::adopt("s1", &blob).is_none());
    }

    #[test]
    fn push_ignores_duplicate_event_ids() {
        let mut session = TrajectorySession::new("s");
        assert!(session.push(item("evt_1", Actor::Navigator, "a")));
        assert!(!session.push(item("evt_1", Actor::Navigator, "a")));
        assert_eq!(session.items.len(), 1);
    }

    #[test]
    fn repeats_last_looks_at_same_actor_only() {
        let mut session = TrajectorySession::new("s");
        session.push(item("e1", Actor::Navigator, "done"));
        session.push(item("e2", Actor::Planner, "plan"));
        assert!(session.repeats_last(Actor::Navigator, "done"));
        assert!(!session.repeats_last(Actor::Planner, "done"));
        assert!(!session.repeats_last(Actor::System, "done"));
    }

    #[test]
    fn worker_progress_replaced_by_index() {
        let mut session = TrajectorySession::new("s");
        let task_id = Uuid::new_v4();
        for (idx, msg) in [(2, "a"), (1, "b"), (2, "c")] {
            session.upsert_worker(WorkerProgress {
                worker_index: idx,
                task_id,
                state: "act.ok".into(),
                message: msg.into(),
                updated_at: 0,
            });
        }
        assert_eq!(session.workers.len(), 2);
        assert_eq!(session.workers[0].worker_index, 1);
        assert_eq!(session.workers[1].message, "c");
    }

    #[test]
    fn stats_count_actions_and_errors() {
        let mut session = TrajectorySession::new("s");
        session.push(item("e1", Actor::Navigator, "a"));
        let mut failed = item("e2", Actor::Navigator, "b");
        failed.is_error = true;
        failed.action = None;
        session.push(failed);
        let stats = session.stats("task.fail");
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.action_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.final_state, "task.fail");
    }
}
