//! Per-session event-sourced trajectory with debounced persistence.
//!
//! All producers for a session (main task events, worker progress, lifecycle
//! markers) go through [`TrajectoryLog::ingest`]. Each accepted mutation
//! schedules a debounced flush; `task.start` and terminal events flush
//! immediately. A flush merges the trajectory into the session's metadata
//! blob rather than overwriting it.

pub mod session;

pub use session::{PreviewSnapshot, TraceItem, TrajectorySession, TrajectorySnapshot, WorkerProgress};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::{EnrichedEvent, EventState, TabId};
use crate::store::{MessageSummary, SessionMessage, SessionStats, SessionStore};
use crate::worker::classify;

/// Message kind for the mirrored first trace item.
pub const ROOT_MESSAGE_KIND: &str = "trajectory_root";
/// Message kind for the mirrored terminal output.
pub const FINAL_MESSAGE_KIND: &str = "final_output";

const EVICTION_CHANNEL_CAPACITY: usize = 256;

/// A loaded session plus its pending timers.
struct Slot {
    session: TrajectorySession,
    debounce: Option<JoinHandle<()>>,
    debounce_generation: u64,
    eviction: Option<JoinHandle<()>>,
    eviction_generation: u64,
}

impl Slot {
    fn new(session: TrajectorySession) -> Self {
        Self {
            session,
            debounce: None,
            debounce_generation: 0,
            eviction: None,
            eviction_generation: 0,
        }
    }

    fn cancel_debounce(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        self.debounce_generation += 1;
    }

    fn cancel_eviction(&mut self) {
        if let Some(handle) = self.eviction.take() {
            handle.abort();
        }
        self.eviction_generation += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FlushMode {
    #[default]
    Skip,
    Debounced,
    Immediate,
}

/// Work left to do after the session lock is released.
#[derive(Default)]
struct Effects {
    flush: FlushMode,
    reopened: bool,
    mirror_root: Option<String>,
    mirror_final: Option<String>,
    stats: Option<SessionStats>,
    summary: Option<MessageSummary>,
}

/// Trajectory records for every live session.
pub struct TrajectoryLog {
    store: Arc<dyn SessionStore>,
    sessions: Mutex<HashMap<String, Slot>>,
    /// Serializes flushes so each read-merge-write sees the previous one.
    flush_lock: Mutex<()>,
    debounce: Duration,
    eviction_grace: Duration,
    /// Session ids whose record was dropped from memory.
    evictions: broadcast::Sender<String>,
}

impl TrajectoryLog {
    pub fn new(store: Arc<dyn SessionStore>, debounce: Duration, eviction_grace: Duration) -> Self {
        let (evictions, _) = broadcast::channel(EVICTION_CHANNEL_CAPACITY);
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            debounce,
            eviction_grace,
            evictions,
        }
    }

    /// Notified with the session id each time an ended session is evicted.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<String> {
        self.evictions.subscribe()
    }

    /// Record one enriched event. Returns false for duplicates.
    pub async fn ingest(self: &Arc<Self>, event: &EnrichedEvent) -> bool {
        let session_id = event.session_id().to_string();
        self.ensure_loaded(&session_id).await;

        let effects = {
            let mut sessions = self.sessions.lock().await;
            let Some(slot) = sessions.get_mut(&session_id) else {
                return false;
            };
            if !slot.session.mark_seen(&event.event_id) {
                debug!(
                    session_id = %session_id,
                    event_id = %event.event_id,
                    "Duplicate event ignored"
                );
                return false;
            }

            let effects = apply(&mut slot.session, event);
            if effects.reopened {
                slot.cancel_eviction();
            }
            match effects.flush {
                FlushMode::Debounced => self.schedule_flush(&session_id, slot),
                FlushMode::Immediate => slot.cancel_debounce(),
                FlushMode::Skip => {}
            }
            effects
        };

        if effects.flush == FlushMode::Immediate {
            self.flush_logged(&session_id).await;
        }
        self.run_effects(&session_id, effects).await;
        true
    }

    /// Reconnect path: the in-memory session, the persisted one, or a new one.
    pub async fn get_or_create(&self, session_id: &str) -> TrajectorySnapshot {
        self.ensure_loaded(session_id).await;
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|slot| slot.session.snapshot())
            .unwrap_or_default()
    }

    /// In-memory view of a session, if loaded.
    pub async fn snapshot(&self, session_id: &str) -> Option<TrajectorySnapshot> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(|slot| slot.session.snapshot())
    }

    pub async fn is_loaded(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Keep a tab's final screenshot with the session.
    pub async fn record_final_preview(&self, session_id: &str, tab_id: TabId, bytes: Vec<u8>) {
        self.ensure_loaded(session_id).await;
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(session_id) {
            slot.session.set_preview(tab_id, bytes);
        }
    }

    pub async fn previews(&self, session_id: &str) -> Vec<PreviewSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|slot| slot.session.previews.clone())
            .unwrap_or_default()
    }

    /// Write the session's trajectory into its metadata blob now.
    pub async fn flush(&self, session_id: &str) -> Result<(), StoreError> {
        let _guard = self.flush_lock.lock().await;
        // Snapshot after acquiring the flush lock so an older flush can
        // never land on top of a newer one.
        let patch = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(slot) => slot.session.persisted_patch(),
                None => return Ok(()),
            }
        };
        self.store.merge_metadata(session_id, &patch).await?;
        debug!(session_id = %session_id, "Trajectory flushed");
        Ok(())
    }

    /// Freeze a session: cancel the pending flush, flush now, and evict the
    /// record after the grace period. Calling again restarts the grace period.
    pub async fn end_session(self: &Arc<Self>, session_id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(slot) = sessions.get_mut(session_id) else {
                return;
            };
            slot.cancel_debounce();
            slot.cancel_eviction();
            slot.session.completed = true;

            let generation = slot.eviction_generation;
            let log = Arc::clone(self);
            let sid = session_id.to_string();
            let grace = self.eviction_grace;
            slot.eviction = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let mut sessions = log.sessions.lock().await;
                let evict = sessions
                    .get(&sid)
                    .is_some_and(|slot| {
                        slot.eviction_generation == generation && slot.session.completed
                    });
                if evict {
                    sessions.remove(&sid);
                    drop(sessions);
                    debug!(session_id = %sid, "Trajectory evicted");
                    let _ = log.evictions.send(sid);
                }
            }));
        }
        self.flush_logged(session_id).await;
    }

    /// Mark a worker's progress entry with its final status and flush.
    /// The parent session stays live.
    pub async fn finish_worker(
        &self,
        session_id: &str,
        worker_index: u32,
        task_id: Uuid,
        status: &str,
    ) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(slot) = sessions.get_mut(session_id) else {
                return;
            };
            let message = slot
                .session
                .workers
                .iter()
                .find(|w| w.worker_index == worker_index)
                .map(|w| w.message.clone())
                .unwrap_or_default();
            slot.session.upsert_worker(WorkerProgress {
                worker_index,
                task_id,
                state: status.to_string(),
                message,
                updated_at: Utc::now().timestamp_millis(),
            });
            slot.cancel_debounce();
        }
        self.flush_logged(session_id).await;
    }

    async fn ensure_loaded(&self, session_id: &str) {
        if self.sessions.lock().await.contains_key(session_id) {
            return;
        }

        let adopted = match self.store.get_metadata(session_id).await {
            Ok(Some(blob)) => TrajectorySession::adopt(session_id, &blob),
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load persisted trajectory");
                None
            }
        };
        let session = match adopted {
            Some(session) => {
                info!(
                    session_id = %session_id,
                    root_id = %session.root_id(),
                    items = session.items.len(),
                    "Adopted persisted trajectory"
                );
                session
            }
            None => TrajectorySession::new(session_id),
        };

        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Slot::new(session));
    }

    fn schedule_flush(self: &Arc<Self>, session_id: &str, slot: &mut Slot) {
        slot.cancel_debounce();
        let generation = slot.debounce_generation;
        let log = Arc::clone(self);
        let sid = session_id.to_string();
        let delay = self.debounce;

        slot.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut sessions = log.sessions.lock().await;
                match sessions.get_mut(&sid) {
                    // Detach from the slot so a later reschedule can't abort
                    // this flush halfway through.
                    Some(slot) if slot.debounce_generation == generation => slot.debounce = None,
                    _ => return,
                }
            }
            log.flush_logged(&sid).await;
        }));
    }

    async fn flush_logged(&self, session_id: &str) {
        if let Err(e) = self.flush(session_id).await {
            warn!(session_id = %session_id, error = %e, "Trajectory flush failed");
        }
    }

    async fn run_effects(&self, session_id: &str, effects: Effects) {
        if let Some(content) = effects.mirror_root {
            self.mirror_message(session_id, ROOT_MESSAGE_KIND, content).await;
        }
        if let Some(content) = effects.mirror_final {
            self.mirror_message(session_id, FINAL_MESSAGE_KIND, content).await;
        }
        if let Some(stats) = effects.stats
            && let Err(e) = self.store.save_session_stats(session_id, &stats).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to persist session stats");
        }
        if let Some(summary) = effects.summary
            && let Err(e) = self.store.save_message_summary(session_id, &summary).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to persist message summary");
        }
    }

    async fn mirror_message(&self, session_id: &str, kind: &str, content: String) {
        match self.store.list_messages(session_id).await {
            Ok(existing) if existing.iter().any(|m| m.content == content) => {
                debug!(session_id = %session_id, kind, "Message already mirrored");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read session messages");
                return;
            }
        }

        let message = SessionMessage {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            role: "assistant".to_string(),
            kind: kind.to_string(),
            content,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_message(session_id, &message).await {
            warn!(session_id = %session_id, error = %e, "Failed to mirror trajectory message");
        }
    }
}

/// Run one event through the per-state table.
fn apply(session: &mut TrajectorySession, event: &EnrichedEvent) -> Effects {
    let mut effects = Effects::default();
    let state = event.state();
    let details = event.event.details().trim();

    if state == EventState::StepStreaming {
        return effects;
    }

    if let Some(worker_index) = event.worker_index() {
        session.upsert_worker(WorkerProgress {
            worker_index,
            task_id: event.context.task_id,
            state: state.as_str().to_string(),
            message: details.to_string(),
            updated_at: event.event.timestamp,
        });
        effects.flush = FlushMode::Debounced;
    }

    match state {
        EventState::TaskStart => {
            if session.completed {
                session.completed = false;
                session.terminal_seen = false;
                session.final_mirrored = false;
                effects.reopened = true;
            }
            if !details.is_empty() {
                session.push(TraceItem::from_event(event, details.to_string()));
            }
            effects.flush = FlushMode::Immediate;
        }
        EventState::ActStart | EventState::ActOk | EventState::Thinking => {
            let content = if details.is_empty() {
                default_text(&state).to_string()
            } else {
                details.to_string()
            };
            session.push(TraceItem::from_event(event, content));
            effects.flush = FlushMode::Debounced;
        }
        EventState::TaskOk | EventState::TaskFail | EventState::TaskCancel
            if event.worker_index().is_some() =>
        {
            // A worker finishing a subtask does not end the parent session.
            if !details.is_empty() && !session.repeats_last(event.event.actor, details) {
                session.push(TraceItem::from_event(event, details.to_string()));
            }
            effects.flush = FlushMode::Debounced;
        }
        EventState::TaskOk | EventState::TaskFail | EventState::TaskCancel => {
            let content = if details.is_empty() {
                default_text(&state)
            } else {
                details
            };
            if !session.repeats_last(event.event.actor, content) {
                session.push(TraceItem::from_event(event, content.to_string()));
            }

            if session.terminal_seen {
                debug!(
                    session_id = %session.session_id,
                    state = %state,
                    "Later terminal event recorded for audit only"
                );
            } else {
                session.terminal_seen = true;
                session.completed = true;
                if let Some(usage) = event.event.usage() {
                    session.total_cost += usage.cost;
                }
                effects.stats = Some(session.stats(state.as_str()));
                effects.summary = session::summary_for(event);
                if !session.final_mirrored && !details.is_empty() && !classify::is_boilerplate(details)
                {
                    session.final_mirrored = true;
                    effects.mirror_final = Some(details.to_string());
                }
            }
            effects.flush = FlushMode::Immediate;
        }
        _ => {
            if !details.is_empty() {
                session.push(TraceItem::from_event(event, details.to_string()));
                effects.flush = FlushMode::Debounced;
            }
        }
    }

    if !session.root_mirrored
        && let Some(first) = session.items.first()
    {
        session.root_mirrored = true;
        effects.mirror_root = Some(first.content.clone());
    }
    effects
}

fn default_text(state: &EventState) -> &'static str {
    match state {
        EventState::ActStart => "Performing action",
        EventState::ActOk => "Action completed",
        EventState::Thinking => "Thinking",
        EventState::TaskOk => "Task completed",
        EventState::TaskFail => "Task failed",
        EventState::TaskCancel => "Task cancelled",
        _ => "",
    }
}
