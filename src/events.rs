//! Executor event model.
//!
//! Executors deliver loosely-shaped `{actor, state, data, timestamp}` records.
//! They are converted once, at the boundary, into [`ExecutionEvent`] whose
//! payload is a closed union keyed on the event state. Everything downstream
//! (task manager, trajectory, worker capture) matches on [`EventPayload`].

use std::fmt::Write as _;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::tasks::model::TaskColor;

/// Browser tab (resource) identifier.
pub type TabId = i64;

/// Characters of `details` mixed into the event id.
const ID_DETAILS_PREFIX: usize = 120;

/// Digest bytes kept in an event id (16 hex chars).
const ID_DIGEST_BYTES: usize = 8;

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    System,
    User,
    Planner,
    Navigator,
    Validator,
    Worker,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Planner => "planner",
            Self::Navigator => "navigator",
            Self::Validator => "validator",
            Self::Worker => "worker",
        }
    }

    /// Parse an actor name; unknown actors are attributed to the system.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "user" => Self::User,
            "planner" => Self::Planner,
            "navigator" => Self::Navigator,
            "validator" => Self::Validator,
            "worker" => Self::Worker,
            _ => Self::System,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `state` tag of an executor event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventState {
    TaskStart,
    TaskOk,
    TaskFail,
    TaskCancel,
    StepStart,
    StepOk,
    StepFail,
    ActStart,
    ActOk,
    ActFail,
    Thinking,
    TabCreated,
    StepStreaming,
    Other(String),
}

impl EventState {
    pub fn parse(s: &str) -> Self {
        match s {
            "task.start" => Self::TaskStart,
            "task.ok" => Self::TaskOk,
            "task.fail" => Self::TaskFail,
            "task.cancel" => Self::TaskCancel,
            "step.start" => Self::StepStart,
            "step.ok" => Self::StepOk,
            "step.fail" => Self::StepFail,
            "act.start" => Self::ActStart,
            "act.ok" => Self::ActOk,
            "act.fail" => Self::ActFail,
            "thinking" => Self::Thinking,
            "tab.created" => Self::TabCreated,
            "step.streaming" => Self::StepStreaming,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskStart => "task.start",
            Self::TaskOk => "task.ok",
            Self::TaskFail => "task.fail",
            Self::TaskCancel => "task.cancel",
            Self::StepStart => "step.start",
            Self::StepOk => "step.ok",
            Self::StepFail => "step.fail",
            Self::ActStart => "act.start",
            Self::ActOk => "act.ok",
            Self::ActFail => "act.fail",
            Self::Thinking => "thinking",
            Self::TabCreated => "tab.created",
            Self::StepStreaming => "step.streaming",
            Self::Other(s) => s,
        }
    }

    /// `task.ok`, `task.fail` or `task.cancel`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskOk | Self::TaskFail | Self::TaskCancel)
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a step or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Ok,
    Fail,
}

/// Page the executor was looking at when the event was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Token and cost accounting attached to a terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub latency_ms: u64,
}

/// Closed set of event payloads, one shape per state family.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    TaskStart {
        details: String,
    },
    TaskOk {
        details: String,
        usage: Option<Usage>,
    },
    TaskFail {
        error: String,
        usage: Option<Usage>,
    },
    TaskCancel {
        details: String,
    },
    Step {
        phase: Phase,
        details: String,
    },
    Action {
        phase: Phase,
        action: String,
        details: String,
        /// Set on the result of the executor's terminal "done" action.
        is_done: bool,
        page: Option<PageContext>,
    },
    Thinking {
        details: String,
    },
    TabCreated {
        tab_id: TabId,
        url: Option<String>,
    },
    Streaming {
        delta: String,
    },
    Other {
        state: String,
        details: String,
    },
}

/// Raw record as delivered by an executor (and as stored in replay files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub actor: String,
    pub state: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// A typed executor event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEvent", into = "RawEvent")]
pub struct ExecutionEvent {
    pub actor: Actor,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(actor: Actor, payload: EventPayload) -> Self {
        Self {
            actor,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Convert a raw record. Unknown states become [`EventPayload::Other`].
    pub fn from_raw(raw: RawEvent) -> Self {
        let data = raw.data.as_object().cloned().unwrap_or_default();
        let details = str_field(&data, &["details", "message", "content"]).unwrap_or_default();
        let usage = data
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
        let state = EventState::parse(&raw.state);

        let payload = match state {
            EventState::TaskStart => EventPayload::TaskStart { details },
            EventState::TaskOk => EventPayload::TaskOk { details, usage },
            EventState::TaskFail => EventPayload::TaskFail {
                error: str_field(&data, &["error"]).unwrap_or(details),
                usage,
            },
            EventState::TaskCancel => EventPayload::TaskCancel { details },
            EventState::StepStart => step(Phase::Start, details),
            EventState::StepOk => step(Phase::Ok, details),
            EventState::StepFail => step(Phase::Fail, details),
            EventState::ActStart | EventState::ActOk | EventState::ActFail => {
                let phase = match state {
                    EventState::ActStart => Phase::Start,
                    EventState::ActOk => Phase::Ok,
                    _ => Phase::Fail,
                };
                let page = str_field(&data, &["url", "pageUrl"]).map(|url| PageContext {
                    url,
                    title: str_field(&data, &["title", "pageTitle"]),
                });
                EventPayload::Action {
                    phase,
                    action: str_field(&data, &["action", "actionName"]).unwrap_or_default(),
                    details,
                    is_done: bool_field(&data, &["isDone", "done"]),
                    page,
                }
            }
            EventState::Thinking => EventPayload::Thinking { details },
            EventState::TabCreated => EventPayload::TabCreated {
                tab_id: data.get("tabId").and_then(Value::as_i64).unwrap_or_default(),
                url: str_field(&data, &["url"]),
            },
            EventState::StepStreaming => EventPayload::Streaming {
                delta: str_field(&data, &["delta"]).unwrap_or(details),
            },
            EventState::Other(state) => EventPayload::Other { state, details },
        };

        Self {
            actor: Actor::parse(&raw.actor),
            timestamp: raw.timestamp,
            payload,
        }
    }

    pub fn state(&self) -> EventState {
        match &self.payload {
            EventPayload::TaskStart { .. } => EventState::TaskStart,
            EventPayload::TaskOk { .. } => EventState::TaskOk,
            EventPayload::TaskFail { .. } => EventState::TaskFail,
            EventPayload::TaskCancel { .. } => EventState::TaskCancel,
            EventPayload::Step { phase, .. } => match phase {
                Phase::Start => EventState::StepStart,
                Phase::Ok => EventState::StepOk,
                Phase::Fail => EventState::StepFail,
            },
            EventPayload::Action { phase, .. } => match phase {
                Phase::Start => EventState::ActStart,
                Phase::Ok => EventState::ActOk,
                Phase::Fail => EventState::ActFail,
            },
            EventPayload::Thinking { .. } => EventState::Thinking,
            EventPayload::TabCreated { .. } => EventState::TabCreated,
            EventPayload::Streaming { .. } => EventState::StepStreaming,
            EventPayload::Other { state, .. } => EventState::Other(state.clone()),
        }
    }

    /// Human-readable content of the event.
    pub fn details(&self) -> &str {
        match &self.payload {
            EventPayload::TaskStart { details }
            | EventPayload::TaskOk { details, .. }
            | EventPayload::TaskCancel { details }
            | EventPayload::Step { details, .. }
            | EventPayload::Action { details, .. }
            | EventPayload::Thinking { details }
            | EventPayload::Other { details, .. } => details,
            EventPayload::TaskFail { error, .. } => error,
            EventPayload::Streaming { delta } => delta,
            EventPayload::TabCreated { .. } => "",
        }
    }

    pub fn action(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Action { action, .. } if !action.is_empty() => Some(action),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&self.payload, EventPayload::Action { is_done: true, .. })
    }

    pub fn page(&self) -> Option<&PageContext> {
        match &self.payload {
            EventPayload::Action { page, .. } => page.as_ref(),
            _ => None,
        }
    }

    pub fn tab_id(&self) -> Option<TabId> {
        match &self.payload {
            EventPayload::TabCreated { tab_id, .. } => Some(*tab_id),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match &self.payload {
            EventPayload::TaskOk { usage, .. } | EventPayload::TaskFail { usage, .. } => {
                usage.as_ref()
            }
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.state(),
            EventState::TaskFail | EventState::StepFail | EventState::ActFail
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Back to the loosely-shaped wire record.
    pub fn to_raw(&self) -> RawEvent {
        let mut data = Map::new();
        match &self.payload {
            EventPayload::TaskStart { details }
            | EventPayload::TaskCancel { details }
            | EventPayload::Step { details, .. }
            | EventPayload::Thinking { details }
            | EventPayload::Other { details, .. } => {
                data.insert("details".into(), json!(details));
            }
            EventPayload::TaskOk { details, usage } => {
                data.insert("details".into(), json!(details));
                if let Some(usage) = usage {
                    data.insert("usage".into(), json!(usage));
                }
            }
            EventPayload::TaskFail { error, usage } => {
                data.insert("details".into(), json!(error));
                data.insert("error".into(), json!(error));
                if let Some(usage) = usage {
                    data.insert("usage".into(), json!(usage));
                }
            }
            EventPayload::Action {
                action,
                details,
                is_done,
                page,
                ..
            } => {
                data.insert("action".into(), json!(action));
                data.insert("details".into(), json!(details));
                if *is_done {
                    data.insert("isDone".into(), json!(true));
                }
                if let Some(page) = page {
                    data.insert("url".into(), json!(page.url));
                    if let Some(title) = &page.title {
                        data.insert("title".into(), json!(title));
                    }
                }
            }
            EventPayload::TabCreated { tab_id, url } => {
                data.insert("tabId".into(), json!(tab_id));
                if let Some(url) = url {
                    data.insert("url".into(), json!(url));
                }
            }
            EventPayload::Streaming { delta } => {
                data.insert("delta".into(), json!(delta));
            }
        }
        RawEvent {
            actor: self.actor.as_str().to_string(),
            state: self.state().as_str().to_string(),
            data: Value::Object(data),
            timestamp: self.timestamp,
        }
    }
}

impl From<RawEvent> for ExecutionEvent {
    fn from(raw: RawEvent) -> Self {
        Self::from_raw(raw)
    }
}

impl From<ExecutionEvent> for RawEvent {
    fn from(event: ExecutionEvent) -> Self {
        event.to_raw()
    }
}

fn step(phase: Phase, details: String) -> EventPayload {
    EventPayload::Step { phase, details }
}

fn str_field(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| data.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn bool_field(data: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| data.get(*k).and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Deterministic id for one logical event within a session.
///
/// Recomputing the id for the same event (e.g. on a retried delivery) yields
/// the same value, which is what the trajectory dedup relies on. Ids are
/// persisted and re-adopted on load, so the digest is SHA-256 rather than a
/// std hasher whose output may change between releases. The emitting task and
/// worker slot are part of the input: sibling workers share their parent's
/// session id.
pub fn event_id(context: &EventContext, event: &ExecutionEvent) -> String {
    let details: String = event.details().chars().take(ID_DETAILS_PREFIX).collect();
    let fields = [
        context.session_id.clone(),
        context.task_id.to_string(),
        context.worker_index.map(|i| i.to_string()).unwrap_or_default(),
        event.actor.as_str().to_string(),
        event.state().as_str().to_string(),
        event.timestamp.to_string(),
        event.action().unwrap_or_default().to_string(),
        details,
        event.tab_id().map(|t| t.to_string()).unwrap_or_default(),
    ];

    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update(field.as_bytes());
        // Unit separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0x1f_u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::from("evt_");
    for b in digest.iter().take(ID_DIGEST_BYTES) {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Task-level context stamped onto every event a task's executor emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub task_id: Uuid,
    /// Trajectory the event belongs to: the parent session for workers,
    /// otherwise the task's own id.
    pub session_id: String,
    pub task_name: String,
    pub color: TaskColor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

impl EventContext {
    pub fn enrich(&self, event: ExecutionEvent) -> EnrichedEvent {
        EnrichedEvent {
            event_id: event_id(self, &event),
            context: self.clone(),
            event,
        }
    }
}

/// An executor event plus its owning task's context and stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub context: EventContext,
    pub event: ExecutionEvent,
}

impl EnrichedEvent {
    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn state(&self) -> EventState {
        self.event.state()
    }

    pub fn worker_index(&self) -> Option<u32> {
        self.context.worker_index
    }
}
