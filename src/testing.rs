//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::Notify;

use crate::config::ModelSettings;
use crate::error::{ExecutorError, SinkError, StoreError};
use crate::events::{Actor, EnrichedEvent, EventPayload, ExecutionEvent, Phase, TabId};
use crate::executor::{
    BrowserContext, EventCallback, Executor, ExecutorFactory, ExecutorSpec, FollowUpMode,
};
use crate::notify::NotificationSink;
use crate::store::{MessageSummary, SessionMessage, SessionStats, SessionStore};
use crate::tasks::model::TaskUpdate;

pub fn model_settings() -> ModelSettings {
    ModelSettings {
        provider: "anthropic".into(),
        model: Some("test-model".into()),
        api_key: Some(SecretString::from("sk-test")),
    }
}

pub fn action(details: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::Navigator,
        EventPayload::Action {
            phase: Phase::Ok,
            action: "click_element".into(),
            details: details.into(),
            is_done: false,
            page: None,
        },
    )
}

pub fn done(details: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::Navigator,
        EventPayload::Action {
            phase: Phase::Ok,
            action: "done".into(),
            details: details.into(),
            is_done: true,
            page: None,
        },
    )
}

pub fn task_start(details: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::System,
        EventPayload::TaskStart {
            details: details.into(),
        },
    )
}

pub fn task_ok(details: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::System,
        EventPayload::TaskOk {
            details: details.into(),
            usage: None,
        },
    )
}

pub fn task_fail(error: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::System,
        EventPayload::TaskFail {
            error: error.into(),
            usage: None,
        },
    )
}

pub fn task_cancel() -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::System,
        EventPayload::TaskCancel {
            details: "Task cancelled".into(),
        },
    )
}

/// One scripted `execute()` call.
#[derive(Default)]
pub struct Run {
    pub events: Vec<ExecutionEvent>,
    /// Block after emitting until `release()` or `cancel()`.
    pub hold: bool,
    pub error: Option<String>,
}

impl Run {
    pub fn emitting(events: Vec<ExecutionEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn held() -> Self {
        Self {
            hold: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct FakeBrowser {
    pub tabs: Mutex<Vec<TabId>>,
    pub group: Mutex<Option<i64>>,
    pub detached: AtomicBool,
    /// Tabs that no longer exist.
    pub stale: Vec<TabId>,
}

#[async_trait]
impl BrowserContext for FakeBrowser {
    async fn adopt_tabs(&self, tab_ids: &[TabId]) -> Result<(), ExecutorError> {
        if let Some(stale) = tab_ids.iter().find(|id| self.stale.contains(id)) {
            return Err(ExecutorError::StaleResource { resource_id: *stale });
        }
        self.tabs.lock().unwrap().extend_from_slice(tab_ids);
        Ok(())
    }

    fn set_preferred_group(&self, group_id: Option<i64>) {
        *self.group.lock().unwrap() = group_id;
    }

    fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.lock().unwrap().clone()
    }

    async fn detach_all(&self) -> Result<(), ExecutorError> {
        self.detached.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedExecutor {
    pub spec: ExecutorSpec,
    callback: Mutex<Option<EventCallback>>,
    pub subscribe_calls: AtomicUsize,
    runs: Mutex<VecDeque<Run>>,
    pub follow_ups: Mutex<Vec<(String, FollowUpMode)>>,
    pub init_error: Option<String>,
    pub initialized: AtomicBool,
    pub cancelled: AtomicBool,
    pub cleaned_up: AtomicBool,
    pub execute_calls: AtomicUsize,
    release: Notify,
    pub browser: Option<Arc<FakeBrowser>>,
}

impl ScriptedExecutor {
    pub fn new(spec: ExecutorSpec) -> Self {
        Self {
            spec,
            callback: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            runs: Mutex::new(VecDeque::new()),
            follow_ups: Mutex::new(Vec::new()),
            init_error: None,
            initialized: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            execute_calls: AtomicUsize::new(0),
            release: Notify::new(),
            browser: None,
        }
    }

    pub fn push_run(&self, run: Run) {
        self.runs.lock().unwrap().push_back(run);
    }

    /// Deliver an event through the registered callback.
    pub fn emit(&self, event: ExecutionEvent) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn initialize(&self) -> Result<(), ExecutorError> {
        if let Some(err) = &self.init_error {
            return Err(ExecutorError::Initialization(err.clone()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self) -> Result<(), ExecutorError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let run = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        for event in run.events {
            self.emit(event);
        }
        if run.hold {
            self.release.notified().await;
            if self.cancelled.load(Ordering::SeqCst) {
                self.emit(task_cancel());
                return Err(ExecutorError::Cancelled);
            }
        }
        match run.error {
            Some(err) => Err(ExecutorError::Step(err)),
            None => Ok(()),
        }
    }

    async fn add_follow_up_task(
        &self,
        prompt: &str,
        mode: FollowUpMode,
    ) -> Result<(), ExecutorError> {
        self.follow_ups
            .lock()
            .unwrap()
            .push((prompt.to_string(), mode));
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ExecutorError> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.release.notify_one();
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ExecutorError> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_tab_screenshot(
        &self,
        tab_id: TabId,
    ) -> Result<Option<Vec<u8>>, ExecutorError> {
        Ok(Some(vec![tab_id as u8]))
    }

    fn subscribe_execution_events(&self, callback: EventCallback) {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn browser_context(&self) -> Option<Arc<dyn BrowserContext>> {
        self.browser
            .clone()
            .map(|b| b as Arc<dyn BrowserContext>)
    }
}

type Configure = Box<dyn Fn(&mut ScriptedExecutor) + Send + Sync>;

/// Builds scripted executors and keeps them for inspection.
pub struct ScriptedFactory {
    pub created: Mutex<Vec<Arc<ScriptedExecutor>>>,
    configure: Configure,
    /// When set, `create` waits for a permit before building.
    create_gate: Option<Arc<Notify>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(configure: impl Fn(&mut ScriptedExecutor) + Send + Sync + 'static) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            configure: Box::new(configure),
            create_gate: None,
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.create_gate = Some(gate);
        self
    }

    pub fn executor_for(&self, task_id: uuid::Uuid) -> Option<Arc<ScriptedExecutor>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.spec.task_id == task_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutorFactory for ScriptedFactory {
    async fn create(&self, spec: ExecutorSpec) -> Result<Arc<dyn Executor>, ExecutorError> {
        if let Some(gate) = &self.create_gate {
            gate.notified().await;
        }
        let mut executor = ScriptedExecutor::new(spec);
        (self.configure)(&mut executor);
        let executor = Arc::new(executor);
        self.created.lock().unwrap().push(executor.clone());
        Ok(executor)
    }
}

/// Records deliveries; optionally fails every call.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<EnrichedEvent>>,
    pub updates: Mutex<Vec<TaskUpdate>>,
    pub fail: bool,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver_event(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Closed);
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn deliver_status(&self, update: &TaskUpdate) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Closed);
        }
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Store whose every call fails.
pub struct FailingStore;

fn unavailable() -> StoreError {
    StoreError::Connection("store unavailable".into())
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn append_message(&self, _: &str, _: &SessionMessage) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn list_messages(&self, _: &str) -> Result<Vec<SessionMessage>, StoreError> {
        Err(unavailable())
    }

    async fn get_metadata(&self, _: &str) -> Result<Option<Value>, StoreError> {
        Err(unavailable())
    }

    async fn set_metadata(&self, _: &str, _: &Value) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn save_session_stats(&self, _: &str, _: &SessionStats) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn get_session_stats(&self, _: &str) -> Result<Option<SessionStats>, StoreError> {
        Err(unavailable())
    }

    async fn save_message_summary(&self, _: &str, _: &MessageSummary) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn list_message_summaries(&self, _: &str) -> Result<Vec<MessageSummary>, StoreError> {
        Err(unavailable())
    }
}
