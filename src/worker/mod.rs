//! Worker sessions: sub-agents that run sequential subtasks on one
//! long-lived executor and hand back one text answer per subtask.
//!
//! Worker events take two paths. The executor callback feeds the subtask's
//! [`CaptureWindow`] synchronously, so the window is complete by the time
//! `execute()` returns. The same callback queues the event for routing to
//! the trajectory, viewers and the sink.

pub mod capture;
pub mod classify;

pub use capture::{CaptureResult, CaptureWindow};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ModelSettings;
use crate::error::{ExecutorError, TaskError};
use crate::events::{Actor, EventContext, EventPayload, ExecutionEvent, TabId};
use crate::executor::{EventCallback, Executor, ExecutorFactory, ExecutorSpec, FollowUpMode};
use crate::router::EventRouter;
use crate::tasks::model::{Task, TaskStatus};

/// State tag of worker lifecycle markers in the trajectory.
pub const MARKER_STATE: &str = "worker.lifecycle";

/// Worker-scoped overrides.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Replaces the executor's default system instructions.
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SubtaskOptions {
    /// Existing tabs to bring into the executor's working set first.
    pub adopt_tab_ids: Vec<TabId>,
    /// Number shown in lifecycle markers; defaults to the next in sequence.
    pub subtask_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    pub resource_ids: Vec<TabId>,
}

struct WorkerSession {
    executor: Arc<dyn Executor>,
    /// At least one subtask has run.
    started: bool,
    subtasks_run: u32,
    context: EventContext,
    capture: Arc<Mutex<CaptureWindow>>,
    events_tx: mpsc::UnboundedSender<ExecutionEvent>,
    router_handle: JoinHandle<()>,
}

pub struct WorkerSessionManager {
    factory: Arc<dyn ExecutorFactory>,
    settings: ModelSettings,
    router: Arc<EventRouter>,
    sessions: RwLock<HashMap<Uuid, WorkerSession>>,
}

impl WorkerSessionManager {
    pub fn new(
        factory: Arc<dyn ExecutorFactory>,
        settings: ModelSettings,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            factory,
            settings,
            router,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn has_session(&self, task_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&task_id)
    }

    /// Build and initialize the worker's executor. A second call for the
    /// same task is a no-op.
    pub async fn create_session(
        &self,
        task: &Task,
        initial_prompt: &str,
        opts: WorkerOptions,
    ) -> Result<(), ExecutorError> {
        if self.has_session(task.id).await {
            debug!(task_id = %task.id, "Worker session already exists");
            return Ok(());
        }

        let (model, api_key) = self.settings.with_model(opts.model.as_deref()).resolve()?;
        let group_id = opts.group_id.or(task.group_id);
        let worker_index = task.worker_index.unwrap_or(0);

        let executor = self
            .factory
            .create(ExecutorSpec {
                task_id: task.id,
                session_id: task.session_id(),
                prompt: initial_prompt.to_string(),
                tab_id: task.tab_id,
                group_id,
                system_prompt: opts.system_prompt,
                model,
                api_key,
            })
            .await?;
        if let Some(browser) = executor.browser_context() {
            browser.set_preferred_group(group_id);
        }

        let context = EventContext {
            task_id: task.id,
            session_id: task.session_id(),
            task_name: task.name.clone(),
            color: task.color,
            parent_session_id: task.parent_session_id.clone(),
            worker_index: Some(worker_index),
            group_id,
        };
        let capture = Arc::new(Mutex::new(CaptureWindow::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        executor.subscribe_execution_events(capture_callback(capture.clone(), events_tx.clone()));
        let router_handle = spawn_router(self.router.clone(), context.clone(), events_rx);

        if let Err(e) = executor.initialize().await {
            warn!(task_id = %task.id, error = %e, "Worker executor failed to initialize");
            executor.subscribe_execution_events(Arc::new(|_: ExecutionEvent| {}));
            if let Err(cleanup_err) = executor.cleanup().await {
                warn!(task_id = %task.id, error = %cleanup_err, "Worker cleanup failed");
            }
            drop(events_tx);
            let _ = router_handle.await;
            return Err(e);
        }

        let _ = events_tx.send(marker(format!("Worker {worker_index} ready")));
        info!(
            task_id = %task.id,
            session_id = %context.session_id,
            worker_index,
            "Worker session created"
        );

        self.sessions.write().await.insert(
            task.id,
            WorkerSession {
                executor,
                started: false,
                subtasks_run: 0,
                context,
                capture,
                events_tx,
                router_handle,
            },
        );
        Ok(())
    }

    /// Run one instruction to completion and reduce its events to an answer.
    ///
    /// The first subtask replaces the executor's queued work; later ones are
    /// appended.
    pub async fn run_subtask(
        &self,
        task_id: Uuid,
        prompt: &str,
        opts: SubtaskOptions,
    ) -> Result<SubtaskOutcome, TaskError> {
        let (executor, capture, events_tx, started, index) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&task_id)
                .ok_or(TaskError::NoWorkerSession { id: task_id })?;
            (
                session.executor.clone(),
                session.capture.clone(),
                session.events_tx.clone(),
                session.started,
                opts.subtask_index.unwrap_or(session.subtasks_run + 1),
            )
        };

        if let Ok(mut window) = capture.lock() {
            window.open();
        }

        if !opts.adopt_tab_ids.is_empty() {
            self.adopt_tabs(task_id, executor.as_ref(), &capture, &opts.adopt_tab_ids)
                .await;
        }

        let _ = events_tx.send(marker(format!("Starting subtask {index}")));
        let mode = if started {
            FollowUpMode::Append
        } else {
            FollowUpMode::Replace
        };
        let result = match executor.add_follow_up_task(prompt, mode).await {
            Ok(()) => executor.execute().await,
            Err(e) => Err(e),
        };

        if let Some(session) = self.sessions.write().await.get_mut(&task_id) {
            session.started = true;
            session.subtasks_run = session.subtasks_run.max(index);
        }

        let captured = capture
            .lock()
            .map(|mut window| window.close())
            .unwrap_or_default();

        let (ok, error) = match (&result, &captured.failure) {
            (Err(ExecutorError::Cancelled), _) => (false, Some("Subtask cancelled".to_string())),
            (Err(e), _) => (false, Some(e.to_string())),
            (Ok(()), Some(failure)) => (false, Some(failure.clone())),
            (Ok(()), None) => (true, None),
        };

        let closing = if ok {
            format!("Completed subtask {index}")
        } else {
            format!("Subtask {index} failed")
        };
        let _ = events_tx.send(marker(closing));

        debug!(task_id = %task_id, index, ok, "Subtask finished");
        Ok(SubtaskOutcome {
            ok,
            error,
            output_text: Some(captured.output).filter(|o| !o.is_empty()),
            resource_ids: captured.touched_tabs,
        })
    }

    /// Tear a worker session down. Cancels first when `final_status` is
    /// cancelled; always captures final previews, detaches control hooks
    /// and releases the executor.
    pub async fn end_session(&self, task_id: Uuid, final_status: TaskStatus) -> Result<(), TaskError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&task_id)
            .ok_or(TaskError::NoWorkerSession { id: task_id })?;
        let WorkerSession {
            executor,
            context,
            capture,
            events_tx,
            router_handle,
            ..
        } = session;

        if final_status == TaskStatus::Cancelled
            && let Err(e) = executor.cancel().await
        {
            warn!(task_id = %task_id, error = %e, "Worker cancel failed");
        }

        let tabs = capture
            .lock()
            .map(|window| window.session_tabs())
            .unwrap_or_default();
        for tab_id in tabs {
            match executor.capture_tab_screenshot(tab_id).await {
                Ok(Some(bytes)) => {
                    self.router
                        .trajectory
                        .record_final_preview(&context.session_id, tab_id, bytes)
                        .await;
                }
                Ok(None) => {}
                Err(e) if e.is_stale_resource() => {
                    debug!(task_id = %task_id, tab_id, "Tab gone before final preview");
                }
                Err(e) => warn!(task_id = %task_id, tab_id, error = %e, "Final preview failed"),
            }
        }

        if let Some(browser) = executor.browser_context()
            && let Err(e) = browser.detach_all().await
        {
            if e.is_stale_resource() {
                debug!(task_id = %task_id, "Control hooks already gone");
            } else {
                warn!(task_id = %task_id, error = %e, "Failed to detach control hooks");
            }
        }

        // Replacing the callback drops the executor's sender so the router
        // drains and stops.
        executor.subscribe_execution_events(Arc::new(|_: ExecutionEvent| {}));
        if let Err(e) = executor.cleanup().await {
            warn!(task_id = %task_id, error = %e, "Worker cleanup failed");
        }
        drop(events_tx);
        if let Err(e) = router_handle.await {
            warn!(task_id = %task_id, error = %e, "Worker event router panicked");
        }

        self.router
            .trajectory
            .finish_worker(
                &context.session_id,
                context.worker_index.unwrap_or(0),
                task_id,
                &final_status.to_string(),
            )
            .await;
        info!(task_id = %task_id, status = %final_status, "Worker session ended");
        Ok(())
    }

    async fn adopt_tabs(
        &self,
        task_id: Uuid,
        executor: &dyn Executor,
        capture: &Mutex<CaptureWindow>,
        tab_ids: &[TabId],
    ) {
        let Some(browser) = executor.browser_context() else {
            debug!(task_id = %task_id, "Executor cannot adopt tabs");
            return;
        };
        match browser.adopt_tabs(tab_ids).await {
            Ok(()) => {
                if let Ok(mut window) = capture.lock() {
                    for tab_id in tab_ids {
                        window.touch(*tab_id);
                    }
                }
            }
            Err(e) if e.is_stale_resource() => {
                info!(task_id = %task_id, error = %e, "Skipped adopting a closed tab");
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to adopt tabs"),
        }
    }
}

fn capture_callback(
    capture: Arc<Mutex<CaptureWindow>>,
    events_tx: mpsc::UnboundedSender<ExecutionEvent>,
) -> EventCallback {
    Arc::new(move |event: ExecutionEvent| {
        if let Ok(mut window) = capture.lock() {
            window.observe(&event);
        }
        let _ = events_tx.send(event);
    })
}

fn spawn_router(
    router: Arc<EventRouter>,
    context: EventContext,
    mut events_rx: mpsc::UnboundedReceiver<ExecutionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            router.route(context.enrich(event)).await;
        }
    })
}

fn marker(details: String) -> ExecutionEvent {
    ExecutionEvent::new(
        Actor::System,
        EventPayload::Other {
            state: MARKER_STATE.to_string(),
            details,
        },
    )
}
