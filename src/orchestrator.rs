//! The object graph: one store, one trajectory log, one event hub, one
//! notifier, and the two managers that share them.

use std::sync::Arc;

use axum::Router;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{ConfigError, Result, TaskError};
use crate::executor::ExecutorFactory;
use crate::notify::{EventHub, NotificationSink, Notifier, ws};
use crate::router::EventRouter;
use crate::store::SessionStore;
use crate::tasks::{Task, TaskManager, TaskManagerDeps, TaskStatus};
use crate::trajectory::TrajectoryLog;
use crate::worker::{SubtaskOptions, SubtaskOutcome, WorkerOptions, WorkerSessionManager};

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    router: Arc<EventRouter>,
    tasks: Arc<TaskManager>,
    workers: WorkerSessionManager,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        factory: Arc<dyn ExecutorFactory>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let trajectory = Arc::new(TrajectoryLog::new(
            store.clone(),
            config.flush_debounce,
            config.eviction_grace,
        ));
        let hub = Arc::new(EventHub::new(config.event_buffer_size));
        let notifier = Arc::new(Notifier::new());
        let router = Arc::new(EventRouter::new(trajectory, hub, notifier));

        let tasks = Arc::new(TaskManager::new(TaskManagerDeps {
            factory: factory.clone(),
            router: router.clone(),
            settings: config.model.clone(),
            max_concurrent_tasks: config.max_concurrent_tasks,
            cancel_cleanup_delay: config.cancel_cleanup_delay,
        }));
        let workers = WorkerSessionManager::new(factory, config.model, router.clone());

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            event_buffer_size = config.event_buffer_size,
            "Orchestrator ready"
        );
        Self {
            store,
            router,
            tasks,
            workers,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn workers(&self) -> &WorkerSessionManager {
        &self.workers
    }

    pub fn trajectory(&self) -> &Arc<TrajectoryLog> {
        &self.router.trajectory
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.router.hub
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn set_sink(&self, sink: Option<Arc<dyn NotificationSink>>) {
        self.router.notifier.set_sink(sink).await;
    }

    pub async fn set_max_concurrent_tasks(&self, n: usize) -> std::result::Result<(), ConfigError> {
        self.tasks.set_max_concurrent_tasks(n).await
    }

    /// Bound the per-session replay buffer for late-joining viewers.
    pub async fn set_event_buffering(&self, size: usize) {
        self.router.hub.set_capacity(size).await;
    }

    /// Websocket routes for session viewers.
    pub fn event_routes(&self) -> Router {
        ws::event_routes(self.router.hub.clone())
    }

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker task under `parent_session_id` and start its
    /// executor. A worker whose executor cannot start ends in `error`.
    pub async fn spawn_worker(
        &self,
        parent_session_id: &str,
        worker_index: u32,
        prompt: &str,
        opts: WorkerOptions,
    ) -> Result<Task> {
        let name = format!("Worker {worker_index}");
        let task = self
            .tasks
            .register_worker_task(parent_session_id, worker_index, prompt, Some(name))
            .await;

        if let Err(e) = self.workers.create_session(&task, prompt, opts).await {
            warn!(task_id = %task.id, error = %e, "Worker failed to start");
            self.tasks
                .finish_worker_task(task.id, TaskStatus::Error, Some(e.to_string()))
                .await?;
            return Err(e.into());
        }
        Ok(task)
    }

    pub async fn run_subtask(
        &self,
        worker_id: Uuid,
        prompt: &str,
        opts: SubtaskOptions,
    ) -> std::result::Result<SubtaskOutcome, TaskError> {
        self.workers.run_subtask(worker_id, prompt, opts).await
    }

    /// Tear the worker's session down and record its final status.
    pub async fn end_worker(
        &self,
        worker_id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.workers.end_session(worker_id, status).await?;
        self.tasks
            .finish_worker_task(worker_id, status, error)
            .await?;
        Ok(())
    }

    /// Cancel a task. Worker tasks also have their session torn down.
    pub async fn cancel_task(&self, id: Uuid) -> Result<bool> {
        if self.workers.has_session(id).await {
            self.end_worker(id, TaskStatus::Cancelled, None).await?;
            return Ok(true);
        }
        Ok(self.tasks.cancel_task(id).await?)
    }
}
