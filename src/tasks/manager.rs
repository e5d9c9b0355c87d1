//! Task manager: registry, admission pump and executor lifecycle.
//!
//! Every executor event and the return of `execute()` travel through one
//! per-task channel, so a task's terminal event is always handled before
//! the run's own completion signal. Whichever terminal outcome is applied
//! first is final; later ones are recorded in the trajectory and ignored.
//! Signals are stamped with the run that produced them, so a run left over
//! from before a reactivation can never finish the new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ModelSettings;
use crate::error::{ConfigError, ExecutorError, TaskError};
use crate::events::{Actor, EventContext, EventPayload, ExecutionEvent, Phase, TabId};
use crate::executor::{EventCallback, Executor, ExecutorFactory, ExecutorSpec, FollowUpMode};
use crate::queue::TaskQueue;
use crate::router::EventRouter;
use crate::tasks::model::{Badge, LogLevel, Task, TaskColor, TaskStatus, TaskUpdate};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// What flows from an executor into its task's event loop. `generation`
/// identifies the run.
enum TaskSignal {
    Event {
        generation: u64,
        event: ExecutionEvent,
    },
    RunFinished {
        generation: u64,
        result: Result<(), ExecutorError>,
    },
}

/// Terminal outcome to apply to a task.
#[derive(Debug, Clone)]
enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn status(&self) -> TaskStatus {
        match self {
            Self::Completed => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Error,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    fn from_status(status: TaskStatus, error: Option<String>) -> Option<Self> {
        match status {
            TaskStatus::Completed => Some(Self::Completed),
            TaskStatus::Error => Some(Self::Failed(
                error.unwrap_or_else(|| "Worker failed".to_string()),
            )),
            TaskStatus::Cancelled => Some(Self::Cancelled),
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }

    /// Terminal event recorded when the executor never reported one.
    fn event(&self) -> ExecutionEvent {
        let payload = match self {
            Self::Completed => EventPayload::TaskOk {
                details: String::new(),
                usage: None,
            },
            Self::Failed(error) => EventPayload::TaskFail {
                error: error.clone(),
                usage: None,
            },
            Self::Cancelled => EventPayload::TaskCancel {
                details: String::new(),
            },
        };
        ExecutionEvent::new(Actor::System, payload)
    }
}

/// An outcome plus where it came from.
struct Terminal {
    outcome: Outcome,
    /// Run that produced it; `None` targets whatever run is current.
    generation: Option<u64>,
    /// Carried by an executor event, which is already in the trajectory.
    reported: bool,
}

impl Terminal {
    fn reported(outcome: Outcome, generation: u64) -> Self {
        Self {
            outcome,
            generation: Some(generation),
            reported: true,
        }
    }

    fn local(outcome: Outcome, generation: Option<u64>) -> Self {
        Self {
            outcome,
            generation,
            reported: false,
        }
    }
}

/// Optional fields for a new task.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub tab_id: Option<TabId>,
    pub group_id: Option<i64>,
}

struct TaskEntry {
    task: Task,
    /// At most one live executor per task.
    executor: Option<Arc<dyn Executor>>,
    subscribed: bool,
    signals: Option<mpsc::UnboundedSender<TaskSignal>>,
    /// Set once the first terminal outcome has been applied.
    terminal_handled: bool,
    /// Instruction to append on the next start (reactivation).
    follow_up: Option<String>,
    /// Deferred subscription teardown after a cancel.
    cleanup: Option<JoinHandle<()>>,
    /// Run whose outcomes are accepted. Bumped on reactivation.
    generation: u64,
    /// Run the subscription callback stamps onto events.
    emitting: Arc<AtomicU64>,
    /// Held for a whole run: one `execute()` per executor at a time.
    run_lock: Arc<Mutex<()>>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task,
            executor: None,
            subscribed: false,
            signals: None,
            terminal_handled: false,
            follow_up: None,
            cleanup: None,
            generation: 0,
            emitting: Arc::new(AtomicU64::new(0)),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    fn context(&self) -> EventContext {
        EventContext {
            task_id: self.task.id,
            session_id: self.task.session_id(),
            task_name: self.task.name.clone(),
            color: self.task.color,
            parent_session_id: self.task.parent_session_id.clone(),
            worker_index: self.task.worker_index,
            group_id: self.task.group_id,
        }
    }
}

struct ManagerState {
    tasks: HashMap<Uuid, TaskEntry>,
    /// Creation order, for listing.
    order: Vec<Uuid>,
    queue: TaskQueue,
    created: usize,
}

impl ManagerState {
    fn badge(&self) -> Badge {
        let mut badge = Badge::default();
        for entry in self.tasks.values() {
            match entry.task.status {
                TaskStatus::Running => badge.running += 1,
                TaskStatus::Pending => badge.pending += 1,
                _ => {}
            }
        }
        badge
    }

    fn next_color(&mut self) -> TaskColor {
        let color = TaskColor::nth(self.created);
        self.created += 1;
        color
    }
}

/// Collaborators injected into the manager.
pub struct TaskManagerDeps {
    pub factory: Arc<dyn ExecutorFactory>,
    pub router: Arc<EventRouter>,
    pub settings: ModelSettings,
    pub max_concurrent_tasks: usize,
    pub cancel_cleanup_delay: Duration,
}

pub struct TaskManager {
    state: RwLock<ManagerState>,
    factory: Arc<dyn ExecutorFactory>,
    router: Arc<EventRouter>,
    settings: ModelSettings,
    cancel_cleanup_delay: Duration,
    updates: broadcast::Sender<TaskUpdate>,
}

impl TaskManager {
    pub fn new(deps: TaskManagerDeps) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ManagerState {
                tasks: HashMap::new(),
                order: Vec::new(),
                queue: TaskQueue::new(deps.max_concurrent_tasks.max(1)),
                created: 0,
            }),
            factory: deps.factory,
            router: deps.router,
            settings: deps.settings,
            cancel_cleanup_delay: deps.cancel_cleanup_delay,
            updates,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.state.read().await.tasks.get(&id).map(|e| e.task.clone())
    }

    /// All tasks in creation order, terminal ones included.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|e| e.task.clone()))
            .collect()
    }

    pub async fn running_count(&self) -> usize {
        self.state.read().await.queue.running_count()
    }

    pub async fn pending_ids(&self) -> Vec<Uuid> {
        self.state.read().await.queue.pending_ids()
    }

    pub async fn max_concurrent_tasks(&self) -> usize {
        self.state.read().await.queue.max_concurrent()
    }

    /// Derived from the registry on every call.
    pub async fn badge(&self) -> Badge {
        self.state.read().await.badge()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.updates.subscribe()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Register a pending task, enqueue it and run the admission pump.
    pub async fn create_task(self: &Arc<Self>, prompt: &str, opts: TaskOptions) -> Uuid {
        let (task, badge) = {
            let mut state = self.state.write().await;
            let color = state.next_color();
            let mut task = Task::new(prompt, opts.name, color);
            task.tab_id = opts.tab_id;
            task.group_id = opts.group_id;
            task.log(LogLevel::Info, "Created");

            let id = task.id;
            state.tasks.insert(id, TaskEntry::new(task.clone()));
            state.order.push(id);
            state.queue.enqueue(id);
            (task, state.badge())
        };

        info!(task_id = %task.id, name = %task.name, "Task created");
        let id = task.id;
        self.publish(TaskUpdate::Created { task }).await;
        self.publish(TaskUpdate::Badge { badge }).await;
        self.pump().await;
        id
    }

    /// Dispatch pending tasks while there is capacity.
    async fn pump(self: &Arc<Self>) {
        let (started, badge) = {
            let mut state = self.state.write().await;
            let mut started = Vec::new();
            while state.queue.has_pending() && state.queue.has_capacity() {
                let Some(id) = state.queue.dequeue() else {
                    break;
                };
                let Some(entry) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if let Err(reason) = entry.task.transition_to(TaskStatus::Running) {
                    debug!(task_id = %id, reason = %reason, "Skipping dequeued task");
                    continue;
                }
                state.queue.mark_running(id);
                started.push(id);
            }
            (started, state.badge())
        };

        if started.is_empty() {
            return;
        }
        for id in &started {
            info!(task_id = %id, "Task started");
            self.publish(TaskUpdate::StatusChanged {
                task_id: *id,
                status: TaskStatus::Running,
                error: None,
            })
            .await;
            let manager = Arc::clone(self);
            let id = *id;
            tokio::spawn(manager.start_task(id));
        }
        self.publish(TaskUpdate::Badge { badge }).await;
    }

    /// Acquire an executor, subscribe once, and run it to completion.
    /// Boxed because the run re-enters the pump that spawns it.
    fn start_task(self: Arc<Self>, id: Uuid) -> BoxFuture<'static, ()> {
        async move {
            let Some(run_lock) = self
                .state
                .read()
                .await
                .tasks
                .get(&id)
                .map(|entry| Arc::clone(&entry.run_lock))
            else {
                return;
            };
            // A cancelled run may still be unwinding.
            let _run = run_lock.lock_owned().await;

            let (task, existing, follow_up, generation) = {
                let state = self.state.read().await;
                let Some(entry) = state.tasks.get(&id) else {
                    return;
                };
                (
                    entry.task.clone(),
                    entry.executor.clone(),
                    entry.follow_up.clone(),
                    entry.generation,
                )
            };

            let fresh = existing.is_none();
            let executor = match existing {
                Some(executor) => executor,
                None => match self.build_executor(&task, follow_up.as_deref()).await {
                    Ok(executor) => executor,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Could not create executor");
                        let outcome = Outcome::Failed(e.to_string());
                        self.finalize(id, Terminal::local(outcome, Some(generation)))
                            .await;
                        return;
                    }
                },
            };

            let signals = {
                let mut state = self.state.write().await;
                match state.tasks.get_mut(&id) {
                    Some(entry)
                        if entry.task.status == TaskStatus::Running
                            && entry.generation == generation =>
                    {
                        entry.executor = Some(executor.clone());
                        entry.follow_up = None;
                        entry.emitting.store(generation, Ordering::SeqCst);

                        let tx = match &entry.signals {
                            Some(tx) if !tx.is_closed() => tx.clone(),
                            _ => {
                                let (tx, rx) = mpsc::unbounded_channel();
                                tokio::spawn(Arc::clone(&self).run_event_loop(id, rx));
                                entry.signals = Some(tx.clone());
                                tx
                            }
                        };
                        if !entry.subscribed {
                            executor.subscribe_execution_events(signal_callback(
                                tx.clone(),
                                Arc::clone(&entry.emitting),
                            ));
                            entry.subscribed = true;
                        }
                        Some(tx)
                    }
                    Some(entry) => {
                        debug!(
                            task_id = %id,
                            status = %entry.task.status,
                            "Task left running before start"
                        );
                        None
                    }
                    None => None,
                }
            };
            let Some(signals) = signals else {
                // Built for a run that no longer exists.
                if fresh && let Err(e) = executor.cleanup().await {
                    warn!(task_id = %id, error = %e, "Executor cleanup failed");
                }
                return;
            };

            let result: Result<(), ExecutorError> = async {
                if fresh {
                    executor.initialize().await?;
                } else if let Some(prompt) = follow_up.as_deref() {
                    executor
                        .add_follow_up_task(prompt, FollowUpMode::Append)
                        .await?;
                }
                executor.execute().await
            }
            .await;

            // Ordered behind every event emitted during the run.
            let _ = signals.send(TaskSignal::RunFinished { generation, result });
        }
        .boxed()
    }

    async fn build_executor(
        &self,
        task: &Task,
        prompt_override: Option<&str>,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let (model, api_key) = self.settings.resolve()?;
        self.factory
            .create(ExecutorSpec {
                task_id: task.id,
                session_id: task.session_id(),
                prompt: prompt_override.unwrap_or(&task.prompt).to_string(),
                tab_id: task.tab_id,
                group_id: task.group_id,
                system_prompt: None,
                model,
                api_key,
            })
            .await
    }

    async fn run_event_loop(self: Arc<Self>, id: Uuid, mut signals: mpsc::UnboundedReceiver<TaskSignal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                TaskSignal::Event { generation, event } => {
                    self.handle_event(id, generation, event).await
                }
                TaskSignal::RunFinished { generation, result } => {
                    let outcome = match result {
                        Ok(()) => Outcome::Completed,
                        Err(ExecutorError::Cancelled) => Outcome::Cancelled,
                        Err(e) => {
                            if e.is_configuration() {
                                warn!(task_id = %id, error = %e, "Task not configured");
                            }
                            Outcome::Failed(e.to_string())
                        }
                    };
                    self.finalize(id, Terminal::local(outcome, Some(generation)))
                        .await;
                }
            }
        }
        debug!(task_id = %id, "Task event loop finished");
    }

    /// Enrich, route, and apply terminal events.
    async fn handle_event(self: &Arc<Self>, id: Uuid, generation: u64, event: ExecutionEvent) {
        let context = {
            let mut state = self.state.write().await;
            let Some(entry) = state.tasks.get_mut(&id) else {
                return;
            };
            match &event.payload {
                EventPayload::TabCreated { tab_id, .. } if entry.task.tab_id.is_none() => {
                    entry.task.tab_id = Some(*tab_id);
                }
                EventPayload::Action {
                    phase: Phase::Fail,
                    details,
                    ..
                } => {
                    entry.task.log(LogLevel::Warn, format!("Action failed: {details}"));
                }
                _ => {}
            }
            entry.context()
        };

        let outcome = match &event.payload {
            EventPayload::TaskOk { .. } => Some(Outcome::Completed),
            EventPayload::TaskFail { error, .. } => Some(Outcome::Failed(error.clone())),
            EventPayload::TaskCancel { .. } => Some(Outcome::Cancelled),
            _ => None,
        };

        self.router.route(context.enrich(event)).await;

        if let Some(outcome) = outcome {
            self.finalize(id, Terminal::reported(outcome, generation)).await;
        }
    }

    /// Apply a terminal outcome once. Returns whether it was applied.
    async fn finalize(self: &Arc<Self>, id: Uuid, terminal: Terminal) -> bool {
        let Terminal {
            outcome,
            generation,
            reported,
        } = terminal;
        let target = outcome.status();
        let (context, is_worker, error, badge) = {
            let mut state = self.state.write().await;
            let Some(entry) = state.tasks.get_mut(&id) else {
                return false;
            };
            if let Some(generation) = generation
                && generation != entry.generation
            {
                debug!(
                    task_id = %id,
                    run = generation,
                    current = entry.generation,
                    ignored = %target,
                    "Outcome from an earlier run ignored"
                );
                return false;
            }
            if entry.terminal_handled {
                debug!(
                    task_id = %id,
                    status = %entry.task.status,
                    ignored = %target,
                    "Terminal status already applied"
                );
                return false;
            }
            if let Err(reason) = entry.task.transition_to(target) {
                warn!(task_id = %id, reason = %reason, "Terminal transition rejected");
                return false;
            }
            entry.terminal_handled = true;

            let error = match &outcome {
                Outcome::Failed(message) => {
                    entry.task.log(LogLevel::Error, message.clone());
                    Some(message.clone())
                }
                _ => None,
            };
            entry.task.error = error.clone();
            let context = entry.context();
            let is_worker = entry.task.is_worker();

            state.queue.mark_completed(id);
            state.queue.remove(id);
            (context, is_worker, error, state.badge())
        };

        // Workers report through `finish_worker` on the parent session.
        if !reported && !is_worker {
            self.router.route(context.enrich(outcome.event())).await;
        }

        info!(task_id = %id, status = %target, "Task finished");
        self.publish(TaskUpdate::StatusChanged {
            task_id: id,
            status: target,
            error,
        })
        .await;
        self.publish(TaskUpdate::Badge { badge }).await;

        if !is_worker {
            self.router.trajectory.end_session(&context.session_id).await;
        }
        self.pump().await;
        true
    }

    /// Cancel a pending or running task. Returns false if it had already
    /// finished.
    pub async fn cancel_task(self: &Arc<Self>, id: Uuid) -> Result<bool, TaskError> {
        let (executor, was_running) = {
            let state = self.state.read().await;
            let entry = state.tasks.get(&id).ok_or(TaskError::NotFound { id })?;
            if entry.task.status.is_terminal() {
                return Ok(false);
            }
            (
                entry.executor.clone(),
                entry.task.status == TaskStatus::Running,
            )
        };

        if was_running
            && let Some(executor) = &executor
            && let Err(e) = executor.cancel().await
        {
            // Best-effort; the terminal status below does not wait on it.
            warn!(task_id = %id, error = %e, "Executor cancel failed");
        }

        let applied = self
            .finalize(id, Terminal::local(Outcome::Cancelled, None))
            .await;

        if executor.is_some() {
            let mut state = self.state.write().await;
            if let Some(entry) = state.tasks.get_mut(&id) {
                if let Some(handle) = entry.cleanup.take() {
                    handle.abort();
                }
                let manager = Arc::clone(self);
                let delay = self.cancel_cleanup_delay;
                entry.cleanup = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.release_subscription(id).await;
                }));
            }
        }
        Ok(applied)
    }

    /// Drop the event subscription of a cancelled task. Late events stop
    /// arriving after this.
    async fn release_subscription(&self, id: Uuid) {
        let mut state = self.state.write().await;
        let Some(entry) = state.tasks.get_mut(&id) else {
            return;
        };
        if entry.task.status != TaskStatus::Cancelled {
            return;
        }
        entry.cleanup = None;
        if let Some(executor) = &entry.executor {
            executor.subscribe_execution_events(Arc::new(|_: ExecutionEvent| {}));
        }
        entry.subscribed = false;
        entry.signals = None;
        debug!(task_id = %id, "Released event subscription");
    }

    /// Remove a task that is not running. Its executor is cleaned up.
    pub async fn delete_task(self: &Arc<Self>, id: Uuid) -> Result<Task, TaskError> {
        let (entry, badge) = {
            let mut state = self.state.write().await;
            let entry = state.tasks.get(&id).ok_or(TaskError::NotFound { id })?;
            if entry.task.status == TaskStatus::Running {
                return Err(TaskError::StillRunning { id });
            }
            let entry = state
                .tasks
                .remove(&id)
                .ok_or(TaskError::NotFound { id })?;
            state.order.retain(|o| *o != id);
            state.queue.remove(id);
            (entry, state.badge())
        };

        if let Some(handle) = &entry.cleanup {
            handle.abort();
        }
        if let Some(executor) = &entry.executor {
            executor.subscribe_execution_events(Arc::new(|_: ExecutionEvent| {}));
            if let Err(e) = executor.cleanup().await {
                warn!(task_id = %id, error = %e, "Executor cleanup failed");
            }
        }

        info!(task_id = %id, "Task deleted");
        self.publish(TaskUpdate::Deleted { task_id: id }).await;
        self.publish(TaskUpdate::Badge { badge }).await;
        self.pump().await;
        Ok(entry.task)
    }

    /// Put a finished task back in the queue with a follow-up instruction
    /// for its existing executor.
    pub async fn reactivate_task(
        self: &Arc<Self>,
        id: Uuid,
        follow_up_prompt: &str,
    ) -> Result<(), TaskError> {
        let badge = {
            let mut state = self.state.write().await;
            let entry = state.tasks.get_mut(&id).ok_or(TaskError::NotFound { id })?;
            if entry.task.is_worker() {
                return Err(TaskError::InvalidTransition {
                    id,
                    state: entry.task.status.to_string(),
                    target: TaskStatus::Pending.to_string(),
                });
            }
            entry
                .task
                .reactivate()
                .map_err(|_| TaskError::InvalidTransition {
                    id,
                    state: entry.task.status.to_string(),
                    target: TaskStatus::Pending.to_string(),
                })?;
            entry.terminal_handled = false;
            entry.generation += 1;
            entry.follow_up = Some(follow_up_prompt.to_string());
            if let Some(handle) = entry.cleanup.take() {
                handle.abort();
            }
            state.queue.enqueue(id);
            state.badge()
        };

        info!(task_id = %id, "Task reactivated");
        self.publish(TaskUpdate::StatusChanged {
            task_id: id,
            status: TaskStatus::Pending,
            error: None,
        })
        .await;
        self.publish(TaskUpdate::Badge { badge }).await;
        self.pump().await;
        Ok(())
    }

    /// Register a worker task. Workers bypass the queue and start running
    /// immediately; their executor is owned by the worker session manager.
    pub async fn register_worker_task(
        &self,
        parent_session_id: &str,
        worker_index: u32,
        prompt: &str,
        name: Option<String>,
    ) -> Task {
        let (task, badge) = {
            let mut state = self.state.write().await;
            let color = state.next_color();
            let mut task = Task::new(prompt, name, color);
            task.parent_session_id = Some(parent_session_id.to_string());
            task.worker_index = Some(worker_index);
            task.log(LogLevel::Info, "Created");
            if let Err(reason) = task.transition_to(TaskStatus::Running) {
                warn!(task_id = %task.id, reason = %reason, "Worker task could not start");
            }
            state.tasks.insert(task.id, TaskEntry::new(task.clone()));
            state.order.push(task.id);
            (task, state.badge())
        };

        info!(
            task_id = %task.id,
            parent_session_id = %parent_session_id,
            worker_index,
            "Worker task registered"
        );
        self.publish(TaskUpdate::Created { task: task.clone() }).await;
        self.publish(TaskUpdate::Badge { badge }).await;
        task
    }

    /// Record a worker's final status. First terminal status wins.
    pub async fn finish_worker_task(
        self: &Arc<Self>,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<bool, TaskError> {
        let is_worker = self
            .get_task(id)
            .await
            .ok_or(TaskError::NotFound { id })?
            .is_worker();
        if !is_worker {
            return Err(TaskError::NoWorkerSession { id });
        }
        let Some(outcome) = Outcome::from_status(status, error) else {
            return Err(TaskError::InvalidTransition {
                id,
                state: TaskStatus::Running.to_string(),
                target: status.to_string(),
            });
        };
        Ok(self.finalize(id, Terminal::local(outcome, None)).await)
    }

    // ── Tunables ────────────────────────────────────────────────────

    pub async fn set_max_concurrent_tasks(self: &Arc<Self>, n: usize) -> Result<(), ConfigError> {
        if n == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_tasks".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        self.state.write().await.queue.set_max_concurrent(n);
        info!(max_concurrent_tasks = n, "Concurrency limit updated");
        self.pump().await;
        Ok(())
    }

    async fn publish(&self, update: TaskUpdate) {
        // No observers is fine.
        let _ = self.updates.send(update.clone());
        self.router.notifier.deliver_status(&update).await;
    }
}

fn signal_callback(
    signals: mpsc::UnboundedSender<TaskSignal>,
    emitting: Arc<AtomicU64>,
) -> EventCallback {
    Arc::new(move |event: ExecutionEvent| {
        let generation = emitting.load(Ordering::SeqCst);
        let _ = signals.send(TaskSignal::Event { generation, event });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    use crate::notify::{EventHub, Notifier, NotificationSink};
    use crate::store::MemoryStore;
    use crate::testing::{self, RecordingSink, Run, ScriptedExecutor, ScriptedFactory};
    use crate::trajectory::{TraceItem, TrajectoryLog};

    struct Harness {
        manager: Arc<TaskManager>,
        factory: Arc<ScriptedFactory>,
        trajectory: Arc<TrajectoryLog>,
        notifier: Arc<Notifier>,
    }

    fn harness_with(
        factory: ScriptedFactory,
        settings: ModelSettings,
        max: usize,
        sink: Option<Arc<dyn NotificationSink>>,
    ) -> Harness {
        let factory = Arc::new(factory);
        let trajectory = Arc::new(TrajectoryLog::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
        let notifier = Arc::new(match sink {
            Some(sink) => Notifier::with_sink(sink),
            None => Notifier::new(),
        });
        let router = Arc::new(EventRouter::new(
            trajectory.clone(),
            Arc::new(EventHub::new(100)),
            notifier.clone(),
        ));
        let manager = Arc::new(TaskManager::new(TaskManagerDeps {
            factory: factory.clone(),
            router,
            settings,
            max_concurrent_tasks: max,
            cancel_cleanup_delay: Duration::from_millis(200),
        }));
        Harness {
            manager,
            factory,
            trajectory,
            notifier,
        }
    }

    fn harness(factory: ScriptedFactory, max: usize) -> Harness {
        harness_with(factory, testing::model_settings(), max, None)
    }

    fn held() -> ScriptedFactory {
        ScriptedFactory::with(|e| e.push_run(Run::held()))
    }

    async fn wait_for_status(manager: &TaskManager, id: Uuid, status: TaskStatus) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if manager.get_task(id).await.map(|t| t.status) == Some(status) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "task {id} never reached {status}, now {:?}",
            manager.get_task(id).await.map(|t| t.status)
        );
    }

    /// Wait until the task's executor exists and has a subscriber.
    async fn subscribed_executor(factory: &ScriptedFactory, id: Uuid) -> Arc<ScriptedExecutor> {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(executor) = factory.executor_for(id)
                    && executor.subscribe_calls.load(Ordering::SeqCst) > 0
                    && executor.execute_calls.load(Ordering::SeqCst) > 0
                {
                    return executor;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        result.expect("executor never started")
    }

    /// Wait until the task's trajectory has an item matching `content`.
    async fn recorded(trajectory: &TrajectoryLog, id: Uuid, content: &str) -> TraceItem {
        let session = id.to_string();
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let item = trajectory.snapshot(&session).await.and_then(|s| {
                    s.items.into_iter().find(|i| i.content.contains(content))
                });
                if let Some(item) = item {
                    return item;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("{content:?} never recorded for {id}"))
    }

    #[tokio::test]
    async fn single_slot_dispatches_in_creation_order() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("Task A", TaskOptions::default()).await;
        let b = h.manager.create_task("Task B", TaskOptions::default()).await;
        let c = h.manager.create_task("Task C", TaskOptions::default()).await;

        assert_eq!(h.manager.get_task(a).await.unwrap().status, TaskStatus::Running);
        assert_eq!(h.manager.get_task(b).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(h.manager.get_task(c).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(h.manager.pending_ids().await, vec![b, c]);

        let executor = subscribed_executor(&h.factory, a).await;
        executor.emit(testing::task_ok("A is done"));

        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        wait_for_status(&h.manager, b, TaskStatus::Running).await;
        assert_eq!(h.manager.get_task(c).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(h.manager.pending_ids().await, vec![c]);
    }

    #[tokio::test]
    async fn running_never_exceeds_limit() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![
                testing::action("Working"),
                testing::task_ok("Finished"),
            ]));
        });
        let h = harness(factory, 2);
        let mut updates = h.manager.subscribe();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(h.manager.create_task(&format!("Task {i}"), TaskOptions::default()).await);
        }

        let mut started = Vec::new();
        let mut finished = 0;
        while finished < ids.len() {
            let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
                .await
                .expect("timed out waiting for updates")
                .unwrap();
            assert!(h.manager.badge().await.running <= 2);
            assert!(h.manager.running_count().await <= 2);
            if let TaskUpdate::StatusChanged { task_id, status, .. } = update {
                match status {
                    TaskStatus::Running => started.push(task_id),
                    TaskStatus::Completed => finished += 1,
                    _ => {}
                }
            }
        }
        started.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(started, expected);
    }

    #[tokio::test]
    async fn cancelled_pending_task_never_runs() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        let b = h.manager.create_task("B", TaskOptions::default()).await;

        assert!(h.manager.cancel_task(b).await.unwrap());
        assert_eq!(h.manager.get_task(b).await.unwrap().status, TaskStatus::Cancelled);
        assert!(h.manager.pending_ids().await.is_empty());

        let executor = subscribed_executor(&h.factory, a).await;
        executor.emit(testing::task_ok("done"));
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.manager.get_task(b).await.unwrap().status, TaskStatus::Cancelled);
        assert!(h.factory.executor_for(b).is_none());
    }

    #[tokio::test]
    async fn terminal_event_after_cancel_does_not_overwrite() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("Buy shoes", TaskOptions::default()).await;
        let executor = subscribed_executor(&h.factory, a).await;

        assert!(h.manager.cancel_task(a).await.unwrap());
        assert!(executor.cancelled.load(Ordering::SeqCst));
        executor.emit(testing::task_ok("Order placed"));

        // The late event still reaches the trajectory.
        recorded(&h.trajectory, a, "Order placed").await;

        let task = h.manager.get_task(a).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_none());
        assert!(!h.manager.cancel_task(a).await.unwrap());
        assert_eq!(h.manager.running_count().await, 0);
    }

    #[tokio::test]
    async fn emitted_failure_beats_successful_return() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![testing::task_fail("Captcha blocked the page")]));
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Search", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Error).await;
        let task = h.manager.get_task(a).await.unwrap();
        assert_eq!(task.error.as_deref(), Some("Captcha blocked the page"));
    }

    #[tokio::test]
    async fn execute_error_becomes_error_status() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run {
                error: Some("tab crashed".into()),
                ..Run::default()
            });
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Search", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Error).await;
        assert!(h.manager.get_task(a).await.unwrap().error.unwrap().contains("tab crashed"));

        // Nothing was reported, so the failure itself closes the trajectory.
        let item = recorded(&h.trajectory, a, "tab crashed").await;
        assert_eq!(item.state, "task.fail");
        assert!(h.trajectory.snapshot(&a.to_string()).await.unwrap().completed);
    }

    #[tokio::test]
    async fn quiet_successful_run_still_closes_trajectory() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![testing::action("Filled the form")]));
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Submit form", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;

        let item = recorded(&h.trajectory, a, "Task completed").await;
        assert_eq!(item.state, "task.ok");
        let snapshot = h.trajectory.snapshot(&a.to_string()).await.unwrap();
        assert_eq!(snapshot.items.len(), 2);
    }

    #[tokio::test]
    async fn missing_configuration_errors_without_blocking_the_pump() {
        let h = harness_with(ScriptedFactory::new(), ModelSettings::default(), 1, None);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        let b = h.manager.create_task("B", TaskOptions::default()).await;

        wait_for_status(&h.manager, a, TaskStatus::Error).await;
        wait_for_status(&h.manager, b, TaskStatus::Error).await;
        assert!(h.manager.get_task(a).await.unwrap().error.unwrap().contains("api_key"));
        assert_eq!(h.factory.count(), 0);
        recorded(&h.trajectory, b, "api_key").await;
    }

    #[tokio::test]
    async fn initialization_failure_is_error() {
        let factory = ScriptedFactory::with(|e| e.init_error = Some("browser detached".into()));
        let h = harness(factory, 1);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Error).await;
        assert!(h.manager.get_task(a).await.unwrap().error.unwrap().contains("browser detached"));
    }

    #[tokio::test]
    async fn failing_sink_does_not_fail_task() {
        let sink: Arc<dyn NotificationSink> = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![testing::task_ok("Fine")]));
        });
        let h = harness_with(factory, testing::model_settings(), 1, Some(sink));
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        assert!(!h.notifier.has_sink().await);
    }

    #[tokio::test]
    async fn reactivation_reuses_executor_and_subscription() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![testing::task_ok("First answer")]));
            e.push_run(Run::emitting(vec![testing::task_ok("Second answer")]));
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Plan trip", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;

        h.manager.reactivate_task(a, "Now book the hotel").await.unwrap();
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        // Wait for the second run to be fully handled.
        let executor = h.factory.executor_for(a).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.execute_calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.factory.count(), 1);
        assert_eq!(executor.subscribe_calls.load(Ordering::SeqCst), 1);
        let follow_ups = executor.follow_ups.lock().unwrap().clone();
        assert_eq!(
            follow_ups,
            vec![("Now book the hotel".to_string(), FollowUpMode::Append)]
        );

        assert!(matches!(
            h.manager.reactivate_task(Uuid::new_v4(), "x").await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_run_cannot_finish_its_reactivation() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::held());
            e.push_run(Run::held());
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Book travel", TaskOptions::default()).await;
        let executor = subscribed_executor(&h.factory, a).await;

        assert!(h.manager.cancel_task(a).await.unwrap());
        h.manager
            .reactivate_task(a, "Actually, book the train")
            .await
            .unwrap();

        // The first run unwinds with task.cancel and Err(Cancelled); only
        // then does the follow-up run start.
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.execute_calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.get_task(a).await.unwrap().status, TaskStatus::Running);
        assert_eq!(h.manager.running_count().await, 1);

        executor.emit(testing::task_ok("Train booked"));
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        recorded(&h.trajectory, a, "Train booked").await;
    }

    #[tokio::test]
    async fn success_handled_before_return_does_not_leak_into_reactivation() {
        let factory = ScriptedFactory::with(|e| {
            e.push_run(Run::emitting(vec![testing::task_ok("Flight found")]));
            e.push_run(Run::held());
        });
        let h = harness(factory, 1);
        let a = h.manager.create_task("Find flight", TaskOptions::default()).await;
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;

        h.manager.reactivate_task(a, "Now the return leg").await.unwrap();
        let executor = h.factory.executor_for(a).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.execute_calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.get_task(a).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn executor_built_after_cancel_is_cleaned_up() {
        let gate = Arc::new(Notify::new());
        let h = harness(held().gated(gate.clone()), 1);
        let a = h.manager.create_task("Slow start", TaskOptions::default()).await;
        assert_eq!(h.manager.get_task(a).await.unwrap().status, TaskStatus::Running);

        assert!(h.manager.cancel_task(a).await.unwrap());
        gate.notify_one();

        let executor = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(executor) = h.factory.executor_for(a)
                    && executor.cleaned_up.load(Ordering::SeqCst)
                {
                    return executor;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor was never cleaned up");
        assert_eq!(executor.subscribe_calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.execute_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.get_task(a).await.unwrap().status, TaskStatus::Cancelled);
        recorded(&h.trajectory, a, "Task cancelled").await;
    }

    #[tokio::test]
    async fn reactivating_active_task_is_rejected() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        assert!(matches!(
            h.manager.reactivate_task(a, "more").await,
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn delete_requires_non_running_task() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        let b = h.manager.create_task("B", TaskOptions::default()).await;

        assert!(matches!(
            h.manager.delete_task(a).await,
            Err(TaskError::StillRunning { .. })
        ));
        let removed = h.manager.delete_task(b).await.unwrap();
        assert_eq!(removed.id, b);
        assert!(h.manager.get_task(b).await.is_none());
        assert!(h.manager.pending_ids().await.is_empty());

        let executor = subscribed_executor(&h.factory, a).await;
        executor.emit(testing::task_ok("done"));
        wait_for_status(&h.manager, a, TaskStatus::Completed).await;
        h.manager.delete_task(a).await.unwrap();
        assert!(executor.cleaned_up.load(Ordering::SeqCst));
        assert!(h.manager.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn raising_limit_dispatches_waiting_tasks() {
        let h = harness(held(), 1);
        let ids: Vec<_> = futures::future::join_all(
            (0..3).map(|i| {
                let manager = h.manager.clone();
                async move { manager.create_task(&format!("T{i}"), TaskOptions::default()).await }
            }),
        )
        .await;
        assert_eq!(h.manager.running_count().await, 1);

        assert!(h.manager.set_max_concurrent_tasks(0).await.is_err());
        h.manager.set_max_concurrent_tasks(3).await.unwrap();
        for id in ids {
            assert_eq!(h.manager.get_task(id).await.unwrap().status, TaskStatus::Running);
        }
        assert_eq!(h.manager.badge().await, Badge { running: 3, pending: 0 });
    }

    #[tokio::test]
    async fn worker_tasks_bypass_queue() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("Parent", TaskOptions::default()).await;
        let worker = h
            .manager
            .register_worker_task(&a.to_string(), 1, "Check prices", None)
            .await;

        assert_eq!(worker.status, TaskStatus::Running);
        assert_eq!(worker.session_id(), a.to_string());
        assert_eq!(h.manager.running_count().await, 1);
        assert_eq!(h.manager.badge().await.running, 2);

        assert!(h
            .manager
            .finish_worker_task(worker.id, TaskStatus::Completed, None)
            .await
            .unwrap());
        assert!(!h
            .manager
            .finish_worker_task(worker.id, TaskStatus::Error, Some("late".into()))
            .await
            .unwrap());
        let worker = h.manager.get_task(worker.id).await.unwrap();
        assert_eq!(worker.status, TaskStatus::Completed);
        assert!(matches!(
            h.manager.finish_worker_task(a, TaskStatus::Completed, None).await,
            Err(TaskError::NoWorkerSession { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_releases_subscription_later() {
        let h = harness(held(), 1);
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        let executor = subscribed_executor(&h.factory, a).await;
        h.manager.cancel_task(a).await.unwrap();
        assert_eq!(executor.subscribe_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        // Replaced by a no-op callback.
        assert_eq!(executor.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn colors_rotate_and_updates_are_published() {
        let h = harness(held(), 5);
        let mut updates = h.manager.subscribe();
        let a = h.manager.create_task("A", TaskOptions::default()).await;
        let b = h
            .manager
            .create_task(
                "B",
                TaskOptions {
                    name: Some("Named".into()),
                    tab_id: Some(3),
                    group_id: Some(9),
                },
            )
            .await;
        let task_a = h.manager.get_task(a).await.unwrap();
        let task_b = h.manager.get_task(b).await.unwrap();
        assert_ne!(task_a.color, task_b.color);
        assert_eq!(task_b.name, "Named");
        assert_eq!(task_b.tab_id, Some(3));

        let first = updates.recv().await.unwrap();
        assert!(matches!(first, TaskUpdate::Created { task } if task.id == a));
    }
}
