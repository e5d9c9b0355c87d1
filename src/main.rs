//! `taskfleet <events.jsonl> [--db <path>]`
//!
//! Replays a recorded executor event stream through the orchestrator and
//! prints the resulting trajectory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};

use taskfleet::Orchestrator;
use taskfleet::config::OrchestratorConfig;
use taskfleet::error::ExecutorError;
use taskfleet::events::{ExecutionEvent, RawEvent, TabId};
use taskfleet::executor::{EventCallback, Executor, ExecutorFactory, ExecutorSpec, FollowUpMode};
use taskfleet::store::{LibSqlStore, MemoryStore, SessionStore};
use taskfleet::tasks::{TaskOptions, TaskUpdate};

/// Emits a recorded event stream on `execute()`.
struct ReplayExecutor {
    events: Mutex<Vec<ExecutionEvent>>,
    callback: Mutex<Option<EventCallback>>,
}

#[async_trait]
impl Executor for ReplayExecutor {
    async fn initialize(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute(&self) -> Result<(), ExecutorError> {
        let events = std::mem::take(&mut *self.events.lock().map_err(|_| poisoned())?);
        let callback = self.callback.lock().map_err(|_| poisoned())?.clone();
        if let Some(callback) = callback {
            for event in events {
                callback(event);
            }
        }
        Ok(())
    }

    async fn add_follow_up_task(&self, _prompt: &str, _mode: FollowUpMode) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn capture_tab_screenshot(&self, _tab_id: TabId) -> Result<Option<Vec<u8>>, ExecutorError> {
        Ok(None)
    }

    fn subscribe_execution_events(&self, callback: EventCallback) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }
}

fn poisoned() -> ExecutorError {
    ExecutorError::Step("replay state poisoned".to_string())
}

/// Hands the recording to the first executor it builds.
struct ReplayFactory {
    events: Mutex<Option<Vec<ExecutionEvent>>>,
}

#[async_trait]
impl ExecutorFactory for ReplayFactory {
    async fn create(&self, spec: ExecutorSpec) -> Result<Arc<dyn Executor>, ExecutorError> {
        let events = self
            .events
            .lock()
            .map_err(|_| poisoned())?
            .take()
            .unwrap_or_default();
        info!(task_id = %spec.task_id, events = events.len(), "Replay executor created");
        Ok(Arc::new(ReplayExecutor {
            events: Mutex::new(events),
            callback: Mutex::new(None),
        }))
    }
}

fn load_events(path: &Path) -> anyhow::Result<Vec<ExecutionEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(raw) => events.push(ExecutionEvent::from_raw(raw)),
            Err(e) => warn!(line = n + 1, error = %e, "Skipping malformed event"),
        }
    }
    Ok(events)
}

struct Args {
    events: PathBuf,
    db: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut events = None;
    let mut db = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => {
                db = Some(PathBuf::from(args.next().context("--db needs a path")?));
            }
            other if events.is_none() => events = Some(PathBuf::from(other)),
            other => bail!("unexpected argument: {other}"),
        }
    }
    Ok(Args {
        events: events.context("usage: taskfleet <events.jsonl> [--db <path>]")?,
        db,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let events = load_events(&args.events)?;

    let mut config = OrchestratorConfig::from_env();
    config.max_concurrent_tasks = 1;
    // Replays never reach a model.
    config.model.model.get_or_insert_with(|| "replay".to_string());
    config
        .model
        .api_key
        .get_or_insert_with(|| SecretString::from("replay"));

    let store: Arc<dyn SessionStore> = match &args.db {
        Some(path) => Arc::new(LibSqlStore::new_local(path).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let factory = Arc::new(ReplayFactory {
        events: Mutex::new(Some(events)),
    });
    let orchestrator = Orchestrator::new(config, factory, store);
    let tasks = orchestrator.tasks();
    let mut updates = tasks.subscribe();

    let name = args
        .events
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    let id = tasks
        .create_task(
            &format!("Replay {}", args.events.display()),
            TaskOptions {
                name,
                ..TaskOptions::default()
            },
        )
        .await;

    loop {
        if tasks
            .get_task(id)
            .await
            .is_some_and(|t| t.status.is_terminal())
        {
            break;
        }
        match updates.recv().await {
            Ok(TaskUpdate::StatusChanged { task_id, status, .. })
                if task_id == id && status.is_terminal() =>
            {
                break;
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(e) => bail!("task updates closed: {e}"),
        }
    }

    let task = tasks.get_task(id).await.context("replayed task vanished")?;
    let session_id = task.session_id();
    orchestrator.trajectory().flush(&session_id).await?;
    let snapshot = orchestrator.trajectory().get_or_create(&session_id).await;

    info!(task_id = %id, status = %task.status, items = snapshot.items.len(), "Replay finished");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
