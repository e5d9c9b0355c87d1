//! Automation executor capability interface.
//!
//! The executor is the external engine that actually drives a browser. The
//! orchestrator only needs the narrow surface below; anything optional lives
//! behind [`Executor::browser_context`].

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::events::{ExecutionEvent, TabId};

/// Callback invoked synchronously for every event, in emission order.
pub type EventCallback = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// How a follow-up instruction is merged into the executor's pending work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpMode {
    /// Run after whatever is already queued.
    Append,
    /// Drop queued work and run only this instruction.
    Replace,
}

/// A running automation engine bound to one task.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Prepare the engine (attach to the browser, load the model).
    async fn initialize(&self) -> Result<(), ExecutorError>;

    /// Run all pending work to completion.
    async fn execute(&self) -> Result<(), ExecutorError>;

    /// Queue another instruction for the next `execute()`.
    async fn add_follow_up_task(&self, prompt: &str, mode: FollowUpMode)
    -> Result<(), ExecutorError>;

    /// Request cancellation. Best-effort; the effect may be asynchronous.
    async fn cancel(&self) -> Result<(), ExecutorError>;

    /// Release everything the executor holds.
    async fn cleanup(&self) -> Result<(), ExecutorError>;

    async fn capture_tab_screenshot(&self, tab_id: TabId) -> Result<Option<Vec<u8>>, ExecutorError>;

    /// Register the event callback. Calling this again replaces the previous
    /// callback; events are never delivered twice.
    fn subscribe_execution_events(&self, callback: EventCallback);

    /// Optional browser-level hooks.
    fn browser_context(&self) -> Option<Arc<dyn BrowserContext>> {
        None
    }
}

/// Browser-level capabilities some executors expose.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Bring existing tabs into the executor's working set.
    async fn adopt_tabs(&self, tab_ids: &[TabId]) -> Result<(), ExecutorError>;

    /// Tab group new tabs should be placed in.
    fn set_preferred_group(&self, group_id: Option<i64>);

    /// Tabs currently in the working set.
    fn tab_ids(&self) -> Vec<TabId>;

    /// Detach low-level control hooks (debugger sessions, input interception).
    async fn detach_all(&self) -> Result<(), ExecutorError>;
}

/// Everything needed to construct an executor for one task.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub task_id: Uuid,
    pub session_id: String,
    pub prompt: String,
    pub tab_id: Option<TabId>,
    pub group_id: Option<i64>,
    /// Replaces the default system instructions (worker sessions).
    pub system_prompt: Option<String>,
    pub model: String,
    pub api_key: SecretString,
}

/// Builds executors.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self, spec: ExecutorSpec) -> Result<Arc<dyn Executor>, ExecutorError>;
}
