//! Task model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::TabId;

/// Cap on per-task log entries kept in memory.
const MAX_LOG_ENTRIES: usize = 200;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a concurrency slot.
    Pending,
    /// Executor is driving the task.
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Whether the ordinary lifecycle allows moving to `target`.
    ///
    /// Leaving a terminal state is only possible through reactivation,
    /// which bypasses this check deliberately.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Error) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Tab-group colour used to tell tasks apart in the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskColor {
    Blue,
    Red,
    Yellow,
    Green,
    Pink,
    Purple,
    Cyan,
    Orange,
}

impl TaskColor {
    pub const PALETTE: [TaskColor; 8] = [
        Self::Blue,
        Self::Red,
        Self::Yellow,
        Self::Green,
        Self::Pink,
        Self::Purple,
        Self::Cyan,
        Self::Orange,
    ];

    /// Round-robin pick for the n-th task.
    pub fn nth(n: usize) -> Self {
        Self::PALETTE[n % Self::PALETTE.len()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of a task's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A top-level or worker automation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub color: TaskColor,
    pub group_id: Option<i64>,
    /// Tab the task is bound to, if any.
    pub tab_id: Option<TabId>,
    /// Set on worker tasks: the session they report into.
    pub parent_session_id: Option<String>,
    pub worker_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    pub fn new(prompt: impl Into<String>, name: Option<String>, color: TaskColor) -> Self {
        let prompt = prompt.into();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(&prompt));
        Self {
            id: Uuid::new_v4(),
            name,
            prompt,
            status: TaskStatus::Pending,
            color,
            group_id: None,
            tab_id: None,
            parent_session_id: None,
            worker_index: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            logs: Vec::new(),
        }
    }

    /// Trajectory session this task's events belong to.
    pub fn session_id(&self) -> String {
        self.parent_session_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_worker(&self) -> bool {
        self.parent_session_id.is_some()
    }

    /// Ordinary lifecycle transition. Timestamps follow the target state.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }
        self.status = target;
        match target {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.log(LogLevel::Info, format!("Status changed to {target}"));
        Ok(())
    }

    /// Explicit reactivation of a terminal task.
    pub fn reactivate(&mut self) -> Result<(), String> {
        if !self.status.is_terminal() {
            return Err(format!("Cannot reactivate a {} task", self.status));
        }
        self.status = TaskStatus::Pending;
        self.completed_at = None;
        self.error = None;
        self.log(LogLevel::Info, "Reactivated");
        Ok(())
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(TaskLogEntry {
            at: Utc::now(),
            level,
            message: message.into(),
        });
        if self.logs.len() > MAX_LOG_ENTRIES {
            let drain_count = self.logs.len() - MAX_LOG_ENTRIES;
            self.logs.drain(..drain_count);
        }
    }
}

fn default_name(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return "Untitled task".to_string();
    }
    let mut name: String = first_line.chars().take(40).collect();
    if first_line.chars().count() > 40 {
        name.push_str("...");
    }
    name
}

/// Derived running/pending counts shown on the extension badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Badge {
    pub running: usize,
    pub pending: usize,
}

impl Badge {
    /// Badge text; empty when nothing is running.
    pub fn text(&self) -> String {
        if self.running == 0 {
            String::new()
        } else {
            self.running.to_string()
        }
    }
}

/// Registry changes published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskUpdate {
    Created {
        task: Task,
    },
    StatusChanged {
        task_id: Uuid,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Badge {
        badge: Badge,
    },
    Deleted {
        task_id: Uuid,
    },
}
