//! Task registry, lifecycle state machine and admission.

pub mod manager;
pub mod model;

pub use manager::{TaskManager, TaskManagerDeps, TaskOptions};
pub use model::{Badge, LogLevel, Task, TaskColor, TaskLogEntry, TaskStatus, TaskUpdate};
