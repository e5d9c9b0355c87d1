//! Error types for taskfleet.

use uuid::Uuid;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Notification error: {0}")]
    Sink(#[from] SinkError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistent store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised by (or about) an automation executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No usable credential or model. Never retried.
    #[error("Executor not configured: {0}")]
    Configuration(String),

    #[error("Executor initialization failed: {0}")]
    Initialization(String),

    #[error("Execution step failed: {0}")]
    Step(String),

    #[error("Execution cancelled")]
    Cancelled,

    /// The referenced tab (or other resource) no longer exists.
    #[error("Resource {resource_id} no longer exists")]
    StaleResource { resource_id: i64 },

    #[error("Capability not supported: {0}")]
    Unsupported(String),
}

impl ExecutorError {
    /// Whether this error happened before any work started because the
    /// executor could not be configured.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this is a benign race on a resource that disappeared.
    pub fn is_stale_resource(&self) -> bool {
        matches!(self, Self::StaleResource { .. })
    }
}

impl From<ConfigError> for ExecutorError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Task {id} is running; cancel it before deleting")]
    StillRunning { id: Uuid },

    #[error("No worker session for task {id}")]
    NoWorkerSession { id: Uuid },
}

/// Notification sink delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Sink closed")]
    Closed,
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
