//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks in `running` at any instant.
    pub max_concurrent_tasks: usize,
    /// Recent events retained per session for late-joining readers.
    pub event_buffer_size: usize,
    /// Quiet period before a trajectory mutation is flushed.
    pub flush_debounce: Duration,
    /// How long a completed trajectory stays in memory before eviction.
    pub eviction_grace: Duration,
    /// Delay before a cancelled task's event subscription is torn down.
    pub cancel_cleanup_delay: Duration,
    /// Credentials and model used to build executors.
    pub model: ModelSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            event_buffer_size: 200,
            flush_debounce: Duration::from_millis(500),
            eviction_grace: Duration::from_secs(30),
            cancel_cleanup_delay: Duration::from_secs(2),
            model: ModelSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_concurrent_tasks = env_parse("TASKFLEET_MAX_CONCURRENT")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.max_concurrent_tasks);

        let event_buffer_size =
            env_parse("TASKFLEET_EVENT_BUFFER").unwrap_or(defaults.event_buffer_size);

        let flush_debounce = env_parse("TASKFLEET_FLUSH_DEBOUNCE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_debounce);

        let eviction_grace = env_parse("TASKFLEET_EVICTION_GRACE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.eviction_grace);

        Self {
            max_concurrent_tasks,
            event_buffer_size,
            flush_debounce,
            eviction_grace,
            cancel_cleanup_delay: defaults.cancel_cleanup_delay,
            model: ModelSettings::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Model selection and credentials handed to executors.
#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<SecretString>,
}

impl ModelSettings {
    pub fn from_env() -> Self {
        Self {
            provider: std::env::var("TASKFLEET_PROVIDER").unwrap_or_else(|_| "anthropic".into()),
            model: std::env::var("TASKFLEET_MODEL").ok().filter(|s| !s.is_empty()),
            api_key: std::env::var("TASKFLEET_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
        }
    }

    /// Fails when no usable credential or model is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "api_key".to_string(),
                hint: "Set TASKFLEET_API_KEY or configure a provider key.".to_string(),
            });
        }
        if self.model.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingRequired {
                key: "model".to_string(),
                hint: "Set TASKFLEET_MODEL to a model id.".to_string(),
            });
        }
        Ok(())
    }

    /// Validated model id and credential.
    pub fn resolve(&self) -> Result<(String, SecretString), ConfigError> {
        self.validate()?;
        match (&self.model, &self.api_key) {
            (Some(model), Some(key)) => Ok((model.clone(), key.clone())),
            _ => Err(ConfigError::MissingRequired {
                key: "model".to_string(),
                hint: "Set TASKFLEET_MODEL and TASKFLEET_API_KEY.".to_string(),
            }),
        }
    }

    /// Copy with the model replaced, keeping the credential.
    pub fn with_model(&self, model: Option<&str>) -> Self {
        match model {
            Some(m) => Self {
                model: Some(m.to_string()),
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}
