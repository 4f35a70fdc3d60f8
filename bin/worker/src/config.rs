//! Worker configuration.
//!
//! Loaded via the `config` crate from `KEEL__`-prefixed environment
//! variables, with `__` separating nested keys:
//! `KEEL__BACKEND=nats`, `KEEL__NATS__URL=nats://nats:4222`,
//! `KEEL__QUEUES__VISIBILITY_TIMEOUT_MS=45000`.

use keel_internal_api::InternalApiConfig;
use keel_workflow::DispatcherConfig;
use keel_workflow::nats::NatsConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Where history and tasks live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process only; state is lost on exit.
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub backend: Backend,
    pub nats: NatsConfig,
    pub queues: QueueConfig,
    pub activities: ActivityConfig,
    pub workflows: WorkflowConfig,
    /// Unset means activities run without the internal API.
    pub internal_api: Option<InternalApiSettings>,
    pub workers: WorkerCounts,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Used when an activity is scheduled without its own deadline.
    pub default_timeout_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// How long terminal instances are kept before purging.
    pub retention_secs: u64,
    pub execution_timeout_secs: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 60 * 60,
            execution_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternalApiSettings {
    pub socket_path: PathBuf,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_ready_timeout_secs() -> u64 {
    60
}

/// Worker loops to run per queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerCounts {
    pub workflow: usize,
    pub activity: usize,
    pub timer: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            workflow: 1,
            activity: 2,
            timer: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Submits one Order instance for this item at startup.
    pub order_item: Option<String>,
}

impl WorkerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(config::Environment::with_prefix("KEEL"))
    }

    fn load(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                environment
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            visibility_timeout: Duration::from_millis(self.queues.visibility_timeout_ms),
            poll_interval: Duration::from_millis(self.queues.poll_interval_ms),
            retention: Duration::from_secs(self.workflows.retention_secs),
            default_activity_timeout: Duration::from_millis(self.activities.default_timeout_ms),
            default_execution_timeout: self.workflows.execution_timeout_secs.map(Duration::from_secs),
            ..DispatcherConfig::default()
        }
    }

    #[must_use]
    pub fn internal_api_config(&self) -> Option<InternalApiConfig> {
        self.internal_api.as_ref().map(|settings| {
            let mut config = InternalApiConfig::new(&settings.socket_path);
            config.request_timeout = Duration::from_millis(settings.request_timeout_ms);
            config.ready_timeout = Duration::from_secs(settings.ready_timeout_secs);
            config
        })
    }
}
