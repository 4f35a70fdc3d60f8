use std::fmt;

/// Errors that stop the worker from starting.
#[derive(Debug)]
pub enum WorkerError {
    Config(config::ConfigError),
    Registry(keel_workflow::RegistryError),
    Backend(keel_workflow::nats::NatsSetupError),
    /// The internal API never reported ready.
    InternalApi { message: String },
    /// The startup demo instance could not be submitted.
    Submit { message: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::Registry(e) => write!(f, "registry setup failed: {e}"),
            Self::Backend(e) => write!(f, "backend setup failed: {e}"),
            Self::InternalApi { message } => write!(f, "internal API unavailable: {message}"),
            Self::Submit { message } => write!(f, "failed to submit demo workflow: {message}"),
        }
    }
}

impl std::error::Error for WorkerError {}
