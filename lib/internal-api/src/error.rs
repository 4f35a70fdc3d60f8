use keel_workflow::DeterminismViolation;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors from the internal API client.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalApiError {
    /// Called from workflow code, where network access is not allowed.
    Sandboxed(DeterminismViolation),
    /// The socket could not be reached.
    Connect { path: PathBuf, message: String },
    /// Reading or writing a frame failed.
    Io { message: String },
    /// The peer sent something that is not a response frame.
    Protocol { message: String },
    /// The response status is outside 2xx, 4xx and 5xx.
    UnexpectedStatus { status: u16 },
    /// The API did not report ready in time.
    NotReady { waited: Duration },
}

impl fmt::Display for InternalApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandboxed(violation) => write!(f, "refused inside workflow code: {violation}"),
            Self::Connect { path, message } => {
                write!(f, "failed to connect to {}: {message}", path.display())
            }
            Self::Io { message } => write!(f, "internal API I/O error: {message}"),
            Self::Protocol { message } => write!(f, "internal API protocol error: {message}"),
            Self::UnexpectedStatus { status } => write!(f, "unexpected status {status}"),
            Self::NotReady { waited } => {
                write!(f, "internal API not ready after {}ms", waited.as_millis())
            }
        }
    }
}

impl std::error::Error for InternalApiError {}

impl From<DeterminismViolation> for InternalApiError {
    fn from(e: DeterminismViolation) -> Self {
        Self::Sandboxed(e)
    }
}
