//! Activity execution.
//!
//! Activities are the nondeterministic half of a workflow: network calls,
//! model invocations, anything with side effects. The executor runs one
//! attempt under a hard deadline and classifies the outcome; the retry
//! decision is made separately by [`ActivityExecutor::resolve`] so the
//! dispatcher can nack with backoff or record a terminal event.

use crate::definition::Registry;
use crate::queue::ActivityTask;
use async_trait::async_trait;
use keel_core::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Failure kind recorded when no activity is registered under the requested name.
pub const UNKNOWN_ACTIVITY: &str = "unknown_activity";
/// Failure kind recorded when an attempt exceeds its deadline.
pub const TIMEOUT: &str = "timeout";
/// Failure kind recorded when an attempt panics.
pub const PANICKED: &str = "panicked";
/// Failure kind recorded when a task is redelivered past its attempt limit.
pub const ATTEMPTS_EXHAUSTED: &str = "attempts_exhausted";

/// A recorded activity failure, as seen by workflow code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub kind: String,
    pub message: String,
}

impl ActivityFailure {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors an activity implementation returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// May succeed if tried again.
    Retryable { kind: String, message: String },
    /// Will never succeed; fail the activity now.
    NonRetryable { kind: String, message: String },
}

impl ActivityError {
    #[must_use]
    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: kind.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn non_retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NonRetryable {
            kind: kind.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    fn into_failure(self) -> ActivityFailure {
        match self {
            Self::Retryable { kind, message } | Self::NonRetryable { kind, message } => {
                ActivityFailure { kind, message }
            }
        }
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable { kind, message } => write!(f, "retryable {kind}: {message}"),
            Self::NonRetryable { kind, message } => write!(f, "non-retryable {kind}: {message}"),
        }
    }
}

impl std::error::Error for ActivityError {}

/// What an activity attempt knows about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    pub instance_id: WorkflowInstanceId,
    pub activity_id: u32,
    pub activity_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A unit of side-effecting work.
///
/// Implementations should be idempotent per `(instance_id, activity_id)`:
/// the same attempt can be delivered more than once.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn run(&self, ctx: ActivityContext, input: JsonValue) -> Result<JsonValue, ActivityError>;
}

/// The result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Success(JsonValue),
    Failure {
        failure: ActivityFailure,
        retryable: bool,
    },
    /// The attempt ran past its deadline and was aborted.
    Timeout,
}

/// What to do with an attempt's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Record `ActivityCompleted`.
    Complete(JsonValue),
    /// Redeliver the task after `delay`.
    Retry {
        delay: Duration,
        failure: ActivityFailure,
    },
    /// Record `ActivityFailed`.
    Fail(ActivityFailure),
}

/// Runs activity attempts looked up in a [`Registry`].
pub struct ActivityExecutor {
    registry: Arc<Registry>,
    default_timeout: Duration,
}

impl ActivityExecutor {
    #[must_use]
    pub fn new(registry: Arc<Registry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// Runs one attempt of `task` under its start-to-close deadline.
    ///
    /// The attempt runs on its own tokio task, so a panic is reported as a
    /// retryable failure and a timed-out attempt is aborted.
    #[instrument(skip(self, task), fields(
        instance_id = %task.workflow_instance_id,
        activity_id = task.activity_id,
        activity_type = %task.activity_type,
        attempt = task.attempt_count,
    ))]
    pub async fn execute(&self, task: &ActivityTask) -> ActivityOutcome {
        let Some(activity) = self.registry.activity(&task.activity_type) else {
            warn!("no activity registered");
            return ActivityOutcome::Failure {
                failure: ActivityFailure::new(
                    UNKNOWN_ACTIVITY,
                    format!("no activity registered as {}", task.activity_type),
                ),
                retryable: false,
            };
        };

        let deadline = task.start_to_close_timeout.unwrap_or(self.default_timeout);
        let ctx = ActivityContext {
            instance_id: task.workflow_instance_id,
            activity_id: task.activity_id,
            activity_type: task.activity_type.clone(),
            attempt: task.attempt_count,
        };
        let input = task.input.clone();
        let mut handle = tokio::spawn(async move { activity.run(ctx, input).await });

        let outcome = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(Ok(result))) => ActivityOutcome::Success(result),
            Ok(Ok(Err(err))) => ActivityOutcome::Failure {
                retryable: err.is_retryable(),
                failure: err.into_failure(),
            },
            Ok(Err(join_err)) => ActivityOutcome::Failure {
                failure: ActivityFailure::new(PANICKED, join_err.to_string()),
                retryable: true,
            },
            Err(_) => {
                handle.abort();
                ActivityOutcome::Timeout
            }
        };
        debug!(?outcome, "activity attempt finished");
        outcome
    }

    /// Applies the task's retry policy to an attempt outcome.
    #[must_use]
    pub fn resolve(task: &ActivityTask, outcome: ActivityOutcome) -> Resolution {
        let (failure, retryable) = match outcome {
            ActivityOutcome::Success(result) => return Resolution::Complete(result),
            ActivityOutcome::Failure { failure, retryable } => (failure, retryable),
            ActivityOutcome::Timeout => (
                ActivityFailure::new(TIMEOUT, "activity exceeded its start-to-close timeout"),
                true,
            ),
        };

        let policy = &task.retry_policy;
        if retryable
            && policy.is_retryable(&failure.kind)
            && policy.has_attempts_remaining(task.attempt_count)
        {
            Resolution::Retry {
                delay: policy.backoff_for_attempt(task.attempt_count),
                failure,
            }
        } else {
            Resolution::Fail(failure)
        }
    }
}
