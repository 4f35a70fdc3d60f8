//! Append-only event history per workflow instance.
//!
//! History is the only source of truth for an instance. Every write is an
//! optimistic append: the caller states the last sequence it observed and the
//! store rejects the write with [`HistoryError::Conflict`] if anyone else
//! appended first. Sequences start at 0 and never have gaps.

use crate::activity::ActivityFailure;
use crate::definition::WorkflowType;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use keel_core::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// A committed history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position within the instance history, starting at 0.
    pub sequence: u64,
    /// When the event was committed.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

/// The payload of a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Always the first event of an instance.
    WorkflowStarted {
        workflow_type: WorkflowType,
        input: JsonValue,
        #[serde(default)]
        execution_timeout: Option<Duration>,
    },
    ActivityScheduled {
        activity_id: u32,
        activity_type: String,
        input: JsonValue,
        retry_policy: RetryPolicy,
        #[serde(default)]
        start_to_close_timeout: Option<Duration>,
    },
    ActivityCompleted {
        activity_id: u32,
        result: JsonValue,
        attempt: u32,
    },
    ActivityFailed {
        activity_id: u32,
        failure: ActivityFailure,
        attempt: u32,
    },
    TimerStarted {
        timer_id: u32,
        /// What the workflow asked for; replay checks it against the code.
        duration: Duration,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: u32,
    },
    SignalReceived {
        name: String,
        payload: JsonValue,
    },
    CancelRequested {
        #[serde(default)]
        reason: Option<String>,
    },
    WorkflowCompleted {
        result: JsonValue,
    },
    WorkflowFailed {
        error: String,
    },
    WorkflowCancelled,
    WorkflowTimedOut,
}

impl EventKind {
    /// Returns the snake_case name of this event kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::SignalReceived { .. } => "signal_received",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::WorkflowTimedOut => "workflow_timed_out",
        }
    }

    /// Returns true if this event ends the instance.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled
                | Self::WorkflowTimedOut
        )
    }
}

/// An event that has not been assigned a sequence yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    #[must_use]
    pub fn new(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self { kind, timestamp }
    }
}

/// Errors from history store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// Another writer appended since `expected` was observed.
    Conflict {
        instance_id: WorkflowInstanceId,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    /// The backing store could not be reached.
    Unavailable { message: String },
    /// A stored record could not be decoded.
    Corrupt {
        instance_id: WorkflowInstanceId,
        message: String,
    },
}

impl HistoryError {
    /// Returns true if the operation may succeed when retried unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

fn describe(sequence: Option<u64>) -> String {
    sequence.map_or_else(|| "empty".to_string(), |s| s.to_string())
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict {
                instance_id,
                expected,
                actual,
            } => write!(
                f,
                "append conflict on {instance_id}: expected {}, found {}",
                describe(*expected),
                describe(*actual)
            ),
            Self::Unavailable { message } => write!(f, "history store unavailable: {message}"),
            Self::Corrupt {
                instance_id,
                message,
            } => write!(f, "corrupt history for {instance_id}: {message}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Durable, ordered, append-only event storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends an event if the last committed sequence is `expected_last`.
    ///
    /// `None` means the history must be empty. Returns the committed sequence.
    async fn append(
        &self,
        instance_id: WorkflowInstanceId,
        expected_last: Option<u64>,
        event: NewEvent,
    ) -> Result<u64, HistoryError>;

    /// Streams events starting at `from`, in sequence order.
    fn read(
        &self,
        instance_id: WorkflowInstanceId,
        from: u64,
    ) -> BoxStream<'_, Result<HistoryEvent, HistoryError>>;

    /// Returns the last committed sequence, or `None` for an empty history.
    async fn last_sequence(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Option<u64>, HistoryError>;

    /// Deletes the whole history of an instance.
    async fn purge(&self, instance_id: WorkflowInstanceId) -> Result<(), HistoryError>;

    /// Reads the full history from sequence 0.
    async fn read_all(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Vec<HistoryEvent>, HistoryError> {
        self.read(instance_id, 0).try_collect().await
    }
}

/// History store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    instances: RwLock<HashMap<WorkflowInstanceId, Vec<HistoryEvent>>>,
}

impl InMemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    #[instrument(skip(self, event), fields(kind = event.kind.name()))]
    async fn append(
        &self,
        instance_id: WorkflowInstanceId,
        expected_last: Option<u64>,
        event: NewEvent,
    ) -> Result<u64, HistoryError> {
        let mut instances = self.instances.write().await;
        let actual = instances
            .get(&instance_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence);

        if actual != expected_last {
            return Err(HistoryError::Conflict {
                instance_id,
                expected: expected_last,
                actual,
            });
        }

        let sequence = actual.map_or(0, |s| s + 1);
        instances.entry(instance_id).or_default().push(HistoryEvent {
            sequence,
            timestamp: event.timestamp,
            kind: event.kind,
        });
        debug!(sequence, "appended history event");
        Ok(sequence)
    }

    fn read(
        &self,
        instance_id: WorkflowInstanceId,
        from: u64,
    ) -> BoxStream<'_, Result<HistoryEvent, HistoryError>> {
        stream::unfold(from, move |next| async move {
            let index = usize::try_from(next).ok()?;
            let instances = self.instances.read().await;
            let event = instances.get(&instance_id)?.get(index)?.clone();
            Some((Ok::<_, HistoryError>(event), next + 1))
        })
        .boxed()
    }

    async fn last_sequence(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Option<u64>, HistoryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .get(&instance_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence))
    }

    async fn purge(&self, instance_id: WorkflowInstanceId) -> Result<(), HistoryError> {
        self.instances.write().await.remove(&instance_id);
        Ok(())
    }
}
