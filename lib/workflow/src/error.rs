//! Error types for the workflow crate.
//!
//! Storage and queue errors live next to their traits (`HistoryError`,
//! `QueueError`). This module holds the errors that cross component
//! boundaries:
//! - `DeterminismViolation`: workflow code stepped outside the replay contract
//! - `ReplayError`: the replay engine could not advance an instance
//! - `RegistryError`: registering a workflow or activity failed
//! - `DispatchError`: claim, persist or enqueue failed in the dispatcher
//! - `ClientError`: submission interface failures, wrapped in a `Report`

use crate::definition::WorkflowType;
use crate::history::HistoryError;
use crate::instance::{InstanceStateError, WorkflowStatus};
use crate::queue::QueueError;
use crate::sandbox::Capability;
use keel_core::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow code did something a replay cannot reproduce.
///
/// Violations are never retried. The task that hit one is moved to the dead
/// letter queue and the instance keeps its last committed history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeterminismViolation {
    /// A guarded capability was used while workflow code was running.
    RestrictedCapability {
        workflow: String,
        capability: Capability,
    },
    /// The code requested a different step than the one recorded at this position.
    HistoryMismatch {
        step: String,
        recorded: String,
        requested: String,
    },
    /// The code finished without revisiting a step that history recorded.
    UnreplayedHistory { step: String },
}

impl fmt::Display for DeterminismViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestrictedCapability {
                workflow,
                capability,
            } => write!(f, "workflow {workflow} used restricted capability: {capability}"),
            Self::HistoryMismatch {
                step,
                recorded,
                requested,
            } => write!(
                f,
                "{step} diverged from history: recorded {recorded}, requested {requested}"
            ),
            Self::UnreplayedHistory { step } => {
                write!(f, "workflow finished without replaying recorded {step}")
            }
        }
    }
}

impl std::error::Error for DeterminismViolation {}

/// Errors from advancing an instance through the replay engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// The instance has no history.
    NotFound { instance_id: WorkflowInstanceId },
    /// Reading history failed.
    History(HistoryError),
    /// History could not be folded into a valid state.
    InvalidHistory(InstanceStateError),
    /// No definition is registered for the recorded workflow type.
    UnknownWorkflow { workflow_type: WorkflowType },
    /// The pass violated determinism.
    Determinism(Vec<DeterminismViolation>),
    /// Workflow code panicked.
    Panicked {
        workflow_type: WorkflowType,
        message: String,
    },
}

impl ReplayError {
    /// Returns true if retrying the same task could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::History(err) if err.is_transient())
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { instance_id } => write!(f, "workflow instance not found: {instance_id}"),
            Self::History(e) => write!(f, "history error: {e}"),
            Self::InvalidHistory(e) => write!(f, "invalid history: {e}"),
            Self::UnknownWorkflow { workflow_type } => {
                write!(f, "no definition registered for {workflow_type}")
            }
            Self::Determinism(violations) => {
                write!(f, "determinism violation")?;
                for violation in violations {
                    write!(f, "; {violation}")?;
                }
                Ok(())
            }
            Self::Panicked {
                workflow_type,
                message,
            } => write!(f, "workflow {workflow_type} panicked: {message}"),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<HistoryError> for ReplayError {
    fn from(e: HistoryError) -> Self {
        Self::History(e)
    }
}

impl From<InstanceStateError> for ReplayError {
    fn from(e: InstanceStateError) -> Self {
        Self::InvalidHistory(e)
    }
}

/// Errors from building a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// This workflow name and version is already registered.
    DuplicateWorkflow { workflow_type: WorkflowType },
    /// An activity with this name is already registered.
    DuplicateActivity { activity_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateWorkflow { workflow_type } => {
                write!(f, "workflow already registered: {workflow_type}")
            }
            Self::DuplicateActivity { activity_type } => {
                write!(f, "activity already registered: {activity_type}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors from the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// History store error.
    History(HistoryError),
    /// Task queue error.
    Queue(QueueError),
    /// History could not be folded into a valid state.
    InvalidHistory(InstanceStateError),
    /// The instance has no history.
    InstanceNotFound { instance_id: WorkflowInstanceId },
    /// Appends kept conflicting with concurrent writers.
    ContentionExhausted { instance_id: WorkflowInstanceId },
}

impl DispatchError {
    /// Returns true if the backing store or queue was unreachable.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::History(e) => e.is_transient(),
            Self::Queue(e) => matches!(e, QueueError::Unavailable { .. }),
            Self::ContentionExhausted { .. } => true,
            Self::InvalidHistory(_) | Self::InstanceNotFound { .. } => false,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History(e) => write!(f, "history error: {e}"),
            Self::Queue(e) => write!(f, "queue error: {e}"),
            Self::InvalidHistory(e) => write!(f, "invalid history: {e}"),
            Self::InstanceNotFound { instance_id } => {
                write!(f, "workflow instance not found: {instance_id}")
            }
            Self::ContentionExhausted { instance_id } => {
                write!(f, "gave up appending to {instance_id} after repeated conflicts")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<HistoryError> for DispatchError {
    fn from(e: HistoryError) -> Self {
        Self::History(e)
    }
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<InstanceStateError> for DispatchError {
    fn from(e: InstanceStateError) -> Self {
        Self::InvalidHistory(e)
    }
}

/// Errors from the workflow submission interface.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// No definition is registered for this workflow type.
    UnknownWorkflowType { workflow_type: WorkflowType },
    /// The instance does not exist.
    InstanceNotFound { instance_id: WorkflowInstanceId },
    /// The instance already reached a terminal status.
    InstanceTerminal {
        instance_id: WorkflowInstanceId,
        status: WorkflowStatus,
    },
    /// The engine failed underneath the request.
    Engine(DispatchError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWorkflowType { workflow_type } => {
                write!(f, "unknown workflow type: {workflow_type}")
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "workflow instance not found: {instance_id}")
            }
            Self::InstanceTerminal {
                instance_id,
                status,
            } => write!(f, "workflow instance {instance_id} is already {status}"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<DispatchError> for ClientError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::InstanceNotFound { instance_id } => {
                Self::InstanceNotFound { instance_id }
            }
            other => Self::Engine(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_display() {
        let err = DeterminismViolation::HistoryMismatch {
            step: "activity 0".to_string(),
            recorded: "Charge".to_string(),
            requested: "Refund".to_string(),
        };
        assert!(err.to_string().contains("activity 0 diverged"));
        assert!(err.to_string().contains("recorded Charge"));
    }

    #[test]
    fn replay_error_lists_violations() {
        let err = ReplayError::Determinism(vec![
            DeterminismViolation::RestrictedCapability {
                workflow: "Order@v1".to_string(),
                capability: Capability::Network,
            },
            DeterminismViolation::UnreplayedHistory {
                step: "timer 0".to_string(),
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("network"));
        assert!(message.contains("timer 0"));
    }

    #[test]
    fn only_unavailable_history_is_transient() {
        let unavailable = ReplayError::History(HistoryError::Unavailable {
            message: "down".to_string(),
        });
        assert!(unavailable.is_transient());

        let missing = ReplayError::NotFound {
            instance_id: WorkflowInstanceId::new(),
        };
        assert!(!missing.is_transient());
    }

    #[test]
    fn client_error_maps_missing_instance() {
        let instance_id = WorkflowInstanceId::new();
        let err = ClientError::from(DispatchError::InstanceNotFound { instance_id });
        assert_eq!(err, ClientError::InstanceNotFound { instance_id });
    }
}
