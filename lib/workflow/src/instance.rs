//! Instance state reconstruction from history.
//!
//! An instance's status is never stored. It is derived by folding its events
//! in order, which is also what the replay engine does before running
//! workflow code. The fold rejects histories that could not have been
//! produced by the engine.

use crate::activity::ActivityFailure;
use crate::definition::WorkflowType;
use crate::history::{EventKind, HistoryEvent};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use keel_core::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl WorkflowStatus {
    /// Returns true if no further events may be appended.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// The recorded outcome of an activity.
pub type ActivityResult = Result<JsonValue, ActivityFailure>;

/// An activity recorded in history.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledActivity {
    pub activity_type: String,
    pub input: JsonValue,
    pub retry_policy: RetryPolicy,
    pub start_to_close_timeout: Option<Duration>,
    /// `None` while the activity is still in flight.
    pub outcome: Option<ActivityResult>,
}

/// A timer recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedTimer {
    pub duration: Duration,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
}

/// A delivered signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub payload: JsonValue,
}

/// Everything history says about an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub instance_id: WorkflowInstanceId,
    pub workflow_type: WorkflowType,
    pub input: JsonValue,
    pub execution_timeout: Option<Duration>,
    pub started_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    /// When the terminal event was committed.
    pub finished_at: Option<DateTime<Utc>>,
    pub activities: BTreeMap<u32, ScheduledActivity>,
    pub timers: BTreeMap<u32, StartedTimer>,
    /// Signals in delivery order.
    pub signals: Vec<Signal>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    /// Sequence of the last folded event.
    pub last_sequence: u64,
}

impl InstanceState {
    /// Folds a full history, earliest event first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history is empty, does not start with
    /// `WorkflowStarted`, has sequence gaps, or records an impossible transition.
    pub fn from_events(
        instance_id: WorkflowInstanceId,
        events: impl IntoIterator<Item = HistoryEvent>,
    ) -> Result<Self, InstanceStateError> {
        let mut events = events.into_iter();
        let first = events.next().ok_or(InstanceStateError::NoEvents)?;

        if first.sequence != 0 {
            return Err(InstanceStateError::SequenceGap {
                expected: 0,
                found: first.sequence,
            });
        }

        let EventKind::WorkflowStarted {
            workflow_type,
            input,
            execution_timeout,
        } = first.kind
        else {
            return Err(InstanceStateError::MissingWorkflowStarted);
        };

        let mut state = Self {
            instance_id,
            workflow_type,
            input,
            execution_timeout,
            started_at: first.timestamp,
            status: WorkflowStatus::Running,
            finished_at: None,
            activities: BTreeMap::new(),
            timers: BTreeMap::new(),
            signals: Vec::new(),
            cancel_requested: false,
            cancel_reason: None,
            result: None,
            error: None,
            last_sequence: 0,
        };

        for event in events {
            state.apply(event)?;
        }

        Ok(state)
    }

    fn apply(&mut self, event: HistoryEvent) -> Result<(), InstanceStateError> {
        let expected = self.last_sequence + 1;
        if event.sequence != expected {
            return Err(InstanceStateError::SequenceGap {
                expected,
                found: event.sequence,
            });
        }
        if self.status.is_terminal() {
            return Err(InstanceStateError::EventAfterTerminal {
                sequence: event.sequence,
            });
        }
        self.last_sequence = event.sequence;

        match event.kind {
            EventKind::WorkflowStarted { .. } => {
                return Err(InstanceStateError::DuplicateWorkflowStarted);
            }
            EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                retry_policy,
                start_to_close_timeout,
            } => {
                if self.activities.contains_key(&activity_id) {
                    return Err(InstanceStateError::DuplicateActivity { activity_id });
                }
                self.activities.insert(
                    activity_id,
                    ScheduledActivity {
                        activity_type,
                        input,
                        retry_policy,
                        start_to_close_timeout,
                        outcome: None,
                    },
                );
            }
            EventKind::ActivityCompleted {
                activity_id,
                result,
                ..
            } => self.resolve_activity(activity_id, Ok(result))?,
            EventKind::ActivityFailed {
                activity_id,
                failure,
                ..
            } => self.resolve_activity(activity_id, Err(failure))?,
            EventKind::TimerStarted {
                timer_id,
                duration,
                fire_at,
            } => {
                if self.timers.contains_key(&timer_id) {
                    return Err(InstanceStateError::DuplicateTimer { timer_id });
                }
                self.timers.insert(
                    timer_id,
                    StartedTimer {
                        duration,
                        fire_at,
                        fired: false,
                    },
                );
            }
            EventKind::TimerFired { timer_id } => {
                let timer = self
                    .timers
                    .get_mut(&timer_id)
                    .ok_or(InstanceStateError::UnknownTimer { timer_id })?;
                if timer.fired {
                    return Err(InstanceStateError::DuplicateTimer { timer_id });
                }
                timer.fired = true;
            }
            EventKind::SignalReceived { name, payload } => {
                self.signals.push(Signal { name, payload });
            }
            EventKind::CancelRequested { reason } => {
                self.cancel_requested = true;
                if self.cancel_reason.is_none() {
                    self.cancel_reason = reason;
                }
            }
            EventKind::WorkflowCompleted { result } => {
                self.finish(WorkflowStatus::Completed, event.timestamp);
                self.result = Some(result);
            }
            EventKind::WorkflowFailed { error } => {
                self.finish(WorkflowStatus::Failed, event.timestamp);
                self.error = Some(error);
            }
            EventKind::WorkflowCancelled => {
                self.finish(WorkflowStatus::Cancelled, event.timestamp);
            }
            EventKind::WorkflowTimedOut => {
                self.finish(WorkflowStatus::TimedOut, event.timestamp);
            }
        }
        Ok(())
    }

    fn resolve_activity(
        &mut self,
        activity_id: u32,
        outcome: ActivityResult,
    ) -> Result<(), InstanceStateError> {
        let activity = self
            .activities
            .get_mut(&activity_id)
            .ok_or(InstanceStateError::UnknownActivity { activity_id })?;
        if activity.outcome.is_some() {
            return Err(InstanceStateError::DuplicateActivityOutcome { activity_id });
        }
        activity.outcome = Some(outcome);
        Ok(())
    }

    fn finish(&mut self, status: WorkflowStatus, timestamp: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(timestamp);
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn activity(&self, activity_id: u32) -> Option<&ScheduledActivity> {
        self.activities.get(&activity_id)
    }

    /// Returns true if the activity has a recorded outcome.
    #[must_use]
    pub fn is_activity_resolved(&self, activity_id: u32) -> bool {
        self.activity(activity_id)
            .is_some_and(|activity| activity.outcome.is_some())
    }

    /// Activities scheduled but not yet resolved.
    pub fn outstanding_activities(&self) -> impl Iterator<Item = (u32, &ScheduledActivity)> {
        self.activities
            .iter()
            .filter(|(_, activity)| activity.outcome.is_none())
            .map(|(id, activity)| (*id, activity))
    }

    #[must_use]
    pub fn has_outstanding_activities(&self) -> bool {
        self.outstanding_activities().next().is_some()
    }

    /// Timers started but not yet fired.
    pub fn pending_timers(&self) -> impl Iterator<Item = (u32, &StartedTimer)> {
        self.timers
            .iter()
            .filter(|(_, timer)| !timer.fired)
            .map(|(id, timer)| (*id, timer))
    }
}

/// Errors from folding a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStateError {
    NoEvents,
    MissingWorkflowStarted,
    DuplicateWorkflowStarted,
    SequenceGap { expected: u64, found: u64 },
    EventAfterTerminal { sequence: u64 },
    DuplicateActivity { activity_id: u32 },
    UnknownActivity { activity_id: u32 },
    DuplicateActivityOutcome { activity_id: u32 },
    DuplicateTimer { timer_id: u32 },
    UnknownTimer { timer_id: u32 },
}

impl fmt::Display for InstanceStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEvents => write!(f, "no events provided"),
            Self::MissingWorkflowStarted => write!(f, "first event must be WorkflowStarted"),
            Self::DuplicateWorkflowStarted => write!(f, "duplicate WorkflowStarted event"),
            Self::SequenceGap { expected, found } => {
                write!(f, "expected sequence {expected}, found {found}")
            }
            Self::EventAfterTerminal { sequence } => {
                write!(f, "event {sequence} recorded after the workflow ended")
            }
            Self::DuplicateActivity { activity_id } => {
                write!(f, "activity {activity_id} scheduled twice")
            }
            Self::UnknownActivity { activity_id } => {
                write!(f, "outcome recorded for unscheduled activity {activity_id}")
            }
            Self::DuplicateActivityOutcome { activity_id } => {
                write!(f, "activity {activity_id} resolved twice")
            }
            Self::DuplicateTimer { timer_id } => write!(f, "timer {timer_id} recorded twice"),
            Self::UnknownTimer { timer_id } => write!(f, "unknown timer {timer_id}"),
        }
    }
}

impl std::error::Error for InstanceStateError {}
