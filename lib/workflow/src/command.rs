//! Commands produced by a replay pass.
//!
//! A command is a step the workflow code asked for that history does not
//! contain yet. The dispatcher turns each one into a history event and, once
//! the event is committed, into follow-up tasks.

use crate::clock;
use crate::history::EventKind;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        activity_id: u32,
        activity_type: String,
        input: JsonValue,
        retry_policy: RetryPolicy,
        start_to_close_timeout: Option<Duration>,
    },
    StartTimer {
        timer_id: u32,
        duration: Duration,
    },
    CompleteWorkflow {
        result: JsonValue,
    },
    FailWorkflow {
        error: String,
    },
    CancelWorkflow,
}

impl Command {
    /// Returns true if this command ends the instance.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow
        )
    }

    /// Converts the command into the event that records it.
    ///
    /// Timers are anchored at `now`, the time the pass is committed; replays
    /// read the recorded `fire_at` and never recompute it.
    #[must_use]
    pub fn into_event(self, now: DateTime<Utc>) -> EventKind {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                retry_policy,
                start_to_close_timeout,
            } => EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                retry_policy,
                start_to_close_timeout,
            },
            Self::StartTimer { timer_id, duration } => EventKind::TimerStarted {
                timer_id,
                duration,
                fire_at: now + clock::to_chrono(duration),
            },
            Self::CompleteWorkflow { result } => EventKind::WorkflowCompleted { result },
            Self::FailWorkflow { error } => EventKind::WorkflowFailed { error },
            Self::CancelWorkflow => EventKind::WorkflowCancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fire_at_is_anchored_at_commit_time() {
        let now = Utc::now();
        let event = Command::StartTimer {
            timer_id: 1,
            duration: Duration::from_secs(90),
        }
        .into_event(now);
        assert_eq!(
            event,
            EventKind::TimerStarted {
                timer_id: 1,
                duration: Duration::from_secs(90),
                fire_at: now + chrono::Duration::seconds(90),
            }
        );
    }

    #[test]
    fn terminal_commands() {
        assert!(Command::CancelWorkflow.is_terminal());
        assert!(
            Command::FailWorkflow {
                error: "declined".to_string(),
            }
            .is_terminal()
        );
        assert!(
            !Command::StartTimer {
                timer_id: 0,
                duration: Duration::ZERO,
            }
            .is_terminal()
        );
    }
}
