//! The restricted context handed to workflow code.
//!
//! Workflow code runs from the top on every replay pass. Each scheduling call
//! takes the next step index for its kind; if history already holds that step
//! the call is checked against it, otherwise a [`Command`] is emitted. Waits
//! return recorded outcomes and suspend the pass when the outcome is not in
//! history yet.

use crate::activity::ActivityFailure;
use crate::command::Command;
use crate::error::DeterminismViolation;
use crate::instance::{ActivityResult, InstanceState};
use crate::retry::RetryPolicy;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Why a replay pass stopped before completing the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// Waiting on something history does not contain yet.
    Suspended,
    /// The workflow gave up; the instance fails with this error.
    Failed(String),
    /// The workflow acknowledged a cancellation request.
    Cancelled,
    /// The context detected a determinism violation and recorded it.
    Violation,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspended => write!(f, "suspended"),
            Self::Failed(error) => write!(f, "failed: {error}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Violation => write!(f, "determinism violation"),
        }
    }
}

impl std::error::Error for Interrupt {}

/// Per-activity options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActivityOptions {
    pub retry_policy: RetryPolicy,
    /// Per-attempt deadline. Falls back to the executor default.
    pub start_to_close_timeout: Option<Duration>,
}

impl ActivityOptions {
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }
}

/// Handle to a scheduled activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityHandle {
    pub activity_id: u32,
}

/// Handle to a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub timer_id: u32,
}

/// How far a pass got through recorded steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub activities: u32,
    pub timers: u32,
}

/// Deterministic view of an instance for workflow code.
///
/// There is no clock, randomness, network or filesystem here. Everything a
/// workflow decides must come from its input and from what this context
/// reports.
pub struct WorkflowContext<'h> {
    state: &'h InstanceState,
    next_activity: u32,
    next_timer: u32,
    signal_cursors: HashMap<String, usize>,
    commands: Vec<Command>,
    violations: Vec<DeterminismViolation>,
}

impl<'h> WorkflowContext<'h> {
    pub(crate) fn new(state: &'h InstanceState) -> Self {
        Self {
            state,
            next_activity: 0,
            next_timer: 0,
            signal_cursors: HashMap::new(),
            commands: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Schedules an activity with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::Violation`] if history recorded a different
    /// activity at this step.
    pub fn schedule_activity(
        &mut self,
        activity_type: &str,
        input: JsonValue,
    ) -> Result<ActivityHandle, Interrupt> {
        self.schedule_activity_with(activity_type, input, ActivityOptions::default())
    }

    /// Schedules an activity.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::Violation`] if history recorded a different
    /// activity at this step.
    pub fn schedule_activity_with(
        &mut self,
        activity_type: &str,
        input: JsonValue,
        options: ActivityOptions,
    ) -> Result<ActivityHandle, Interrupt> {
        let state = self.state;
        let activity_id = self.next_activity;
        self.next_activity += 1;

        if let Some(recorded) = state.activity(activity_id) {
            if recorded.activity_type != activity_type || recorded.input != input {
                return Err(self.violation(DeterminismViolation::HistoryMismatch {
                    step: format!("activity {activity_id}"),
                    recorded: format!("{}({})", recorded.activity_type, recorded.input),
                    requested: format!("{activity_type}({input})"),
                }));
            }
        } else {
            self.commands.push(Command::ScheduleActivity {
                activity_id,
                activity_type: activity_type.to_string(),
                input,
                retry_policy: options.retry_policy,
                start_to_close_timeout: options.start_to_close_timeout,
            });
        }

        Ok(ActivityHandle { activity_id })
    }

    /// Returns the recorded outcome of an activity.
    ///
    /// # Errors
    ///
    /// Suspends the pass if the outcome is not recorded yet.
    pub fn wait_activity(&mut self, handle: ActivityHandle) -> Result<ActivityResult, Interrupt> {
        match self
            .state
            .activity(handle.activity_id)
            .and_then(|activity| activity.outcome.clone())
        {
            Some(outcome) => Ok(outcome),
            None => Err(self.suspend()),
        }
    }

    /// Schedules an activity and waits for it.
    ///
    /// # Errors
    ///
    /// Suspends the pass until the activity resolves.
    pub fn call_activity(
        &mut self,
        activity_type: &str,
        input: JsonValue,
    ) -> Result<ActivityResult, Interrupt> {
        let handle = self.schedule_activity(activity_type, input)?;
        self.wait_activity(handle)
    }

    /// Schedules an activity with options and waits for it.
    ///
    /// # Errors
    ///
    /// Suspends the pass until the activity resolves.
    pub fn call_activity_with(
        &mut self,
        activity_type: &str,
        input: JsonValue,
        options: ActivityOptions,
    ) -> Result<ActivityResult, Interrupt> {
        let handle = self.schedule_activity_with(activity_type, input, options)?;
        self.wait_activity(handle)
    }

    /// Starts a durable timer.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt::Violation`] if history recorded a timer of a
    /// different duration at this step.
    pub fn start_timer(&mut self, duration: Duration) -> Result<TimerHandle, Interrupt> {
        let state = self.state;
        let timer_id = self.next_timer;
        self.next_timer += 1;

        match state.timers.get(&timer_id) {
            Some(recorded) if recorded.duration != duration => {
                return Err(self.violation(DeterminismViolation::HistoryMismatch {
                    step: format!("timer {timer_id}"),
                    recorded: format!("sleep({:?})", recorded.duration),
                    requested: format!("sleep({duration:?})"),
                }));
            }
            Some(_) => {}
            None => self.commands.push(Command::StartTimer { timer_id, duration }),
        }
        Ok(TimerHandle { timer_id })
    }

    /// Waits for a timer to fire.
    ///
    /// # Errors
    ///
    /// Suspends the pass until `TimerFired` is recorded.
    pub fn wait_timer(&mut self, handle: TimerHandle) -> Result<(), Interrupt> {
        let fired = self
            .state
            .timers
            .get(&handle.timer_id)
            .is_some_and(|timer| timer.fired);
        if fired { Ok(()) } else { Err(self.suspend()) }
    }

    /// Sleeps for `duration` of durable time.
    ///
    /// # Errors
    ///
    /// Suspends the pass until the timer fires.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let handle = self.start_timer(duration)?;
        self.wait_timer(handle)
    }

    /// Takes the next unseen signal with this name, if one was delivered.
    pub fn take_signal(&mut self, name: &str) -> Option<JsonValue> {
        let cursor = self.signal_cursors.entry(name.to_string()).or_insert(0);
        let signal = self
            .state
            .signals
            .iter()
            .filter(|signal| signal.name == name)
            .nth(*cursor)?;
        *cursor += 1;
        Some(signal.payload.clone())
    }

    /// Waits for the next unseen signal with this name.
    ///
    /// # Errors
    ///
    /// Suspends the pass until such a signal is delivered.
    pub fn wait_signal(&mut self, name: &str) -> Result<JsonValue, Interrupt> {
        match self.take_signal(name) {
            Some(payload) => Ok(payload),
            None => Err(self.suspend()),
        }
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.state.cancel_requested
    }

    /// Ends the workflow as failed.
    pub fn fail<T>(&self, error: impl Into<String>) -> Result<T, Interrupt> {
        Err(Interrupt::Failed(error.into()))
    }

    /// Ends the workflow as failed because an activity failed.
    pub fn fail_activity<T>(&self, failure: &ActivityFailure) -> Result<T, Interrupt> {
        self.fail(failure.to_string())
    }

    /// Ends the workflow as cancelled.
    pub fn cancelled<T>(&self) -> Result<T, Interrupt> {
        Err(Interrupt::Cancelled)
    }

    /// A wait that cannot be satisfied yet. Once cancellation is requested
    /// there is nothing left to wait for, so the pass ends as cancelled.
    fn suspend(&self) -> Interrupt {
        if self.state.cancel_requested {
            Interrupt::Cancelled
        } else {
            Interrupt::Suspended
        }
    }

    fn violation(&mut self, violation: DeterminismViolation) -> Interrupt {
        self.violations.push(violation);
        Interrupt::Violation
    }

    pub(crate) fn into_parts(self) -> (Vec<Command>, Vec<DeterminismViolation>, Progress) {
        let progress = Progress {
            activities: self.next_activity,
            timers: self.next_timer,
        };
        (self.commands, self.violations, progress)
    }
}
