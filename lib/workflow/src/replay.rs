//! Deterministic re-execution of workflow code against history.
//!
//! Suspension is end-of-history: each pass runs the definition from its
//! initial state until it either finishes or waits on something history does
//! not contain. The commands collected on the way are the new steps to
//! persist. Nothing survives between passes except history.

use crate::command::Command;
use crate::context::{Interrupt, Progress, WorkflowContext};
use crate::definition::{Registry, WorkflowDefinition};
use crate::error::{DeterminismViolation, ReplayError};
use crate::history::HistoryStore;
use crate::instance::InstanceState;
use crate::sandbox::DeterministicScope;
use keel_core::WorkflowInstanceId;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, instrument};

/// The result of advancing an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Advancement {
    pub instance_id: WorkflowInstanceId,
    /// Last sequence the pass observed. New events must append after it.
    pub observed_last: u64,
    /// State folded from the history the pass replayed.
    pub state: InstanceState,
    /// Steps to persist, in order.
    pub commands: Vec<Command>,
}

/// Replays instances using definitions from a [`Registry`].
pub struct ReplayEngine {
    registry: Arc<Registry>,
    history: Arc<dyn HistoryStore>,
}

impl ReplayEngine {
    #[must_use]
    pub fn new(registry: Arc<Registry>, history: Arc<dyn HistoryStore>) -> Self {
        Self { registry, history }
    }

    /// Reads the full history of an instance and runs one replay pass.
    ///
    /// Terminal instances produce no commands.
    ///
    /// # Errors
    ///
    /// Returns an error if history cannot be read or folded, the workflow type
    /// is not registered, or the pass violates determinism.
    #[instrument(skip(self))]
    pub async fn advance(&self, instance_id: WorkflowInstanceId) -> Result<Advancement, ReplayError> {
        let events = self.history.read_all(instance_id).await?;
        if events.is_empty() {
            return Err(ReplayError::NotFound { instance_id });
        }
        let state = InstanceState::from_events(instance_id, events)?;

        let commands = if state.is_terminal() {
            Vec::new()
        } else {
            let definition = self.registry.workflow(&state.workflow_type).ok_or_else(|| {
                ReplayError::UnknownWorkflow {
                    workflow_type: state.workflow_type.clone(),
                }
            })?;
            replay(&state, definition.as_ref())?
        };

        debug!(
            observed_last = state.last_sequence,
            commands = commands.len(),
            "replay pass finished"
        );
        Ok(Advancement {
            instance_id,
            observed_last: state.last_sequence,
            state,
            commands,
        })
    }
}

/// Runs one pass of `definition` over `state`.
///
/// The pass runs inside a [`DeterministicScope`], so any guarded capability
/// touched by the workflow code fails the pass even if the code ignores the
/// error. A terminal command is held back while scheduled activities are
/// unresolved; the next pass after they resolve decides again.
///
/// # Errors
///
/// Returns [`ReplayError::Determinism`] on any violation and
/// [`ReplayError::Panicked`] if the workflow code panics.
pub fn replay(
    state: &InstanceState,
    definition: &dyn WorkflowDefinition,
) -> Result<Vec<Command>, ReplayError> {
    let scope = DeterministicScope::enter(state.workflow_type.to_string());
    let mut ctx = WorkflowContext::new(state);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| definition.run(&mut ctx, &state.input)));
    let mut violations = scope.finish();

    let result = outcome.map_err(|payload| ReplayError::Panicked {
        workflow_type: state.workflow_type.clone(),
        message: panic_message(payload.as_ref()),
    })?;

    let (mut commands, context_violations, progress) = ctx.into_parts();
    violations.extend(context_violations);

    let terminal = match result {
        Ok(value) => Some(Command::CompleteWorkflow { result: value }),
        Err(Interrupt::Failed(error)) => Some(Command::FailWorkflow { error }),
        Err(Interrupt::Cancelled) => Some(Command::CancelWorkflow),
        Err(Interrupt::Suspended | Interrupt::Violation) => None,
    };

    if terminal.is_some() {
        violations.extend(unreplayed_steps(state, progress));
    }
    if !violations.is_empty() {
        return Err(ReplayError::Determinism(violations));
    }

    if let Some(command) = terminal {
        let scheduling_now = commands
            .iter()
            .any(|c| matches!(c, Command::ScheduleActivity { .. }));
        if !state.has_outstanding_activities() && !scheduling_now {
            commands.push(command);
        }
    }

    Ok(commands)
}

fn unreplayed_steps(state: &InstanceState, progress: Progress) -> Vec<DeterminismViolation> {
    let activities = state
        .activities
        .range(progress.activities..)
        .map(|(id, _)| format!("activity {id}"));
    let timers = state
        .timers
        .range(progress.timers..)
        .map(|(id, _)| format!("timer {id}"));
    activities
        .chain(timers)
        .map(|step| DeterminismViolation::UnreplayedHistory { step })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowContext;
    use crate::definition::{WorkflowResult, WorkflowType};
    use crate::history::{EventKind, InMemoryHistoryStore, NewEvent};
    use crate::instance::WorkflowStatus;
    use crate::retry::RetryPolicy;
    use crate::sandbox::{self, Capability};
    use crate::testing::{Echo, leaky_workflow, order_workflow};
    use chrono::Utc;
    use serde_json::{Value as JsonValue, json};

    fn fire_and_forget(ctx: &mut WorkflowContext<'_>, _input: &JsonValue) -> WorkflowResult {
        ctx.schedule_activity(Echo::NAME, json!("background"))?;
        Ok(json!("early"))
    }

    fn short(_ctx: &mut WorkflowContext<'_>, _input: &JsonValue) -> WorkflowResult {
        Ok(json!("short"))
    }

    fn panics(_ctx: &mut WorkflowContext<'_>, _input: &JsonValue) -> WorkflowResult {
        panic!("boom")
    }

    struct Fixture {
        store: Arc<InMemoryHistoryStore>,
        engine: ReplayEngine,
        instance_id: WorkflowInstanceId,
        last: Option<u64>,
    }

    impl Fixture {
        async fn start(name: &str) -> Self {
            let registry = Registry::builder()
                .workflow("Order", 1, order_workflow)
                .and_then(|b| b.workflow("Leaky", 1, leaky_workflow))
                .and_then(|b| b.workflow("FireAndForget", 1, fire_and_forget))
                .and_then(|b| b.workflow("Panics", 1, panics))
                .expect("registry")
                .build();
            let store = Arc::new(InMemoryHistoryStore::new());
            let engine = ReplayEngine::new(Arc::new(registry), store.clone());
            let mut fixture = Self {
                store,
                engine,
                instance_id: WorkflowInstanceId::new(),
                last: None,
            };
            fixture
                .append(EventKind::WorkflowStarted {
                    workflow_type: WorkflowType::new(name, 1),
                    input: json!({"item": "X"}),
                    execution_timeout: None,
                })
                .await;
            fixture
        }

        async fn append(&mut self, kind: EventKind) {
            let sequence = self
                .store
                .append(self.instance_id, self.last, NewEvent::new(kind, Utc::now()))
                .await
                .unwrap();
            self.last = Some(sequence);
        }

        async fn commit(&mut self, commands: Vec<Command>) {
            for command in commands {
                self.append(command.into_event(Utc::now())).await;
            }
        }
    }

    fn charge_completed() -> EventKind {
        EventKind::ActivityCompleted {
            activity_id: 0,
            result: json!("charged"),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn first_pass_schedules_and_suspends() {
        let fixture = Fixture::start("Order").await;
        let advancement = fixture.engine.advance(fixture.instance_id).await.unwrap();

        assert_eq!(advancement.observed_last, 0);
        assert!(matches!(
            advancement.commands.as_slice(),
            [Command::ScheduleActivity { activity_type, input, .. }]
                if activity_type == "Charge" && *input == json!({"item": "X"})
        ));
    }

    #[tokio::test]
    async fn replay_after_outcome_completes() {
        let mut fixture = Fixture::start("Order").await;
        let first = fixture.engine.advance(fixture.instance_id).await.unwrap();
        fixture.commit(first.commands).await;
        fixture.append(charge_completed()).await;

        let second = fixture.engine.advance(fixture.instance_id).await.unwrap();
        assert_eq!(
            second.commands,
            vec![Command::CompleteWorkflow { result: json!("ok") }]
        );
    }

    #[tokio::test]
    async fn full_replay_reproduces_terminal_state() {
        let mut fixture = Fixture::start("Order").await;
        let first = fixture.engine.advance(fixture.instance_id).await.unwrap();
        fixture.commit(first.commands).await;
        fixture.append(charge_completed()).await;
        let second = fixture.engine.advance(fixture.instance_id).await.unwrap();
        fixture.commit(second.commands.clone()).await;

        let history = fixture.store.read_all(fixture.instance_id).await.unwrap();
        let state = InstanceState::from_events(fixture.instance_id, history[..3].to_vec()).unwrap();
        let definition = order_workflow;
        assert_eq!(replay(&state, &definition).unwrap(), second.commands);

        let finished = fixture.engine.advance(fixture.instance_id).await.unwrap();
        assert_eq!(finished.state.status, WorkflowStatus::Completed);
        assert_eq!(finished.state.result, Some(json!("ok")));
        assert!(finished.commands.is_empty());
    }

    #[tokio::test]
    async fn network_use_is_a_violation() {
        let fixture = Fixture::start("Leaky").await;
        let err = fixture.engine.advance(fixture.instance_id).await.unwrap_err();
        assert!(matches!(
            err,
            ReplayError::Determinism(ref violations) if matches!(
                violations.as_slice(),
                [DeterminismViolation::RestrictedCapability { capability: Capability::Network, .. }]
            )
        ));
        assert!(!sandbox::is_restricted());
    }

    #[tokio::test]
    async fn terminal_waits_for_outstanding_activities() {
        let mut fixture = Fixture::start("FireAndForget").await;
        let first = fixture.engine.advance(fixture.instance_id).await.unwrap();
        assert_eq!(first.commands.len(), 1);
        fixture.commit(first.commands).await;

        let held = fixture.engine.advance(fixture.instance_id).await.unwrap();
        assert!(held.commands.is_empty());

        fixture.append(charge_completed()).await;
        let released = fixture.engine.advance(fixture.instance_id).await.unwrap();
        assert_eq!(
            released.commands,
            vec![Command::CompleteWorkflow { result: json!("early") }]
        );
    }

    #[tokio::test]
    async fn skipped_recorded_step_is_a_violation() {
        let fixture = Fixture::start("Order").await;
        let mut recorded = fixture.store.read_all(fixture.instance_id).await.unwrap();
        recorded.push(crate::history::HistoryEvent {
            sequence: 1,
            timestamp: Utc::now(),
            kind: EventKind::ActivityScheduled {
                activity_id: 0,
                activity_type: "Charge".to_string(),
                input: json!({"item": "X"}),
                retry_policy: RetryPolicy::default(),
                start_to_close_timeout: None,
            },
        });
        let state = InstanceState::from_events(fixture.instance_id, recorded).unwrap();

        let err = replay(&state, &short).unwrap_err();
        assert_eq!(
            err,
            ReplayError::Determinism(vec![DeterminismViolation::UnreplayedHistory {
                step: "activity 0".to_string(),
            }])
        );
    }

    #[tokio::test]
    async fn unknown_workflow_type() {
        let fixture = Fixture::start("Missing").await;
        let err = fixture.engine.advance(fixture.instance_id).await.unwrap_err();
        assert!(matches!(err, ReplayError::UnknownWorkflow { .. }));
    }

    #[tokio::test]
    async fn panicking_workflow_is_reported() {
        let fixture = Fixture::start("Panics").await;
        let err = fixture.engine.advance(fixture.instance_id).await.unwrap_err();
        assert!(matches!(err, ReplayError::Panicked { ref message, .. } if message == "boom"));
        assert!(!sandbox::is_restricted());
    }

    #[tokio::test]
    async fn missing_instance() {
        let fixture = Fixture::start("Order").await;
        let other = WorkflowInstanceId::new();
        let err = fixture.engine.advance(other).await.unwrap_err();
        assert_eq!(err, ReplayError::NotFound { instance_id: other });
    }
}
