//! Submission interface for starting, signalling, cancelling and inspecting
//! workflow instances.

use crate::definition::WorkflowType;
use crate::dispatcher::{AppendDecision, Dispatcher};
use crate::error::ClientError;
use crate::history::EventKind;
use crate::instance::{InstanceState, WorkflowStatus};
use crate::queue::WakeReason;
use keel_core::WorkflowInstanceId;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Options for starting an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Overrides the dispatcher's default execution timeout.
    pub execution_timeout: Option<Duration>,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub instance_id: WorkflowInstanceId,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl From<&InstanceState> for WorkflowStatusReport {
    fn from(state: &InstanceState) -> Self {
        Self {
            instance_id: state.instance_id,
            workflow_type: state.workflow_type.clone(),
            status: state.status,
            result: state.result.clone(),
            error: state.error.clone(),
        }
    }
}

/// Client for the workflow engine.
#[derive(Clone)]
pub struct WorkflowClient {
    dispatcher: Arc<Dispatcher>,
}

impl WorkflowClient {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Starts a new instance of `name` at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow type is not registered or the engine
    /// cannot persist the start.
    pub async fn start_workflow(
        &self,
        name: &str,
        version: u32,
        input: JsonValue,
    ) -> Result<WorkflowInstanceId, Report<ClientError>> {
        self.start_workflow_with(WorkflowType::new(name, version), input, StartOptions::default())
            .await
    }

    /// Starts a new instance with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow type is not registered or the engine
    /// cannot persist the start.
    #[instrument(skip(self, input, options), fields(workflow_type = %workflow_type))]
    pub async fn start_workflow_with(
        &self,
        workflow_type: WorkflowType,
        input: JsonValue,
        options: StartOptions,
    ) -> Result<WorkflowInstanceId, Report<ClientError>> {
        if !self.dispatcher.registry().has_workflow(&workflow_type) {
            return Err(ClientError::UnknownWorkflowType { workflow_type }.into());
        }

        let timeout = options
            .execution_timeout
            .or(self.dispatcher.config().default_execution_timeout);
        let instance_id = self
            .dispatcher
            .start_instance(workflow_type, input, timeout)
            .await
            .map_err(ClientError::from)?;
        Ok(instance_id)
    }

    /// Delivers a named signal to a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist or has finished.
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        instance_id: WorkflowInstanceId,
        name: &str,
        payload: JsonValue,
    ) -> Result<(), Report<ClientError>> {
        self.ensure_running(instance_id).await?;

        let signal = EventKind::SignalReceived {
            name: name.to_string(),
            payload,
        };
        let appended = self
            .dispatcher
            .deliver(instance_id, WakeReason::SignalReceived, |state| {
                if state.is_terminal() {
                    AppendDecision::Skip
                } else {
                    AppendDecision::Append(signal.clone())
                }
            })
            .await
            .map_err(ClientError::from)?;

        if appended.is_none() {
            // Finished between the check and the append.
            return Err(self.terminal_error(instance_id).await);
        }
        info!(%instance_id, signal = name, "signal delivered");
        Ok(())
    }

    /// Requests cancellation of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist or already reached a
    /// terminal status other than cancelled.
    pub async fn cancel_workflow(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<(), Report<ClientError>> {
        self.request_cancel(instance_id, None).await
    }

    /// Requests cancellation of an instance, recording a reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist or already reached a
    /// terminal status other than cancelled.
    pub async fn cancel_workflow_with_reason(
        &self,
        instance_id: WorkflowInstanceId,
        reason: impl Into<String>,
    ) -> Result<(), Report<ClientError>> {
        self.request_cancel(instance_id, Some(reason.into())).await
    }

    /// Returns the current status of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist.
    pub async fn workflow_status(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<WorkflowStatusReport, Report<ClientError>> {
        let state = self
            .dispatcher
            .load_state(instance_id)
            .await
            .map_err(ClientError::from)?;
        Ok(WorkflowStatusReport::from(&state))
    }

    #[instrument(skip(self))]
    async fn request_cancel(
        &self,
        instance_id: WorkflowInstanceId,
        reason: Option<String>,
    ) -> Result<(), Report<ClientError>> {
        let request = EventKind::CancelRequested { reason };
        self.dispatcher
            .deliver(instance_id, WakeReason::CancelRequested, |state| {
                if state.is_terminal() || state.cancel_requested {
                    AppendDecision::Skip
                } else {
                    AppendDecision::Append(request.clone())
                }
            })
            .await
            .map_err(ClientError::from)?;

        let state = self
            .dispatcher
            .load_state(instance_id)
            .await
            .map_err(ClientError::from)?;
        match state.status {
            WorkflowStatus::Running | WorkflowStatus::Cancelled => {
                info!(%instance_id, "cancellation requested");
                Ok(())
            }
            status => Err(ClientError::InstanceTerminal {
                instance_id,
                status,
            }
            .into()),
        }
    }

    async fn ensure_running(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<(), Report<ClientError>> {
        let state = self
            .dispatcher
            .load_state(instance_id)
            .await
            .map_err(ClientError::from)?;
        if state.is_terminal() {
            return Err(ClientError::InstanceTerminal {
                instance_id,
                status: state.status,
            }
            .into());
        }
        Ok(())
    }

    async fn terminal_error(&self, instance_id: WorkflowInstanceId) -> Report<ClientError> {
        match self.dispatcher.load_state(instance_id).await {
            Ok(state) => ClientError::InstanceTerminal {
                instance_id,
                status: state.status,
            }
            .into(),
            Err(err) => ClientError::from(err).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityFailure;
    use crate::dispatcher::CycleOutcome;
    use crate::testing::{Echo, FlakyActivity, Harness, registry_with, test_registry};
    use serde_json::json;

    #[tokio::test]
    async fn order_retries_charge_and_completes() {
        let charge = FlakyActivity::new(2);
        let harness = Harness::new(registry_with(charge.clone()));
        let id = harness
            .client
            .start_workflow("Order", 1, json!({"item": "X"}))
            .await
            .unwrap();
        let outcomes = harness.run_until_idle().await;

        let report = harness.client.workflow_status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.result, Some(json!("ok")));
        assert_eq!(charge.calls(), 3);

        let retries = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::RetryScheduled { .. }))
            .count();
        assert_eq!(retries, 2);

        let history = harness.history(id).await;
        let kinds: Vec<_> = history.iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "activity_scheduled",
                "activity_completed",
                "workflow_completed"
            ]
        );
        assert!(matches!(
            history[2].kind,
            EventKind::ActivityCompleted { attempt: 3, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_workflow_type_is_rejected() {
        let harness = Harness::new(test_registry());
        let err = harness
            .client
            .start_workflow("Nope", 1, JsonValue::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown workflow type: Nope@v1"));
    }

    #[tokio::test]
    async fn cancel_in_flight_waits_for_activity() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow("Order", 1, json!({"item": "X"}))
            .await
            .unwrap();
        harness.dispatcher.poll_workflow_task().await.unwrap();

        harness.client.cancel_workflow(id).await.unwrap();
        // Requesting again is a no-op.
        harness
            .client
            .cancel_workflow_with_reason(id, "changed mind")
            .await
            .unwrap();

        // Charge is still unresolved, so the pass after the request holds.
        let held = harness.dispatcher.poll_workflow_task().await.unwrap();
        assert_eq!(
            held,
            CycleOutcome::Advanced {
                instance_id: id,
                committed: 0
            }
        );
        assert_eq!(
            harness.client.workflow_status(id).await.unwrap().status,
            WorkflowStatus::Running
        );

        harness.run_until_idle().await;
        let report = harness.client.workflow_status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Cancelled);

        let history = harness.history(id).await;
        let requests = history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::CancelRequested { .. }))
            .count();
        assert_eq!(requests, 1);
        assert!(history.iter().any(|e| matches!(e.kind, EventKind::ActivityCompleted { .. })));

        harness.client.cancel_workflow(id).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_after_completion_is_rejected() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow("Order", 1, json!({"item": "X"}))
            .await
            .unwrap();
        harness.run_until_idle().await;

        let err = harness.client.cancel_workflow(id).await.unwrap_err();
        assert!(err.to_string().contains("already completed"));
        let err = harness
            .client
            .signal_workflow(id, "late", JsonValue::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already completed"));
    }

    #[tokio::test]
    async fn signals_are_observed_in_delivery_order() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow("Collect", 1, json!({"count": 2}))
            .await
            .unwrap();
        harness.run_until_idle().await;

        harness.client.signal_workflow(id, "item", json!("a")).await.unwrap();
        harness.client.signal_workflow(id, "item", json!("b")).await.unwrap();
        harness.run_until_idle().await;

        let report = harness.client.workflow_status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.result, Some(json!(["a", "b"])));
    }

    #[tokio::test]
    async fn execution_timeout_ends_instance() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow_with(
                WorkflowType::new("Collect", 1),
                json!({"count": 1}),
                StartOptions {
                    execution_timeout: Some(Duration::from_secs(60)),
                },
            )
            .await
            .unwrap();
        harness.run_until_idle().await;

        let report = harness.client.workflow_status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::TimedOut);

        let err = harness
            .client
            .signal_workflow(id, "item", json!("late"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already timed out"));
    }

    #[tokio::test]
    async fn failing_activity_fails_workflow() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow("RunActivity", 1, json!({"activity": "Missing", "input": null}))
            .await
            .unwrap();
        harness.run_until_idle().await;

        let report = harness.client.workflow_status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        let expected = ActivityFailure::new(
            crate::activity::UNKNOWN_ACTIVITY,
            "no activity registered as Missing",
        );
        assert_eq!(report.error, Some(expected.to_string()));
    }

    #[tokio::test]
    async fn purge_removes_history_after_retention() {
        let harness = Harness::new(test_registry());
        let id = harness
            .client
            .start_workflow("RunActivity", 1, json!({"activity": Echo::NAME, "input": 1}))
            .await
            .unwrap();
        harness.run_until_idle().await;
        assert_eq!(
            harness.client.workflow_status(id).await.unwrap().status,
            WorkflowStatus::Completed
        );

        let retention = harness.dispatcher.config().retention;
        let outcomes = harness.run_for(retention + Duration::from_secs(1)).await;
        assert!(outcomes.contains(&CycleOutcome::Purged { instance_id: id }));

        let err = harness.client.workflow_status(id).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn missing_instance_status() {
        let harness = Harness::new(test_registry());
        let err = harness
            .client
            .workflow_status(WorkflowInstanceId::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workflow instance not found"));
    }
}
