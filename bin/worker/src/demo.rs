//! The workflows and activities this worker registers.

use async_trait::async_trait;
use keel_internal_api::{ApiOutcome, InternalApiClient};
use keel_workflow::{
    Activity, ActivityContext, ActivityError, ActivityOptions, Registry, RegistryError,
    RetryPolicy, WorkflowContext, WorkflowResult,
};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::info;

pub const ORDER_WORKFLOW: &str = "Order";
pub const CHARGE_ACTIVITY: &str = "Charge";

/// Charges for an order, then reports "ok".
pub fn order_workflow(ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
    let options = ActivityOptions::default()
        .with_retry_policy(RetryPolicy::new(5).with_non_retryable_kind("rejected"))
        .with_start_to_close_timeout(Duration::from_secs(30));
    if let Err(failure) = ctx.call_activity_with(CHARGE_ACTIVITY, input.clone(), options)? {
        return ctx.fail_activity(&failure);
    }
    if ctx.is_cancel_requested() {
        return ctx.cancelled();
    }
    Ok(json!("ok"))
}

/// Posts the charge to the internal API, or accepts it locally when no API
/// is configured.
pub struct ChargeActivity {
    api: Option<InternalApiClient>,
}

impl ChargeActivity {
    #[must_use]
    pub fn new(api: Option<InternalApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for ChargeActivity {
    async fn run(&self, ctx: ActivityContext, input: JsonValue) -> Result<JsonValue, ActivityError> {
        let Some(api) = &self.api else {
            info!(instance_id = %ctx.instance_id, attempt = ctx.attempt, "charge accepted locally");
            return Ok(json!({"charged": input}));
        };

        let body = json!({
            "idempotency_key": format!("{}:{}", ctx.instance_id, ctx.activity_id),
            "order": input,
        });
        match api.post("/charges", body).await {
            Ok(ApiOutcome::Success { body, .. }) => Ok(body),
            Ok(ApiOutcome::ClientError { status, body }) => Err(ActivityError::non_retryable(
                "rejected",
                format!("charge rejected with {status}: {body}"),
            )),
            Ok(ApiOutcome::ServerError { status, .. }) => Err(ActivityError::retryable(
                "unavailable",
                format!("charge service returned {status}"),
            )),
            Ok(ApiOutcome::Timeout) => Err(ActivityError::retryable(
                "timeout",
                "charge service did not answer in time",
            )),
            Err(report) => Err(ActivityError::retryable("unreachable", report.to_string())),
        }
    }
}

/// Builds the registry for this worker.
///
/// # Errors
///
/// Returns an error if a name is registered twice.
pub fn registry(api: Option<InternalApiClient>) -> Result<Registry, RegistryError> {
    Ok(Registry::builder()
        .workflow(ORDER_WORKFLOW, 1, order_workflow)?
        .activity(CHARGE_ACTIVITY, ChargeActivity::new(api))?
        .build())
}
