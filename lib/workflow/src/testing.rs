//! Shared fixtures for the engine's tests.

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::client::WorkflowClient;
use crate::clock::{Clock, ManualClock};
use crate::context::{ActivityOptions, WorkflowContext};
use crate::definition::{Registry, WorkflowResult};
use crate::dispatcher::{CycleOutcome, Dispatcher, DispatcherConfig};
use crate::history::{
    EventKind, HistoryError, HistoryEvent, HistoryStore, InMemoryHistoryStore, NewEvent,
};
use crate::queue::InMemoryTaskQueue;
use crate::retry::RetryPolicy;
use crate::sandbox::{self, Capability};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use keel_core::WorkflowInstanceId;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Returns its input.
pub struct Echo;

impl Echo {
    pub const NAME: &'static str = "Echo";
}

#[async_trait]
impl Activity for Echo {
    async fn run(&self, _ctx: ActivityContext, input: JsonValue) -> Result<JsonValue, ActivityError> {
        Ok(input)
    }
}

/// Never finishes inside any reasonable deadline.
pub struct Sleepy;

impl Sleepy {
    pub const NAME: &'static str = "Sleepy";
}

#[async_trait]
impl Activity for Sleepy {
    async fn run(&self, _ctx: ActivityContext, _input: JsonValue) -> Result<JsonValue, ActivityError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(JsonValue::Null)
    }
}

/// Fails every attempt with a retryable error.
pub struct AlwaysFails;

impl AlwaysFails {
    pub const NAME: &'static str = "AlwaysFails";
}

#[async_trait]
impl Activity for AlwaysFails {
    async fn run(&self, _ctx: ActivityContext, _input: JsonValue) -> Result<JsonValue, ActivityError> {
        Err(ActivityError::retryable("unavailable", "upstream down"))
    }
}

/// A charge that fails a fixed number of times before succeeding.
#[derive(Clone)]
pub struct FlakyActivity {
    failures_before_success: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyActivity {
    pub const NAME: &'static str = "Charge";

    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Activity for FlakyActivity {
    async fn run(&self, _ctx: ActivityContext, _input: JsonValue) -> Result<JsonValue, ActivityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            Err(ActivityError::retryable("unavailable", "payment gateway busy"))
        } else {
            Ok(json!("charged"))
        }
    }
}

/// Charges for the input, then reports "ok" unless cancelled meanwhile.
pub fn order_workflow(ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
    if let Err(failure) = ctx.call_activity(FlakyActivity::NAME, input.clone())? {
        return ctx.fail_activity(&failure);
    }
    if ctx.is_cancel_requested() {
        return ctx.cancelled();
    }
    Ok(json!("ok"))
}

/// Runs the activity named in the input and returns its result.
pub fn run_activity_workflow(ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
    let activity = input["activity"].as_str().unwrap_or_default();
    let mut options = ActivityOptions::default();
    if let Some(max_attempts) = input["max_attempts"].as_u64() {
        options = options.with_retry_policy(RetryPolicy::new(max_attempts as u32));
    }
    if let Some(timeout_ms) = input["timeout_ms"].as_u64() {
        options = options.with_start_to_close_timeout(Duration::from_millis(timeout_ms));
    }

    match ctx.call_activity_with(activity, input["input"].clone(), options)? {
        Ok(result) => Ok(result),
        Err(failure) => ctx.fail_activity(&failure),
    }
}

/// Sleeps for `secs` of durable time.
pub fn sleeper_workflow(ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
    let secs = input["secs"].as_u64().unwrap_or(1);
    ctx.sleep(Duration::from_secs(secs))?;
    Ok(json!("rested"))
}

/// Collects `count` "item" signals in delivery order.
pub fn collect_workflow(ctx: &mut WorkflowContext<'_>, input: &JsonValue) -> WorkflowResult {
    let count = input["count"].as_u64().unwrap_or(1);
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(ctx.wait_signal("item")?);
    }
    Ok(JsonValue::Array(items))
}

/// Reaches for the network from workflow code.
pub fn leaky_workflow(ctx: &mut WorkflowContext<'_>, _input: &JsonValue) -> WorkflowResult {
    // Swallowed here; the scope still records it.
    let _ = sandbox::ensure_allowed(Capability::Network);
    ctx.call_activity(Echo::NAME, json!("after network"))?;
    Ok(json!("done"))
}

/// Registry with every fixture and a Charge that always succeeds.
pub fn test_registry() -> Registry {
    registry_with(FlakyActivity::new(0))
}

/// Registry with every fixture, using `charge` as the Charge activity.
pub fn registry_with(charge: FlakyActivity) -> Registry {
    Registry::builder()
        .workflow("Order", 1, order_workflow)
        .and_then(|b| b.workflow("RunActivity", 1, run_activity_workflow))
        .and_then(|b| b.workflow("Sleeper", 1, sleeper_workflow))
        .and_then(|b| b.workflow("Collect", 1, collect_workflow))
        .and_then(|b| b.workflow("Leaky", 1, leaky_workflow))
        .and_then(|b| b.activity(Echo::NAME, Echo))
        .and_then(|b| b.activity(Sleepy::NAME, Sleepy))
        .and_then(|b| b.activity(AlwaysFails::NAME, AlwaysFails))
        .and_then(|b| b.activity(FlakyActivity::NAME, charge))
        .expect("fixture registry")
        .build()
}

/// History store that can simulate outages and racing writers.
#[derive(Debug, Default)]
pub struct TestHistoryStore {
    pub inner: InMemoryHistoryStore,
    failing_reads: AtomicU32,
    contend: AtomicBool,
}

impl TestHistoryStore {
    /// Makes the next `count` reads fail as unavailable.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Makes another writer win the next append by slipping a signal in first.
    pub fn contend_next_append(&self) {
        self.contend.store(true, Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HistoryStore for TestHistoryStore {
    async fn append(
        &self,
        instance_id: WorkflowInstanceId,
        expected_last: Option<u64>,
        event: NewEvent,
    ) -> Result<u64, HistoryError> {
        if self.contend.swap(false, Ordering::SeqCst) {
            let rival = NewEvent::new(
                EventKind::SignalReceived {
                    name: "rival".to_string(),
                    payload: JsonValue::Null,
                },
                event.timestamp,
            );
            self.inner.append(instance_id, expected_last, rival).await?;
        }
        self.inner.append(instance_id, expected_last, event).await
    }

    fn read(
        &self,
        instance_id: WorkflowInstanceId,
        from: u64,
    ) -> BoxStream<'_, Result<HistoryEvent, HistoryError>> {
        if self.take_read_failure() {
            return stream::once(async {
                Err(HistoryError::Unavailable {
                    message: "injected outage".to_string(),
                })
            })
            .boxed();
        }
        self.inner.read(instance_id, from)
    }

    async fn last_sequence(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Option<u64>, HistoryError> {
        self.inner.last_sequence(instance_id).await
    }

    async fn purge(&self, instance_id: WorkflowInstanceId) -> Result<(), HistoryError> {
        self.inner.purge(instance_id).await
    }
}

/// A full engine on in-memory backends and a manual clock.
pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<TestHistoryStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub client: WorkflowClient,
}

impl Harness {
    pub fn new(registry: Registry) -> Self {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(TestHistoryStore::default());
        let queue = Arc::new(InMemoryTaskQueue::new(Arc::new(clock.clone())));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            store.clone(),
            queue.clone(),
            Arc::new(clock.clone()),
            DispatcherConfig::default(),
        ));
        let client = WorkflowClient::new(dispatcher.clone());
        Self {
            clock,
            store,
            queue,
            dispatcher,
            client,
        }
    }

    /// Starts version 1 of `name`.
    pub async fn start(&self, name: &str, input: JsonValue) -> WorkflowInstanceId {
        self.client
            .start_workflow(name, 1, input)
            .await
            .expect("workflow started")
    }

    /// Reads history directly, bypassing injected faults.
    pub async fn history(&self, instance_id: WorkflowInstanceId) -> Vec<HistoryEvent> {
        self.store
            .inner
            .read_all(instance_id)
            .await
            .expect("history readable")
    }

    /// Drains every queue, moving the clock forward to each next visible
    /// task until nothing is due within `span`.
    pub async fn run_for(&self, span: Duration) -> Vec<CycleOutcome> {
        let horizon = self.clock.now() + crate::clock::to_chrono(span);
        let mut outcomes = Vec::new();

        for _ in 0..10_000 {
            let mut progressed = false;
            for outcome in [
                self.dispatcher.poll_workflow_task().await,
                self.dispatcher.poll_activity_task().await,
                self.dispatcher.poll_timer_task().await,
            ] {
                let outcome = outcome.expect("dispatch cycle");
                if outcome != CycleOutcome::Idle {
                    progressed = true;
                    outcomes.push(outcome);
                }
            }
            if progressed {
                continue;
            }

            match self.queue.next_visible_at().await {
                Some(next) if next <= horizon => self.clock.set(next),
                _ => return outcomes,
            }
        }
        panic!("engine did not settle: {outcomes:?}");
    }

    /// Drains every queue within an hour of simulated time.
    pub async fn run_until_idle(&self) -> Vec<CycleOutcome> {
        self.run_for(Duration::from_secs(60 * 60)).await
    }
}
