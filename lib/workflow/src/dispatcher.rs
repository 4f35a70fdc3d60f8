//! Claims tasks, routes them, and commits what they produce.
//!
//! The dispatcher is the only writer of history. Every write is an
//! optimistic append, and follow-up tasks are enqueued only for events this
//! dispatcher actually committed, so racing workers never double-schedule.
//!
//! Each `poll_*` call handles at most one task:
//! 1. Claim a task with a visibility timeout
//! 2. Re-derive state from history
//! 3. Run the replay engine or the activity executor
//! 4. Append the resulting events
//! 5. Enqueue follow-ups, then acknowledge
//!
//! A crash anywhere before step 5 leaves the task unacknowledged; it is
//! redelivered after the visibility timeout and the next claimant heals any
//! follow-ups that were lost.

use crate::activity::{
    ATTEMPTS_EXHAUSTED, ActivityExecutor, ActivityFailure, ActivityOutcome, Resolution,
};
use crate::clock::{self, Clock};
use crate::definition::{Registry, WorkflowType};
use crate::error::{DispatchError, ReplayError};
use crate::history::{EventKind, HistoryError, HistoryStore, NewEvent};
use crate::instance::InstanceState;
use crate::queue::{
    ACTIVITY_QUEUE, ActivityTask, TIMER_QUEUE, Task, TaskKind, TaskQueue, TimerPurpose, TimerTask,
    WORKFLOW_QUEUE, WakeReason, WorkflowTask,
};
use crate::replay::{Advancement, ReplayEngine};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use keel_core::{TaskId, WorkflowInstanceId};
use serde_json::Value as JsonValue;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Floor for the claim heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Tuning for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// How long a claimed task stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// How long terminal instances are kept before purging.
    pub retention: Duration,
    /// Per-attempt deadline for activities that do not set one.
    pub default_activity_timeout: Duration,
    /// Execution timeout for instances started without one.
    pub default_execution_timeout: Option<Duration>,
    /// Backoff for tasks deferred because a store or queue was unavailable.
    pub infrastructure_retry: RetryPolicy,
    /// Optimistic append attempts before giving up on a contended instance.
    pub max_append_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            default_activity_timeout: Duration::from_secs(60),
            default_execution_timeout: None,
            infrastructure_retry: RetryPolicy::new(u32::MAX)
                .with_initial_backoff(Duration::from_millis(500))
                .with_max_backoff(Duration::from_secs(30)),
            max_append_attempts: 8,
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No task was claimable.
    Idle,
    /// A replay pass committed `committed` events.
    Advanced {
        instance_id: WorkflowInstanceId,
        committed: usize,
    },
    /// Another writer appended first; nothing was committed.
    Conflict { instance_id: WorkflowInstanceId },
    /// An activity or timer outcome was recorded.
    Recorded {
        instance_id: WorkflowInstanceId,
        event: &'static str,
    },
    /// An activity attempt failed and will be redelivered.
    RetryScheduled {
        instance_id: WorkflowInstanceId,
        activity_id: u32,
        delay: Duration,
    },
    /// The task was stale or a duplicate and was dropped.
    Skipped { instance_id: WorkflowInstanceId },
    /// The task was returned to its queue.
    Deferred {
        instance_id: WorkflowInstanceId,
        delay: Duration,
    },
    /// The task was quarantined.
    DeadLettered {
        instance_id: WorkflowInstanceId,
        reason: String,
    },
    /// A terminal instance's history was deleted.
    Purged { instance_id: WorkflowInstanceId },
}

/// Which queue a worker loop serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Workflow,
    Activity,
    Timer,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Workflow => WORKFLOW_QUEUE,
            Self::Activity => ACTIVITY_QUEUE,
            Self::Timer => TIMER_QUEUE,
        };
        f.write_str(name)
    }
}

/// Decision made against freshly read state before an append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendDecision {
    Append(EventKind),
    Skip,
}

/// Routes tasks between the queues, the replay engine and the executor.
pub struct Dispatcher {
    registry: Arc<Registry>,
    history: Arc<dyn HistoryStore>,
    queue: Arc<dyn TaskQueue>,
    engine: ReplayEngine,
    executor: ActivityExecutor,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        history: Arc<dyn HistoryStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        let engine = ReplayEngine::new(registry.clone(), history.clone());
        let executor = ActivityExecutor::new(registry.clone(), config.default_activity_timeout);
        Self {
            registry,
            history,
            queue,
            engine,
            executor,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Creates an instance: appends `WorkflowStarted` and enqueues its first
    /// workflow task, plus the execution timeout watchdog if one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or queue is unavailable.
    #[instrument(skip(self, input), fields(workflow_type = %workflow_type))]
    pub async fn start_instance(
        &self,
        workflow_type: WorkflowType,
        input: JsonValue,
        execution_timeout: Option<Duration>,
    ) -> Result<WorkflowInstanceId, DispatchError> {
        let instance_id = WorkflowInstanceId::new();
        let now = self.clock.now();
        let started = EventKind::WorkflowStarted {
            workflow_type,
            input,
            execution_timeout,
        };
        self.history
            .append(instance_id, None, NewEvent::new(started, now))
            .await?;

        self.queue
            .enqueue(workflow_task(instance_id, WakeReason::Started))
            .await?;
        if let Some(timeout) = execution_timeout {
            self.queue
                .enqueue(watchdog_task(instance_id, now + clock::to_chrono(timeout)))
                .await?;
        }

        info!(%instance_id, "workflow instance started");
        Ok(instance_id)
    }

    /// Appends an externally delivered event, such as a signal or a cancel
    /// request, and wakes the instance.
    ///
    /// Returns `None` if `decide` skipped the append.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance does not exist or the store is unavailable.
    pub async fn deliver<F>(
        &self,
        instance_id: WorkflowInstanceId,
        reason: WakeReason,
        decide: F,
    ) -> Result<Option<u64>, DispatchError>
    where
        F: Fn(&InstanceState) -> AppendDecision + Send,
    {
        let appended = self.append_with_retry(instance_id, decide).await?;
        if appended.is_some() {
            self.queue
                .enqueue(workflow_task(instance_id, reason))
                .await?;
        }
        Ok(appended)
    }

    /// Reads and folds the full history of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InstanceNotFound`] for an empty history.
    pub async fn load_state(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<InstanceState, DispatchError> {
        let events = self.history.read_all(instance_id).await?;
        if events.is_empty() {
            return Err(DispatchError::InstanceNotFound { instance_id });
        }
        Ok(InstanceState::from_events(instance_id, events)?)
    }

    /// Appends the event `decide` picks, re-reading history after each conflict.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ContentionExhausted`] if every attempt conflicted.
    pub async fn append_with_retry<F>(
        &self,
        instance_id: WorkflowInstanceId,
        decide: F,
    ) -> Result<Option<u64>, DispatchError>
    where
        F: Fn(&InstanceState) -> AppendDecision + Send,
    {
        for attempt in 1..=self.config.max_append_attempts {
            let state = self.load_state(instance_id).await?;
            let kind = match decide(&state) {
                AppendDecision::Skip => return Ok(None),
                AppendDecision::Append(kind) => kind,
            };

            let event = NewEvent::new(kind, self.clock.now());
            match self
                .history
                .append(instance_id, Some(state.last_sequence), event)
                .await
            {
                Ok(sequence) => return Ok(Some(sequence)),
                Err(HistoryError::Conflict { .. }) => {
                    debug!(%instance_id, attempt, "append conflicted, re-reading history");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(DispatchError::ContentionExhausted { instance_id })
    }

    /// Claims and handles one workflow task.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails; task-level failures
    /// are handled by deferring or dead-lettering the task.
    #[instrument(skip(self))]
    pub async fn poll_workflow_task(&self) -> Result<CycleOutcome, DispatchError> {
        let Some(task) = self
            .queue
            .claim(WORKFLOW_QUEUE, self.config.visibility_timeout)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };
        if !matches!(task.kind, TaskKind::Workflow(_)) {
            return self
                .dead_letter(&task, "unexpected task on workflow queue".to_string())
                .await;
        }

        match self.engine.advance(task.instance_id()).await {
            Ok(advancement) => self.commit(&task, advancement).await,
            Err(ReplayError::NotFound { .. }) => self.skip(&task).await,
            Err(err) if err.is_transient() => self.defer(&task, &err).await,
            Err(err) => self.dead_letter(&task, err.to_string()).await,
        }
    }

    /// Claims and runs one activity attempt.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails.
    #[instrument(skip(self))]
    pub async fn poll_activity_task(&self) -> Result<CycleOutcome, DispatchError> {
        let Some(task) = self
            .queue
            .claim(ACTIVITY_QUEUE, self.config.visibility_timeout)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };
        let TaskKind::Activity(activity) = &task.kind else {
            return self
                .dead_letter(&task, "unexpected task on activity queue".to_string())
                .await;
        };
        let instance_id = activity.workflow_instance_id;
        let activity_id = activity.activity_id;

        let state = match self.load_state(instance_id).await {
            Ok(state) => state,
            Err(err) => return self.handle_failure(&task, err).await,
        };
        if state.is_terminal()
            || state.activity(activity_id).is_none()
            || state.is_activity_resolved(activity_id)
        {
            debug!(%instance_id, activity_id, "activity already resolved or instance ended");
            return self.skip(&task).await;
        }

        let attempt = activity.attempt_count;
        let max_attempts = activity.retry_policy.max_attempts;
        let kind = if attempt > max_attempts {
            warn!(%instance_id, activity_id, attempt, max_attempts, "activity delivered past its attempt limit");
            EventKind::ActivityFailed {
                activity_id,
                failure: ActivityFailure::new(
                    ATTEMPTS_EXHAUSTED,
                    format!("delivered {attempt} times, limit is {max_attempts}"),
                ),
                attempt,
            }
        } else {
            let outcome = self.execute_holding_claim(task.id, activity).await;
            match ActivityExecutor::resolve(activity, outcome) {
                Resolution::Complete(result) => EventKind::ActivityCompleted {
                    activity_id,
                    result,
                    attempt,
                },
                Resolution::Fail(failure) => {
                    info!(%instance_id, activity_id, attempt, %failure, "activity failed");
                    EventKind::ActivityFailed {
                        activity_id,
                        failure,
                        attempt,
                    }
                }
                Resolution::Retry { delay, failure } => {
                    info!(%instance_id, activity_id, attempt, ?delay, %failure, "activity attempt failed, retrying");
                    self.queue.nack(task.id, delay).await?;
                    return Ok(CycleOutcome::RetryScheduled {
                        instance_id,
                        activity_id,
                        delay,
                    });
                }
            }
        };

        self.record(&task, instance_id, kind, WakeReason::ActivityResolved)
            .await
    }

    /// Claims and handles one timer or purge task.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails.
    #[instrument(skip(self))]
    pub async fn poll_timer_task(&self) -> Result<CycleOutcome, DispatchError> {
        let Some(task) = self
            .queue
            .claim(TIMER_QUEUE, self.config.visibility_timeout)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        match &task.kind {
            TaskKind::Timer(timer) => {
                let now = self.clock.now();
                if timer.fire_at > now {
                    return self.requeue_until(&task, now, timer.fire_at).await;
                }
                let (kind, reason) = match timer.purpose {
                    TimerPurpose::Sleep { timer_id } => {
                        (EventKind::TimerFired { timer_id }, WakeReason::TimerFired)
                    }
                    TimerPurpose::ExecutionTimeout => {
                        (EventKind::WorkflowTimedOut, WakeReason::TimedOut)
                    }
                };
                self.record(&task, timer.instance_id, kind, reason).await
            }
            TaskKind::Purge { instance_id } => self.purge(&task, *instance_id).await,
            _ => {
                self.dead_letter(&task, "unexpected task on timer queue".to_string())
                    .await
            }
        }
    }

    /// Runs a worker loop for `role` until `shutdown` turns true or its sender is dropped.
    pub async fn run(self: Arc<Self>, role: WorkerRole, mut shutdown: watch::Receiver<bool>) {
        info!(%role, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let cycle = match role {
                WorkerRole::Workflow => self.poll_workflow_task().await,
                WorkerRole::Activity => self.poll_activity_task().await,
                WorkerRole::Timer => self.poll_timer_task().await,
            };
            let idle = match cycle {
                Ok(CycleOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(%role, ?outcome, "cycle finished");
                    false
                }
                Err(err) => {
                    warn!(%role, error = %err, "dispatch cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(%role, "worker stopped");
    }

    pub async fn run_workflow_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.run(WorkerRole::Workflow, shutdown).await;
    }

    pub async fn run_activity_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.run(WorkerRole::Activity, shutdown).await;
    }

    pub async fn run_timer_worker(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.run(WorkerRole::Timer, shutdown).await;
    }

    /// Runs one attempt, extending the claim every third of the visibility
    /// timeout so a long attempt is not redelivered while it still runs.
    async fn execute_holding_claim(
        &self,
        task_id: TaskId,
        activity: &ActivityTask,
    ) -> ActivityOutcome {
        let visibility = self.config.visibility_timeout;
        let period = (visibility / 3).max(MIN_HEARTBEAT);
        let start = tokio::time::Instant::now() + period;
        let mut heartbeat = tokio::time::interval_at(start, period);
        let mut execution = pin!(self.executor.execute(activity));
        loop {
            tokio::select! {
                outcome = &mut execution => return outcome,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.queue.extend(task_id, visibility).await {
                        warn!(%task_id, error = %err, "failed to extend activity claim");
                    }
                }
            }
        }
    }

    async fn commit(
        &self,
        task: &Task,
        advancement: Advancement,
    ) -> Result<CycleOutcome, DispatchError> {
        let Advancement {
            instance_id,
            observed_last,
            state,
            commands,
        } = advancement;

        if task.attempt > 1 {
            self.heal(&state).await?;
        }

        let now = self.clock.now();
        let mut expected = observed_last;
        let mut committed = Vec::with_capacity(commands.len());
        let mut interrupted = None;

        for command in commands {
            let kind = command.into_event(now);
            match self
                .history
                .append(instance_id, Some(expected), NewEvent::new(kind.clone(), now))
                .await
            {
                Ok(sequence) => {
                    expected = sequence;
                    committed.push(kind);
                }
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
        }

        for kind in &committed {
            self.enqueue_follow_up(instance_id, kind, now).await?;
        }

        match interrupted {
            None => {
                self.queue.ack(task.id).await?;
                debug!(%instance_id, committed = committed.len(), "workflow task committed");
                Ok(CycleOutcome::Advanced {
                    instance_id,
                    committed: committed.len(),
                })
            }
            Some(HistoryError::Conflict { .. }) => {
                // The winning writer enqueued its own follow-up.
                self.queue.ack(task.id).await?;
                debug!(%instance_id, committed = committed.len(), "lost append race");
                if committed.is_empty() {
                    Ok(CycleOutcome::Conflict { instance_id })
                } else {
                    Ok(CycleOutcome::Advanced {
                        instance_id,
                        committed: committed.len(),
                    })
                }
            }
            Some(err) if err.is_transient() => self.defer(task, &err).await,
            Some(err) => self.dead_letter(task, err.to_string()).await,
        }
    }

    async fn enqueue_follow_up(
        &self,
        instance_id: WorkflowInstanceId,
        kind: &EventKind,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let task = match kind {
            EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                retry_policy,
                start_to_close_timeout,
            } => Task::new(TaskKind::Activity(ActivityTask {
                activity_id: *activity_id,
                workflow_instance_id: instance_id,
                activity_type: activity_type.clone(),
                input: input.clone(),
                attempt_count: 0,
                retry_policy: retry_policy.clone(),
                start_to_close_timeout: *start_to_close_timeout,
                not_before: None,
            })),
            EventKind::TimerStarted {
                timer_id, fire_at, ..
            } => {
                timer_task(instance_id, *fire_at, TimerPurpose::Sleep { timer_id: *timer_id })
            }
            kind if kind.is_terminal() => self.purge_task(instance_id, now),
            _ => return Ok(()),
        };
        self.queue.enqueue(task).await?;
        Ok(())
    }

    /// Re-enqueues work that history says is outstanding. Runs on redelivered
    /// workflow tasks, where the previous claimant may have crashed between
    /// appending and enqueuing. Step tasks that are still queued keep their
    /// id, so they are left as they are.
    async fn heal(&self, state: &InstanceState) -> Result<(), DispatchError> {
        let instance_id = state.instance_id;
        if let Some(finished_at) = state.finished_at {
            self.queue
                .enqueue(self.purge_task(instance_id, finished_at))
                .await?;
            return Ok(());
        }

        let mut healed = 0usize;
        for (activity_id, activity) in state.outstanding_activities() {
            self.queue
                .enqueue(Task::new(TaskKind::Activity(ActivityTask {
                    activity_id,
                    workflow_instance_id: instance_id,
                    activity_type: activity.activity_type.clone(),
                    input: activity.input.clone(),
                    attempt_count: 0,
                    retry_policy: activity.retry_policy.clone(),
                    start_to_close_timeout: activity.start_to_close_timeout,
                    not_before: None,
                })))
                .await?;
            healed += 1;
        }
        for (timer_id, timer) in state.pending_timers() {
            self.queue
                .enqueue(timer_task(
                    instance_id,
                    timer.fire_at,
                    TimerPurpose::Sleep { timer_id },
                ))
                .await?;
            healed += 1;
        }
        if let Some(timeout) = state.execution_timeout {
            self.queue
                .enqueue(watchdog_task(
                    instance_id,
                    state.started_at + clock::to_chrono(timeout),
                ))
                .await?;
            healed += 1;
        }

        info!(%instance_id, healed, "re-enqueued outstanding work for redelivered task");
        Ok(())
    }

    /// Appends an activity or timer outcome unless it is already recorded,
    /// then wakes the instance.
    async fn record(
        &self,
        task: &Task,
        instance_id: WorkflowInstanceId,
        kind: EventKind,
        reason: WakeReason,
    ) -> Result<CycleOutcome, DispatchError> {
        let name = kind.name();
        let terminal = kind.is_terminal();
        let appended = self
            .append_with_retry(instance_id, |state| {
                if state.is_terminal() || is_recorded(state, &kind) {
                    AppendDecision::Skip
                } else {
                    AppendDecision::Append(kind.clone())
                }
            })
            .await;

        match appended {
            Ok(Some(sequence)) => {
                let follow_up = if terminal {
                    self.purge_task(instance_id, self.clock.now())
                } else {
                    workflow_task(instance_id, reason)
                };
                self.queue.enqueue(follow_up).await?;
                self.queue.ack(task.id).await?;
                debug!(%instance_id, sequence, event = name, "outcome recorded");
                Ok(CycleOutcome::Recorded {
                    instance_id,
                    event: name,
                })
            }
            Ok(None) => self.skip(task).await,
            Err(err) => self.handle_failure(task, err).await,
        }
    }

    async fn purge(
        &self,
        task: &Task,
        instance_id: WorkflowInstanceId,
    ) -> Result<CycleOutcome, DispatchError> {
        let state = match self.load_state(instance_id).await {
            Ok(state) => state,
            Err(err) => return self.handle_failure(task, err).await,
        };
        let Some(finished_at) = state.finished_at else {
            return self.skip(task).await;
        };

        let now = self.clock.now();
        let due = finished_at + clock::to_chrono(self.config.retention);
        if due > now {
            return self.requeue_until(task, now, due).await;
        }

        if let Err(err) = self.history.purge(instance_id).await {
            return self.handle_failure(task, err.into()).await;
        }
        self.queue.ack(task.id).await?;
        info!(%instance_id, "purged terminal instance");
        Ok(CycleOutcome::Purged { instance_id })
    }

    fn purge_task(&self, instance_id: WorkflowInstanceId, finished_at: DateTime<Utc>) -> Task {
        Task::new(TaskKind::Purge { instance_id })
            .not_before(finished_at + clock::to_chrono(self.config.retention))
    }

    async fn handle_failure(
        &self,
        task: &Task,
        err: DispatchError,
    ) -> Result<CycleOutcome, DispatchError> {
        match err {
            DispatchError::InstanceNotFound { .. } => self.skip(task).await,
            err if err.is_transient() => self.defer(task, &err).await,
            err => self.dead_letter(task, err.to_string()).await,
        }
    }

    async fn skip(&self, task: &Task) -> Result<CycleOutcome, DispatchError> {
        self.queue.ack(task.id).await?;
        Ok(CycleOutcome::Skipped {
            instance_id: task.instance_id(),
        })
    }

    async fn requeue_until(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<CycleOutcome, DispatchError> {
        let delay = clock::until(now, at);
        self.queue.nack(task.id, delay).await?;
        Ok(CycleOutcome::Deferred {
            instance_id: task.instance_id(),
            delay,
        })
    }

    async fn defer(
        &self,
        task: &Task,
        err: &(dyn fmt::Display + Sync),
    ) -> Result<CycleOutcome, DispatchError> {
        let delay = self
            .config
            .infrastructure_retry
            .backoff_for_attempt(task.attempt);
        warn!(task_id = %task.id, attempt = task.attempt, ?delay, error = %err, "deferring task");
        self.queue.nack(task.id, delay).await?;
        Ok(CycleOutcome::Deferred {
            instance_id: task.instance_id(),
            delay,
        })
    }

    async fn dead_letter(&self, task: &Task, reason: String) -> Result<CycleOutcome, DispatchError> {
        let instance_id = task.instance_id();
        error!(task_id = %task.id, %instance_id, %reason, "moving task to dead letter queue");
        self.queue
            .enqueue(Task::new(TaskKind::DeadLetter {
                original: Box::new(task.clone()),
                reason: reason.clone(),
            }))
            .await?;
        self.queue.ack(task.id).await?;
        Ok(CycleOutcome::DeadLettered {
            instance_id,
            reason,
        })
    }
}

/// Returns true if history already holds the outcome `kind` would record.
fn is_recorded(state: &InstanceState, kind: &EventKind) -> bool {
    match kind {
        EventKind::ActivityCompleted { activity_id, .. }
        | EventKind::ActivityFailed { activity_id, .. } => state
            .activity(*activity_id)
            .is_none_or(|activity| activity.outcome.is_some()),
        EventKind::TimerFired { timer_id } => {
            state.timers.get(timer_id).is_none_or(|timer| timer.fired)
        }
        _ => false,
    }
}

fn workflow_task(instance_id: WorkflowInstanceId, reason: WakeReason) -> Task {
    Task::new(TaskKind::Workflow(WorkflowTask {
        instance_id,
        reason,
    }))
}

fn timer_task(instance_id: WorkflowInstanceId, fire_at: DateTime<Utc>, purpose: TimerPurpose) -> Task {
    Task::new(TaskKind::Timer(TimerTask {
        instance_id,
        fire_at,
        purpose,
    }))
    .not_before(fire_at)
}

fn watchdog_task(instance_id: WorkflowInstanceId, fire_at: DateTime<Utc>) -> Task {
    timer_task(instance_id, fire_at, TimerPurpose::ExecutionTimeout)
}
