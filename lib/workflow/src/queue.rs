//! Durable task queues with visibility timeouts.
//!
//! Delivery is at-least-once. A claimed task stays hidden for its visibility
//! timeout; if it is not acknowledged in that window it becomes claimable
//! again and its attempt count grows. Consumers must therefore treat every
//! task as a possible duplicate.
//!
//! Tasks that drive one step of an instance (an activity, a timer, the
//! execution watchdog, the retention purge) get an id derived from that
//! step. Enqueuing such a task while its id is still queued or claimed is a
//! no-op, so re-enqueuing outstanding work never doubles it.

use crate::clock::{self, Clock};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{TaskId, WorkflowInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use ulid::Ulid;

/// Queue for workflow tasks.
pub const WORKFLOW_QUEUE: &str = "workflow";
/// Queue for activity tasks.
pub const ACTIVITY_QUEUE: &str = "activity";
/// Queue for timers and retention purges.
pub const TIMER_QUEUE: &str = "timer";
/// Quarantine for tasks that hit a determinism violation.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Every queue the engine uses.
pub const ALL_QUEUES: [&str; 4] = [WORKFLOW_QUEUE, ACTIVITY_QUEUE, TIMER_QUEUE, DEAD_LETTER_QUEUE];

/// A unit of work sitting in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// The task is not claimable before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Deliveries so far. Zero until first claimed.
    #[serde(default)]
    pub attempt: u32,
}

impl Task {
    /// Wraps `kind`, keyed by its step when it has one.
    #[must_use]
    pub fn new(kind: TaskKind) -> Self {
        let id = kind
            .step_slot()
            .map_or_else(TaskId::new, |(slot, step)| step_task_id(kind.instance_id(), slot, step));
        Self {
            id,
            kind,
            not_before: None,
            attempt: 0,
        }
    }

    /// Delays the task until `at`.
    #[must_use]
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        if let TaskKind::Activity(activity) = &mut self.kind {
            activity.not_before = Some(at);
        }
        self
    }

    /// Returns the queue this task belongs on.
    #[must_use]
    pub fn queue(&self) -> &'static str {
        match self.kind {
            TaskKind::Workflow(_) => WORKFLOW_QUEUE,
            TaskKind::Activity(_) => ACTIVITY_QUEUE,
            TaskKind::Timer(_) | TaskKind::Purge { .. } => TIMER_QUEUE,
            TaskKind::DeadLetter { .. } => DEAD_LETTER_QUEUE,
        }
    }

    /// Returns the instance this task acts on.
    #[must_use]
    pub fn instance_id(&self) -> WorkflowInstanceId {
        self.kind.instance_id()
    }

    /// Records a delivery. Backends call this on every claim.
    pub fn record_delivery(&mut self, attempt: u32) {
        self.attempt = attempt;
        if let TaskKind::Activity(activity) = &mut self.kind {
            activity.attempt_count = attempt;
        }
    }
}

/// What a task asks the dispatcher to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Advance an instance through the replay engine.
    Workflow(WorkflowTask),
    /// Run one activity attempt.
    Activity(ActivityTask),
    /// Fire a durable timer.
    Timer(TimerTask),
    /// Delete a terminal instance after its retention window.
    Purge { instance_id: WorkflowInstanceId },
    /// A quarantined task awaiting operator review.
    DeadLetter { original: Box<Task>, reason: String },
}

impl TaskKind {
    #[must_use]
    pub fn instance_id(&self) -> WorkflowInstanceId {
        match self {
            Self::Workflow(task) => task.instance_id,
            Self::Activity(task) => task.workflow_instance_id,
            Self::Timer(task) => task.instance_id,
            Self::Purge { instance_id } => *instance_id,
            Self::DeadLetter { original, .. } => original.instance_id(),
        }
    }

    /// The `(slot, step)` this task drives, if it drives exactly one.
    fn step_slot(&self) -> Option<(u8, u32)> {
        match self {
            Self::Activity(task) => Some((1, task.activity_id)),
            Self::Timer(TimerTask {
                purpose: TimerPurpose::Sleep { timer_id },
                ..
            }) => Some((2, *timer_id)),
            Self::Timer(TimerTask {
                purpose: TimerPurpose::ExecutionTimeout,
                ..
            }) => Some((3, 0)),
            Self::Purge { .. } => Some((4, 0)),
            Self::Workflow(_) | Self::DeadLetter { .. } => None,
        }
    }
}

/// Id for the task driving `step` of `instance_id`: the instance's ULID with
/// the step mixed into its random bits.
fn step_task_id(instance_id: WorkflowInstanceId, slot: u8, step: u32) -> TaskId {
    let instance = instance_id.as_ulid();
    let tag = (u128::from(slot) << 32) | u128::from(step);
    TaskId::from_ulid(Ulid::from_parts(
        instance.timestamp_ms(),
        instance.random() ^ tag,
    ))
}

/// Why an instance needs another replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    Started,
    ActivityResolved,
    TimerFired,
    SignalReceived,
    CancelRequested,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub instance_id: WorkflowInstanceId,
    pub reason: WakeReason,
}

/// One execution request for an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Step index of the activity within its instance.
    pub activity_id: u32,
    pub workflow_instance_id: WorkflowInstanceId,
    pub activity_type: String,
    pub input: JsonValue,
    /// Deliveries so far, kept in step with [`Task::attempt`].
    #[serde(default)]
    pub attempt_count: u32,
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub start_to_close_timeout: Option<Duration>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerPurpose {
    /// A timer the workflow started.
    Sleep { timer_id: u32 },
    /// The instance-wide execution deadline.
    ExecutionTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    pub instance_id: WorkflowInstanceId,
    pub fire_at: DateTime<Utc>,
    pub purpose: TimerPurpose,
}

/// Errors from task queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The backing queue could not be reached.
    Unavailable { message: String },
    /// No claimed task has this id.
    UnknownTask { task_id: TaskId },
    /// A task could not be encoded or decoded.
    Serialization { message: String },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "task queue unavailable: {message}"),
            Self::UnknownTask { task_id } => write!(f, "unknown task: {task_id}"),
            Self::Serialization { message } => write!(f, "task serialization failed: {message}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// At-least-once task delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Adds a task to the queue named by [`Task::queue`]. A task whose id is
    /// already queued or claimed is left as it is.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Claims the next visible task, hiding it for `visibility_timeout`.
    async fn claim(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError>;

    /// Removes a claimed task for good.
    async fn ack(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Returns a claimed task to the queue, visible again after `delay`.
    async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<(), QueueError>;

    /// Keeps a claimed task hidden for another `visibility_timeout`. Called
    /// periodically while a long attempt is still running.
    async fn extend(
        &self,
        task_id: TaskId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError>;
}

#[derive(Debug)]
struct Entry {
    queue: &'static str,
    task: Task,
    visible_at: DateTime<Utc>,
}

/// Task queue kept in process memory, timed by a [`Clock`].
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<TaskId, Entry>>,
}

impl InMemoryTaskQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns how many tasks, visible or not, sit in `queue`.
    pub async fn pending(&self, queue: &str) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    /// Returns a snapshot of the tasks in `queue`.
    pub async fn tasks(&self, queue: &str) -> Vec<Task> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.queue == queue)
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Returns the earliest instant any task becomes claimable.
    pub async fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.queue != DEAD_LETTER_QUEUE)
            .map(|entry| entry.visible_at)
            .min()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    #[instrument(skip(self, task), fields(task_id = %task.id, queue = task.queue()))]
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let now = self.clock.now();
        let visible_at = task.not_before.map_or(now, |at| at.max(now));
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&task.id) {
            debug!("task already queued");
            return Ok(());
        }
        entries.insert(
            task.id,
            Entry {
                queue: task.queue(),
                visible_at,
                task,
            },
        );
        debug!(%visible_at, "enqueued task");
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let next = entries
            .values_mut()
            .filter(|entry| entry.queue == queue && entry.visible_at <= now)
            .min_by_key(|entry| (entry.visible_at, entry.task.id));

        let Some(entry) = next else {
            return Ok(None);
        };

        entry.visible_at = now + clock::to_chrono(visibility_timeout);
        let attempt = entry.task.attempt.saturating_add(1);
        entry.task.record_delivery(attempt);
        debug!(task_id = %entry.task.id, queue, attempt, "claimed task");
        Ok(Some(entry.task.clone()))
    }

    async fn ack(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.entries
            .lock()
            .await
            .remove(&task_id)
            .map(|_| ())
            .ok_or(QueueError::UnknownTask { task_id })
    }

    async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&task_id)
            .ok_or(QueueError::UnknownTask { task_id })?;
        entry.visible_at = now + clock::to_chrono(delay);
        Ok(())
    }

    async fn extend(
        &self,
        task_id: TaskId,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        self.nack(task_id, visibility_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn workflow_task() -> Task {
        Task::new(TaskKind::Workflow(WorkflowTask {
            instance_id: WorkflowInstanceId::new(),
            reason: WakeReason::Started,
        }))
    }

    fn queue() -> (ManualClock, InMemoryTaskQueue) {
        let clock = ManualClock::new(Utc::now());
        let queue = InMemoryTaskQueue::new(Arc::new(clock.clone()));
        (clock, queue)
    }

    #[tokio::test]
    async fn claim_hides_task_until_visibility_lapses() {
        let (clock, queue) = queue();
        queue.enqueue(workflow_task()).await.unwrap();
        let visibility = Duration::from_secs(30);

        let first = queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().is_none());

        clock.advance(Duration::from_secs(31));
        let again = queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn ack_removes_task() {
        let (clock, queue) = queue();
        queue.enqueue(workflow_task()).await.unwrap();
        let task = queue
            .claim(WORKFLOW_QUEUE, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        queue.ack(task.id).await.unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(queue.claim(WORKFLOW_QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(
            queue.ack(task.id).await,
            Err(QueueError::UnknownTask { task_id: task.id })
        );
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let (clock, queue) = queue();
        queue.enqueue(workflow_task()).await.unwrap();
        let task = queue
            .claim(WORKFLOW_QUEUE, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        queue.nack(task.id, Duration::from_secs(2)).await.unwrap();

        assert!(queue.claim(WORKFLOW_QUEUE, Duration::from_secs(30)).await.unwrap().is_none());
        clock.advance(Duration::from_secs(2));
        let again = queue.claim(WORKFLOW_QUEUE, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again.map(|t| t.attempt), Some(2));
    }

    #[tokio::test]
    async fn future_tasks_are_not_claimable() {
        let (clock, queue) = queue();
        let fire_at = clock.now() + chrono::Duration::seconds(10);
        let task = Task::new(TaskKind::Timer(TimerTask {
            instance_id: WorkflowInstanceId::new(),
            fire_at,
            purpose: TimerPurpose::Sleep { timer_id: 0 },
        }))
        .not_before(fire_at);
        queue.enqueue(task).await.unwrap();

        assert!(queue.claim(TIMER_QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(queue.next_visible_at().await, Some(fire_at));

        clock.set(fire_at);
        assert!(queue.claim(TIMER_QUEUE, Duration::from_secs(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (_clock, queue) = queue();
        queue.enqueue(workflow_task()).await.unwrap();
        assert!(queue.claim(ACTIVITY_QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(queue.pending(WORKFLOW_QUEUE).await, 1);
    }

    #[test]
    fn delivery_syncs_activity_attempts() {
        let mut task = Task::new(TaskKind::Activity(ActivityTask {
            activity_id: 0,
            workflow_instance_id: WorkflowInstanceId::new(),
            activity_type: "Charge".to_string(),
            input: JsonValue::Null,
            attempt_count: 0,
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: None,
            not_before: None,
        }));
        assert_eq!(task.queue(), ACTIVITY_QUEUE);

        task.record_delivery(3);
        let TaskKind::Activity(activity) = &task.kind else {
            panic!("expected activity task");
        };
        assert_eq!(activity.attempt_count, 3);
    }

    #[test]
    fn dead_letter_keeps_original_instance() {
        let original = workflow_task();
        let instance_id = original.instance_id();
        let dead = Task::new(TaskKind::DeadLetter {
            original: Box::new(original),
            reason: "violation".to_string(),
        });
        assert_eq!(dead.queue(), DEAD_LETTER_QUEUE);
        assert_eq!(dead.instance_id(), instance_id);
    }

    fn activity_task(instance_id: WorkflowInstanceId, activity_id: u32) -> Task {
        Task::new(TaskKind::Activity(ActivityTask {
            activity_id,
            workflow_instance_id: instance_id,
            activity_type: "Charge".to_string(),
            input: JsonValue::Null,
            attempt_count: 0,
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: None,
            not_before: None,
        }))
    }

    #[test]
    fn step_tasks_have_stable_ids() {
        let instance_id = WorkflowInstanceId::new();
        let first = activity_task(instance_id, 0);
        assert_eq!(first.id, activity_task(instance_id, 0).id);
        assert_ne!(first.id, activity_task(instance_id, 1).id);
        assert_ne!(first.id, activity_task(WorkflowInstanceId::new(), 0).id);

        let purge = Task::new(TaskKind::Purge { instance_id });
        assert_ne!(purge.id, first.id);
        assert_ne!(workflow_task().id, workflow_task().id);
    }

    #[tokio::test]
    async fn enqueuing_a_live_step_again_is_a_no_op() {
        let (_clock, queue) = queue();
        let instance_id = WorkflowInstanceId::new();
        queue.enqueue(activity_task(instance_id, 0)).await.unwrap();
        let claimed = queue
            .claim(ACTIVITY_QUEUE, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        queue.nack(claimed.id, Duration::from_secs(5)).await.unwrap();

        queue.enqueue(activity_task(instance_id, 0)).await.unwrap();
        assert_eq!(queue.pending(ACTIVITY_QUEUE).await, 1);
        assert_eq!(queue.tasks(ACTIVITY_QUEUE).await[0].attempt, 1);
    }

    #[tokio::test]
    async fn extend_keeps_claimed_task_hidden() {
        let (clock, queue) = queue();
        queue.enqueue(workflow_task()).await.unwrap();
        let visibility = Duration::from_secs(10);
        let task = queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(8));
        queue.extend(task.id, visibility).await.unwrap();
        clock.advance(Duration::from_secs(8));
        assert!(queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().is_none());

        clock.advance(Duration::from_secs(3));
        assert!(queue.claim(WORKFLOW_QUEUE, visibility).await.unwrap().is_some());
    }
}
