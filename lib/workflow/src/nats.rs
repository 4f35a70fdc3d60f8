//! NATS JetStream backends for history and task queues.
//!
//! - `NatsHistoryStore`: a key-value bucket with one key per event,
//!   `history.<instance>.<sequence>`. An append is a `create` of the next key,
//!   which JetStream refuses if the key exists, so racing writers conflict.
//! - `NatsTaskQueue`: a work-queue stream with subjects `keel.tasks.<queue>`
//!   and one durable pull consumer per queue. The consumer's `ack_wait` is the
//!   visibility timeout; nack is a delayed `Nak` and extend is a progress ack.
//!   Tasks are published with their id as `Nats-Msg-Id`, so a step task
//!   enqueued twice within the stream's duplicate window is stored once.

use crate::clock::{self, Clock};
use crate::envelope::Envelope;
use crate::history::{HistoryError, HistoryEvent, HistoryStore, NewEvent};
use crate::queue::{QueueError, Task, TaskQueue};
use async_nats::jetstream::{self, AckKind, consumer, kv, stream};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use keel_core::{TaskId, WorkflowInstanceId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Subject prefix for queued tasks.
const TASK_SUBJECT_PREFIX: &str = "keel.tasks";

/// Key prefix for history events.
const HISTORY_KEY_PREFIX: &str = "history";

/// Connection settings for the NATS backends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Key-value bucket holding history.
    pub history_bucket: String,
    /// Stream holding queued tasks.
    pub task_stream: String,
    /// How long the task stream remembers message ids for deduplication.
    pub duplicate_window_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            history_bucket: "KEEL_HISTORY".to_string(),
            task_stream: "KEEL_TASKS".to_string(),
            duplicate_window_secs: 60 * 60,
        }
    }
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Errors from setting up the NATS backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatsSetupError {
    ConnectionFailed { message: String },
    HistoryBucket { message: String },
    TaskStream { message: String },
}

impl std::fmt::Display for NatsSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "failed to connect to NATS: {message}"),
            Self::HistoryBucket { message } => write!(f, "history bucket setup failed: {message}"),
            Self::TaskStream { message } => write!(f, "task stream setup failed: {message}"),
        }
    }
}

impl std::error::Error for NatsSetupError {}

/// Connects once and builds both backends on the same JetStream context.
///
/// # Errors
///
/// Returns an error if the connection, bucket or stream setup fails.
pub async fn connect(
    config: &NatsConfig,
    clock: Arc<dyn Clock>,
) -> Result<(NatsHistoryStore, NatsTaskQueue), NatsSetupError> {
    let client = async_nats::connect(&config.url)
        .await
        .map_err(|e| NatsSetupError::ConnectionFailed {
            message: e.to_string(),
        })?;
    let jetstream = jetstream::new(client);

    let history = NatsHistoryStore::new(&jetstream, config).await?;
    let queue = NatsTaskQueue::new(jetstream, config, clock).await?;
    Ok((history, queue))
}

fn history_key(instance_id: WorkflowInstanceId, sequence: u64) -> String {
    format!("{HISTORY_KEY_PREFIX}.{instance_id}.{sequence:020}")
}

fn task_subject(queue: &str) -> String {
    format!("{TASK_SUBJECT_PREFIX}.{queue}")
}

fn unavailable(e: impl std::fmt::Display) -> HistoryError {
    HistoryError::Unavailable {
        message: e.to_string(),
    }
}

/// History in a JetStream key-value bucket.
pub struct NatsHistoryStore {
    store: kv::Store,
}

impl NatsHistoryStore {
    async fn new(
        jetstream: &jetstream::Context,
        config: &NatsConfig,
    ) -> Result<Self, NatsSetupError> {
        let store = match jetstream.get_key_value(&config.history_bucket).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.history_bucket.clone(),
                    history: 1,
                    storage: stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|e| NatsSetupError::HistoryBucket {
                    message: e.to_string(),
                })?,
        };
        Ok(Self { store })
    }

    async fn event_at(
        &self,
        instance_id: WorkflowInstanceId,
        sequence: u64,
    ) -> Result<Option<HistoryEvent>, HistoryError> {
        let Some(bytes) = self
            .store
            .get(history_key(instance_id, sequence))
            .await
            .map_err(unavailable)?
        else {
            return Ok(None);
        };
        let event = Envelope::<HistoryEvent>::decode(&bytes).map_err(|e| HistoryError::Corrupt {
            instance_id,
            message: format!("event {sequence}: {e}"),
        })?;
        Ok(Some(event))
    }

    async fn exists(
        &self,
        instance_id: WorkflowInstanceId,
        sequence: u64,
    ) -> Result<bool, HistoryError> {
        Ok(self
            .store
            .get(history_key(instance_id, sequence))
            .await
            .map_err(unavailable)?
            .is_some())
    }
}

#[async_trait]
impl HistoryStore for NatsHistoryStore {
    #[instrument(skip(self, event), fields(kind = event.kind.name()))]
    async fn append(
        &self,
        instance_id: WorkflowInstanceId,
        expected_last: Option<u64>,
        event: NewEvent,
    ) -> Result<u64, HistoryError> {
        // Sequences are gapless, so if `expected_last` exists and the next key
        // does not, `expected_last` is the head.
        if let Some(expected) = expected_last
            && !self.exists(instance_id, expected).await?
        {
            let actual = self.last_sequence(instance_id).await?;
            return Err(HistoryError::Conflict {
                instance_id,
                expected: expected_last,
                actual,
            });
        }

        let sequence = expected_last.map_or(0, |s| s + 1);
        let bytes = Envelope::encode(HistoryEvent {
            sequence,
            timestamp: event.timestamp,
            kind: event.kind,
        })
        .map_err(|e| HistoryError::Corrupt {
            instance_id,
            message: e.to_string(),
        })?;

        match self
            .store
            .create(history_key(instance_id, sequence), bytes.into())
            .await
        {
            Ok(_) => {
                debug!(sequence, "appended history event");
                Ok(sequence)
            }
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                let actual = self.last_sequence(instance_id).await?;
                Err(HistoryError::Conflict {
                    instance_id,
                    expected: expected_last,
                    actual,
                })
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    fn read(
        &self,
        instance_id: WorkflowInstanceId,
        from: u64,
    ) -> BoxStream<'_, Result<HistoryEvent, HistoryError>> {
        futures::stream::try_unfold(from, move |next| async move {
            Ok(self
                .event_at(instance_id, next)
                .await?
                .map(|event| (event, next + 1)))
        })
        .boxed()
    }

    async fn last_sequence(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Option<u64>, HistoryError> {
        if !self.exists(instance_id, 0).await? {
            return Ok(None);
        }

        // Gallop to a missing key, then bisect between the last hit and it.
        let mut present = 0u64;
        let mut missing = 1u64;
        while self.exists(instance_id, missing).await? {
            present = missing;
            missing = missing.saturating_mul(2);
        }
        while missing - present > 1 {
            let mid = present + (missing - present) / 2;
            if self.exists(instance_id, mid).await? {
                present = mid;
            } else {
                missing = mid;
            }
        }
        Ok(Some(present))
    }

    #[instrument(skip(self))]
    async fn purge(&self, instance_id: WorkflowInstanceId) -> Result<(), HistoryError> {
        let Some(last) = self.last_sequence(instance_id).await? else {
            return Ok(());
        };
        // Newest first, so an interrupted purge still leaves a gapless prefix.
        for sequence in (0..=last).rev() {
            self.store
                .purge(history_key(instance_id, sequence))
                .await
                .map_err(unavailable)?;
        }
        debug!(events = last + 1, "purged history");
        Ok(())
    }
}

/// Task queues on a JetStream work-queue stream.
pub struct NatsTaskQueue {
    jetstream: jetstream::Context,
    stream: stream::Stream,
    clock: Arc<dyn Clock>,
    consumers: Mutex<HashMap<String, consumer::PullConsumer>>,
    in_flight: Mutex<HashMap<TaskId, jetstream::Message>>,
}

impl NatsTaskQueue {
    async fn new(
        jetstream: jetstream::Context,
        config: &NatsConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NatsSetupError> {
        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: config.task_stream.clone(),
                subjects: vec![format!("{TASK_SUBJECT_PREFIX}.>")],
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::WorkQueue,
                duplicate_window: Duration::from_secs(config.duplicate_window_secs),
                ..Default::default()
            })
            .await
            .map_err(|e| NatsSetupError::TaskStream {
                message: e.to_string(),
            })?;

        Ok(Self {
            jetstream,
            stream,
            clock,
            consumers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the durable consumer for `queue`, creating it on first use.
    ///
    /// `ack_wait` is fixed when the consumer is created, so every claimant of
    /// a queue should use the same visibility timeout.
    async fn consumer(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<consumer::PullConsumer, QueueError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.get(queue) {
            return Ok(existing.clone());
        }

        let name = format!("keel-{queue}");
        let created = self
            .stream
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: task_subject(queue),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: visibility_timeout,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Unavailable {
                message: format!("failed to create consumer {name}: {e}"),
            })?;
        consumers.insert(queue.to_string(), created.clone());
        Ok(created)
    }

    async fn take_in_flight(&self, task_id: TaskId) -> Result<jetstream::Message, QueueError> {
        self.in_flight
            .lock()
            .await
            .remove(&task_id)
            .ok_or(QueueError::UnknownTask { task_id })
    }
}

#[async_trait]
impl TaskQueue for NatsTaskQueue {
    #[instrument(skip(self, task), fields(task_id = %task.id, queue = task.queue()))]
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let subject = task_subject(task.queue());
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, task.id.to_string().as_str());
        let bytes = Envelope::encode(task).map_err(|e| QueueError::Serialization {
            message: e.to_string(),
        })?;

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, bytes.into())
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })?;
        if ack.duplicate {
            debug!("task already queued");
        }
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let consumer = self.consumer(queue, visibility_timeout).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })?;

        let Some(message) = batch.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| QueueError::Unavailable {
            message: e.to_string(),
        })?;

        let mut task = match Envelope::<Task>::decode(&message.payload) {
            Ok(task) => task,
            Err(e) => {
                // Undecodable tasks would be redelivered forever.
                warn!(queue, error = %e, "dropping undecodable task");
                message
                    .ack_with(AckKind::Term)
                    .await
                    .map_err(|e| QueueError::Unavailable {
                        message: e.to_string(),
                    })?;
                return Ok(None);
            }
        };

        let now = self.clock.now();
        if let Some(not_before) = task.not_before
            && not_before > now
        {
            let delay = clock::until(now, not_before);
            message
                .ack_with(AckKind::Nak(Some(delay)))
                .await
                .map_err(|e| QueueError::Unavailable {
                    message: e.to_string(),
                })?;
            return Ok(None);
        }

        let delivered = message
            .info()
            .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
            .unwrap_or(1);
        task.record_delivery(delivered);
        debug!(task_id = %task.id, queue, attempt = delivered, "claimed task");

        self.in_flight.lock().await.insert(task.id, message);
        Ok(Some(task))
    }

    async fn ack(&self, task_id: TaskId) -> Result<(), QueueError> {
        let message = self.take_in_flight(task_id).await?;
        message.ack().await.map_err(|e| QueueError::Unavailable {
            message: e.to_string(),
        })
    }

    async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<(), QueueError> {
        let message = self.take_in_flight(task_id).await?;
        message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })
    }

    /// A progress ack restarts the consumer's `ack_wait`; the requested
    /// timeout cannot differ from it.
    async fn extend(
        &self,
        task_id: TaskId,
        _visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let in_flight = self.in_flight.lock().await;
        let message = in_flight
            .get(&task_id)
            .ok_or(QueueError::UnknownTask { task_id })?;
        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keys_sort_by_sequence() {
        let id = WorkflowInstanceId::new();
        let ninth = history_key(id, 9);
        let tenth = history_key(id, 10);
        assert!(ninth.starts_with(&format!("history.{id}.")));
        assert!(ninth < tenth);
    }

    #[test]
    fn task_subjects_follow_queue_names() {
        assert_eq!(task_subject(crate::queue::ACTIVITY_QUEUE), "keel.tasks.activity");
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: NatsConfig =
            serde_json::from_value(serde_json::json!({"url": "nats://nats:4222"})).unwrap();
        assert_eq!(config.url, "nats://nats:4222");
        assert_eq!(config.history_bucket, NatsConfig::default().history_bucket);
        assert_eq!(config.duplicate_window_secs, 3600);
    }
}
