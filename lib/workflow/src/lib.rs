//! Durable workflow engine for keel.
//!
//! Workflows are deterministic orchestration code. Everything they do is
//! recorded as an append-only history, and after any interruption an
//! instance resumes by replaying its code against that history:
//!
//! - **History**: per-instance event log with optimistic, gapless appends
//! - **Queues**: at-least-once task delivery with visibility timeouts
//! - **Replay**: re-runs workflow code inside a deterministic sandbox and
//!   collects the new steps it asks for
//! - **Activities**: side-effecting work, retried with backoff
//! - **Dispatcher**: claims tasks, commits events, enqueues follow-ups
//! - **Client**: starts, signals, cancels and inspects instances

pub mod activity;
pub mod client;
pub mod clock;
pub mod command;
pub mod context;
pub mod definition;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod history;
pub mod instance;
pub mod nats;
pub mod queue;
pub mod replay;
pub mod retry;
pub mod sandbox;

#[cfg(test)]
pub(crate) mod testing;

pub use activity::{Activity, ActivityContext, ActivityError, ActivityExecutor, ActivityFailure};
pub use client::{StartOptions, WorkflowClient, WorkflowStatusReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ActivityOptions, Interrupt, WorkflowContext};
pub use definition::{Registry, RegistryBuilder, WorkflowDefinition, WorkflowResult, WorkflowType};
pub use dispatcher::{CycleOutcome, Dispatcher, DispatcherConfig, WorkerRole};
pub use error::{ClientError, DeterminismViolation, DispatchError, RegistryError, ReplayError};
pub use history::{EventKind, HistoryError, HistoryEvent, HistoryStore, InMemoryHistoryStore};
pub use instance::{InstanceState, WorkflowStatus};
pub use queue::{InMemoryTaskQueue, QueueError, Task, TaskKind, TaskQueue};
pub use replay::ReplayEngine;
pub use retry::RetryPolicy;
pub use sandbox::Capability;
