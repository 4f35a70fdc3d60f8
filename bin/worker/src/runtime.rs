//! Startup and shutdown of the dispatcher loops.

use crate::config::{Backend, WorkerConfig};
use crate::demo::{self, ORDER_WORKFLOW};
use crate::error::WorkerError;
use keel_internal_api::InternalApiClient;
use keel_workflow::{
    Clock, Dispatcher, HistoryStore, InMemoryHistoryStore, InMemoryTaskQueue, SystemClock,
    TaskQueue, WorkerRole, WorkflowClient, nats,
};
use rootcause::prelude::Report;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Builds the engine described by `config` and runs it until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if a backend, the registry or the internal API cannot be
/// set up.
pub async fn run(
    config: WorkerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Report<WorkerError>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let api = config.internal_api_config().map(InternalApiClient::new);
    if let Some(api) = &api {
        info!(socket = %api.config().socket_path.display(), "waiting for internal API");
        api.wait_until_ready()
            .await
            .map_err(|e| WorkerError::InternalApi {
                message: e.to_string(),
            })?;
    }

    let (history, queue): (Arc<dyn HistoryStore>, Arc<dyn TaskQueue>) = match config.backend {
        Backend::Memory => {
            warn!("using in-memory backend; workflow state is lost on exit");
            (
                Arc::new(InMemoryHistoryStore::new()),
                Arc::new(InMemoryTaskQueue::new(clock.clone())),
            )
        }
        Backend::Nats => {
            info!(url = %config.nats.url, "connecting to NATS");
            let (history, queue) = nats::connect(&config.nats, clock.clone())
                .await
                .map_err(WorkerError::Backend)?;
            (Arc::new(history), Arc::new(queue))
        }
    };

    let registry = demo::registry(api).map_err(WorkerError::Registry)?;
    info!(registry = ?registry, "registry built");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        history,
        queue,
        clock,
        config.dispatcher_config(),
    ));

    let (stop, stopped) = watch::channel(false);
    let mut workers = JoinSet::new();
    let counts = &config.workers;
    for (role, count) in [
        (WorkerRole::Workflow, counts.workflow),
        (WorkerRole::Activity, counts.activity),
        (WorkerRole::Timer, counts.timer),
    ] {
        for _ in 0..count {
            workers.spawn(dispatcher.clone().run(role, stopped.clone()));
        }
    }
    info!(
        workflow = counts.workflow,
        activity = counts.activity,
        timer = counts.timer,
        "worker loops started"
    );

    if let Some(item) = &config.demo.order_item {
        let client = WorkflowClient::new(dispatcher.clone());
        let instance_id = client
            .start_workflow(ORDER_WORKFLOW, 1, json!({"item": item}))
            .await
            .map_err(|e| WorkerError::Submit {
                message: e.to_string(),
            })?;
        info!(%instance_id, item, "submitted demo order");
    }

    shutdown.await;
    info!("shutting down, waiting for in-flight cycles");
    // Receivers see the change even if they are mid-cycle.
    let _ = stop.send(true);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "worker loop panicked");
        }
    }
    info!("all worker loops stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_backend_starts_and_stops() {
        let config = WorkerConfig::default();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(config, tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("worker stopped in time");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_internal_api_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::default();
        config.internal_api = Some(crate::config::InternalApiSettings {
            socket_path: dir.path().join("absent.sock"),
            request_timeout_ms: 50,
            ready_timeout_secs: 0,
        });

        let err = run(config, std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("internal API unavailable"));
    }
}
