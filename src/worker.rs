//! Task queue worker.
//!
//! A process in the worker role pulls jobs from the task queue and runs the registered operation
//! of each in-process, storing its outcome for the submitter. At most one job per task permit
//! runs at a time.

use crate::app_state::SharedAppState;
use crate::dispatch::run_body;
use crate::error::{ApiError, ErrorEnvelope};
use crate::metrics::WORKER_JOBS;
use crate::task_queue::{Job, TaskOutcome, TaskQueue};

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Period between two liveness heartbeats of a worker.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long a single fetch waits for a job before checking for shutdown again.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before fetching again after the queue returned an error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run jobs from the task queue until `shutdown` completes, then wait for running jobs to finish.
pub async fn run<S>(state: SharedAppState, shutdown: S) -> Result<(), ApiError>
where
    S: Future<Output = ()>,
{
    let queue = state
        .registry
        .queue()
        .cloned()
        .ok_or_else(|| ApiError::Internal("worker role requires a task queue".to_string()))?;
    start_heartbeat(&state, queue.clone());
    tracing::info!(
        worker = %state.args.worker_name,
        operations = state.registry.names().len(),
        "worker ready"
    );

    tokio::pin!(shutdown);
    loop {
        // Take a permit before the job so that no job waits on the queue side of the worker.
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = state.resources.task() => permit?,
        };
        let fetched = tokio::select! {
            _ = &mut shutdown => break,
            fetched = queue.next_job(FETCH_TIMEOUT) => fetched,
        };
        match fetched {
            Ok(Some(job)) => {
                let state = state.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    process(state, queue.as_ref(), job).await;
                    drop(permit);
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("failed to fetch a job: {}", err);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {},
                }
            }
        }
    }

    tracing::info!("worker shutting down, waiting for running jobs");
    state.resources.drain_tasks().await
}

fn start_heartbeat(state: &SharedAppState, queue: Arc<dyn TaskQueue>) {
    let worker = state.args.worker_name.clone();
    state
        .timers()
        .spawn("worker_heartbeat", HEARTBEAT_INTERVAL, move || {
            let queue = queue.clone();
            let worker = worker.clone();
            async move {
                if let Err(err) = queue.heartbeat(&worker).await {
                    tracing::warn!("worker heartbeat failed: {}", err);
                }
            }
        });
}

/// Run one job and store its outcome.
async fn process(state: SharedAppState, queue: &dyn TaskQueue, job: Job) {
    tracing::info!(task_id = %job.id, operation = %job.name, "received task");
    match queue.is_revoked(&job.id).await {
        Ok(true) => {
            WORKER_JOBS.with_label_values(&["revoked"]).inc();
            tracing::info!(task_id = %job.id, "task was revoked, skipping");
            return;
        }
        Ok(false) => {}
        Err(err) => tracing::warn!(task_id = %job.id, "failed to check revocation: {}", err),
    }

    let id = job.id.clone();
    // A panicking operation fails its task rather than the worker.
    let result = match tokio::spawn(execute(state, job)).await {
        Ok(result) => result,
        Err(err) => Err(ApiError::from(err)),
    };
    let outcome = match result {
        Ok(value) => {
            WORKER_JOBS.with_label_values(&["success"]).inc();
            TaskOutcome::Success(value)
        }
        Err(err) => {
            WORKER_JOBS.with_label_values(&["failure"]).inc();
            TaskOutcome::Failure(ErrorEnvelope::from(err))
        }
    };
    if let Err(err) = queue.complete(&id, outcome).await {
        tracing::error!(task_id = %id, "failed to store task outcome: {}", err);
    }
}

/// Run the operation named by `job` in this process.
pub async fn execute(state: SharedAppState, job: Job) -> Result<Value, ApiError> {
    let target = state
        .registry
        .target(&job.name)
        .ok_or_else(|| ApiError::UnknownOperation(job.name.clone()))?;
    run_body(target.body(), target.arguments(job.args), state.args.use_rayon).await
}
