//! Distributed task queue.
//!
//! The queue carries operations from processes in the server role to processes in the worker
//! role. The two sides share nothing but the broker: a job is a name plus JSON arguments, and its
//! outcome is stored in the result backend until the submitter retrieves it exactly once.

use crate::error::{ApiError, ErrorEnvelope};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strum_macros::Display;
use tokio::sync::Mutex;
use uuid::Uuid;

/// State of a queued task as seen by the result backend.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Queued, running, or unknown to the backend
    Pending,
    /// Finished with a result
    Success,
    /// Finished with an error
    Failure,
}

impl TaskStatus {
    /// Parse a stored status. Anything unrecognised is still pending.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("SUCCESS") => Self::Success,
            Some("FAILURE") => Self::Failure,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Identifier of an enqueued task.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TaskHandle {
    pub id: String,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A unit of work on the queue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    /// Name of the registered operation
    pub name: String,
    pub args: Value,
}

/// How a job finished.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum TaskOutcome {
    Success(Value),
    Failure(ErrorEnvelope),
}

/// Convert a stored failure back into the error seen by the submitter.
pub fn task_failed(task_id: &str, envelope: ErrorEnvelope) -> ApiError {
    tracing::debug!(task_id, status = envelope.status_code, "task failed");
    ApiError::TaskFailed {
        task_id: task_id.to_string(),
        status: envelope.status_code,
        message: envelope.message,
    }
}

/// Task queue broker and result backend.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `name` with `args` and return its handle.
    async fn submit(&self, name: &str, args: Value) -> Result<TaskHandle, ApiError>;

    /// Current status of a task.
    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, ApiError>;

    /// Retrieve and forget the result of a finished task.
    ///
    /// A failed task surfaces its stored error as [ApiError::TaskFailed].
    async fn take_result(&self, handle: &TaskHandle) -> Result<Value, ApiError>;

    /// Wait, without a deadline, for a task to finish and take its result.
    async fn wait(&self, handle: &TaskHandle) -> Result<Value, ApiError>;

    /// Cancel a task. A worker skips revoked tasks it has not started.
    async fn revoke(&self, handle: &TaskHandle) -> Result<(), ApiError>;

    /// Pop the next job, waiting at most `timeout`.
    async fn next_job(&self, timeout: Duration) -> Result<Option<Job>, ApiError>;

    async fn is_revoked(&self, id: &str) -> Result<bool, ApiError>;

    /// Record the outcome of a job and wake any waiter.
    async fn complete(&self, id: &str, outcome: TaskOutcome) -> Result<(), ApiError>;

    /// Publish a worker liveness timestamp.
    async fn heartbeat(&self, worker: &str) -> Result<(), ApiError>;
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Redis backed task queue.
///
/// Keys, all under a common prefix:
/// * `<prefix>:queue`: list of pending jobs
/// * `<prefix>:task:<id>`: hash with `status`, `name` and `result` or `error`
/// * `<prefix>:done:<id>`: list pushed once when the task finishes
/// * `<prefix>:revoked:<id>`: revocation marker
/// * `<prefix>:worker:<name>`: worker heartbeat timestamp
///
/// Every key expires after the result TTL. Revoking a task deletes its record.
pub struct RedisTaskQueue {
    client: redis::Client,
    conn: ConnectionManager,
    /// Dedicated connection for the worker's blocking pops.
    consumer: Mutex<Option<MultiplexedConnection>>,
    prefix: String,
    result_ttl: u64,
}

impl RedisTaskQueue {
    /// Connect to the broker at `url`.
    pub async fn connect(url: &str, prefix: &str, result_ttl: u64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            consumer: Mutex::new(None),
            prefix: prefix.to_string(),
            result_ttl,
        })
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    fn done_key(&self, id: &str) -> String {
        format!("{}:done:{}", self.prefix, id)
    }

    fn revoked_key(&self, id: &str) -> String {
        format!("{}:revoked:{}", self.prefix, id)
    }

    fn heartbeat_key(&self, worker: &str) -> String {
        format!("{}:worker:{}", self.prefix, worker)
    }

    /// Last heartbeat of `worker`, in seconds since the unix epoch.
    pub async fn last_heartbeat(&self, worker: &str) -> Result<Option<u64>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.get(self.heartbeat_key(worker)).await
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn submit(&self, name: &str, args: Value) -> Result<TaskHandle, ApiError> {
        let id = Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            name: name.to_string(),
            args,
        };
        let payload = serde_json::to_string(&job)?;
        let task_key = self.task_key(&id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(&task_key, "status", TaskStatus::Pending.to_string())
            .ignore()
            .hset(&task_key, "name", name)
            .ignore()
            .cmd("EXPIRE")
            .arg(&task_key)
            .arg(self.result_ttl)
            .ignore()
            .lpush(self.queue_key(), payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::debug!(task_id = %id, operation = name, "submitted task");
        Ok(TaskHandle::new(id))
    }

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, ApiError> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn.hget(self.task_key(&handle.id), "status").await?;
        Ok(TaskStatus::parse(status.as_deref()))
    }

    async fn take_result(&self, handle: &TaskHandle) -> Result<Value, ApiError> {
        let task_key = self.task_key(&handle.id);
        let mut conn = self.conn.clone();
        let (fields, _, _): (HashMap<String, String>, (), ()) = redis::pipe()
            .atomic()
            .hgetall(&task_key)
            .del(&task_key)
            .del(self.done_key(&handle.id))
            .query_async(&mut conn)
            .await?;
        match TaskStatus::parse(fields.get("status").map(String::as_str)) {
            TaskStatus::Success => {
                let result = fields.get("result").map(String::as_str).unwrap_or("null");
                Ok(serde_json::from_str(result)?)
            }
            TaskStatus::Failure => {
                let error = fields.get("error").map(String::as_str).unwrap_or("{}");
                let envelope: ErrorEnvelope = serde_json::from_str(error)?;
                Err(task_failed(&handle.id, envelope))
            }
            TaskStatus::Pending => Err(ApiError::Internal(format!(
                "result of task {} requested before it finished",
                handle.id
            ))),
        }
    }

    async fn wait(&self, handle: &TaskHandle) -> Result<Value, ApiError> {
        // A blocking pop would stall every other command on a shared connection.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.done_key(&handle.id))
            .arg(0)
            .query_async(&mut conn)
            .await?;
        self.take_result(handle).await
    }

    async fn revoke(&self, handle: &TaskHandle) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.revoked_key(&handle.id))
            .arg(1)
            .arg("EX")
            .arg(self.result_ttl)
            .ignore()
            .del(self.task_key(&handle.id))
            .ignore()
            .del(self.done_key(&handle.id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        tracing::info!(task_id = %handle.id, "revoked task");
        Ok(())
    }

    async fn next_job(&self, timeout: Duration) -> Result<Option<Job>, ApiError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_none() {
            *consumer = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let conn = consumer
            .as_mut()
            .ok_or_else(|| ApiError::Internal("task queue consumer not connected".to_string()))?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.queue_key())
            .arg(timeout.as_secs_f64())
            .query_async(conn)
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn is_revoked(&self, id: &str) -> Result<bool, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.revoked_key(id)).await?)
    }

    async fn complete(&self, id: &str, outcome: TaskOutcome) -> Result<(), ApiError> {
        let task_key = self.task_key(id);
        let done_key = self.done_key(id);
        let (status, field, value) = match &outcome {
            TaskOutcome::Success(result) => {
                (TaskStatus::Success, "result", serde_json::to_string(result)?)
            }
            TaskOutcome::Failure(envelope) => {
                (TaskStatus::Failure, "error", serde_json::to_string(envelope)?)
            }
        };
        let ttl = self.result_ttl;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(&task_key, field, value)
            .ignore()
            .hset(&task_key, "status", status.to_string())
            .ignore()
            .cmd("EXPIRE")
            .arg(&task_key)
            .arg(ttl)
            .ignore()
            .lpush(&done_key, 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&done_key)
            .arg(ttl)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, worker: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.heartbeat_key(worker))
            .arg(unix_now())
            .arg("EX")
            .arg(self.result_ttl)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn parse_status() {
        assert_eq!(TaskStatus::parse(Some("SUCCESS")), TaskStatus::Success);
        assert_eq!(TaskStatus::parse(Some("FAILURE")), TaskStatus::Failure);
        assert_eq!(TaskStatus::parse(Some("PENDING")), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse(Some("STARTED")), TaskStatus::Pending);
        assert_eq!(TaskStatus::parse(None), TaskStatus::Pending);
        assert_eq!(TaskStatus::Success.to_string(), "SUCCESS");
        assert!(TaskStatus::Failure.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn job_json() {
        let job = Job {
            id: "1".to_string(),
            name: "single_atlas".to_string(),
            args: json!({"atlas_id": "human"}),
        };
        let payload = serde_json::to_string(&job).unwrap();
        assert_eq!(
            payload,
            r#"{"id":"1","name":"single_atlas","args":{"atlas_id":"human"}}"#
        );
    }

    #[test]
    fn failure_keeps_status() {
        let envelope = ErrorEnvelope {
            error: true,
            status_code: 503,
            message: "down".to_string(),
            caused_by: None,
        };
        let error = task_failed("abc", envelope);
        assert_eq!(error.status().as_u16(), 503);
        assert_eq!(error.to_string(), "down");
    }
}
