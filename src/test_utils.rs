use crate::app_state::{AppState, SharedAppState};
use crate::cache::{CacheError, CacheStore, ResponseCache};
use crate::cli::{CacheBackend, CommandLineArgs};
use crate::engine::{Catalog, CatalogEngine};
use crate::error::ApiError;
use crate::task_queue::{
    task_failed, unix_now, Job, TaskHandle, TaskOutcome, TaskQueue, TaskStatus,
};

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// A small catalog: one atlas, one parcellation with four regions, one space, one map and three
/// features.
pub(crate) fn test_catalog() -> Catalog {
    serde_json::from_value(json!({
        "atlases": [{
            "id": "human",
            "name": "Multilevel Human Atlas",
            "species": "Homo sapiens",
            "parcellations": ["julich"],
            "spaces": ["mni152"]
        }],
        "parcellations": [{
            "id": "julich",
            "name": "Julich-Brain Cytoarchitectonic Atlas",
            "shortname": "julich 3.0",
            "version": "3.0",
            "modality": "cytoarchitecture",
            "spaces": ["mni152"],
            "regions": [{
                "name": "whole brain",
                "children": [{
                    "name": "frontal lobe",
                    "children": [
                        {"name": "area 44", "ontology_id": "minds/core/parcellationregion/v1.0.0/44"},
                        {"name": "area 45"}
                    ]
                }]
            }]
        }],
        "spaces": [{
            "id": "mni152",
            "name": "MNI 152 ICBM 2009c Nonlinear Asymmetric",
            "shortname": "mni152",
            "species": "Homo sapiens",
            "template_url": "https://example.org/mni152.nii.gz"
        }],
        "maps": [{
            "parcellation": "julich",
            "space": "mni152",
            "maptype": "labelled",
            "volumes": [{"url": "https://example.org/julich-mni152.nii.gz", "format": "nii"}],
            "indices": {"area 44": 1, "area 45": 2}
        }],
        "features": [
            {
                "id": "fp-44",
                "feature_type": "ReceptorDensityFingerprint",
                "name": "receptor density fingerprint of area 44",
                "parcellation": "julich",
                "regions": ["area 44"],
                "data": {"GABAA": 1520.0, "AMPA": 480.5}
            },
            {
                "id": "fp-45",
                "feature_type": "ReceptorDensityFingerprint",
                "name": "receptor density fingerprint of area 45",
                "parcellation": "julich",
                "regions": ["area 45"],
                "data": {"GABAA": 1390.0, "AMPA": 512.0}
            },
            {
                "id": "sc-1",
                "feature_type": "RegionalConnectivity",
                "name": "streamline counts",
                "parcellation": "julich",
                "data": [[0, 12], [12, 0]]
            }
        ]
    }))
    .unwrap()
}

/// Command line arguments with defaults, no cache and no queue.
pub(crate) fn test_args() -> CommandLineArgs {
    let mut args = CommandLineArgs::parse_from(["siibra-api"]);
    args.cache_backend = CacheBackend::None;
    args.broker_url = None;
    args.log_dir = None;
    args.ci = false;
    args
}

/// State of a role `all` process serving the test catalog.
pub(crate) fn test_state(cache: ResponseCache) -> SharedAppState {
    let engine = Arc::new(CatalogEngine::from_catalog(test_catalog()));
    Arc::new(AppState::with_parts(&test_args(), None, engine, cache).unwrap())
}

/// State of a role `server` process using `queue`.
pub(crate) fn test_server_state(queue: Arc<MemoryTaskQueue>, cache: ResponseCache) -> SharedAppState {
    let mut args = test_args();
    args.role = crate::role::Role::Server;
    let engine = Arc::new(CatalogEngine::from_catalog(test_catalog()));
    Arc::new(AppState::with_parts(&args, Some(queue), engine, cache).unwrap())
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    /// Outcome of every known task, `None` while pending
    tasks: HashMap<String, Option<TaskOutcome>>,
    revoked: HashSet<String>,
    heartbeats: HashMap<String, u64>,
    status_checks: Vec<Instant>,
    revoke_calls: usize,
    results_taken: usize,
}

/// In-memory task queue recording how it is used.
#[derive(Default)]
pub(crate) struct MemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    /// Run `check` until it returns a value, waking on every queue change.
    async fn until<T>(&self, mut check: impl FnMut(&mut QueueState) -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = check(&mut self.lock()) {
                return value;
            }
            notified.await;
        }
    }

    pub(crate) fn queued_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    pub(crate) fn stored_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    pub(crate) fn revoke_calls(&self) -> usize {
        self.lock().revoke_calls
    }

    pub(crate) fn results_taken(&self) -> usize {
        self.lock().results_taken
    }

    /// Times at which a status was requested.
    pub(crate) fn status_checks(&self) -> Vec<Instant> {
        self.lock().status_checks.clone()
    }

    pub(crate) fn heartbeat_of(&self, worker: &str) -> Option<u64> {
        self.lock().heartbeats.get(worker).copied()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn submit(&self, name: &str, args: Value) -> Result<TaskHandle, ApiError> {
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            state.tasks.insert(id.clone(), None);
            state.jobs.push_back(Job {
                id: id.clone(),
                name: name.to_string(),
                args,
            });
        }
        self.notify.notify_waiters();
        Ok(TaskHandle::new(id))
    }

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, ApiError> {
        let mut state = self.lock();
        state.status_checks.push(Instant::now());
        Ok(match state.tasks.get(&handle.id) {
            Some(Some(TaskOutcome::Success(_))) => TaskStatus::Success,
            Some(Some(TaskOutcome::Failure(_))) => TaskStatus::Failure,
            _ => TaskStatus::Pending,
        })
    }

    async fn take_result(&self, handle: &TaskHandle) -> Result<Value, ApiError> {
        let mut state = self.lock();
        match state.tasks.remove(&handle.id) {
            Some(Some(outcome)) => {
                state.results_taken += 1;
                match outcome {
                    TaskOutcome::Success(value) => Ok(value),
                    TaskOutcome::Failure(envelope) => Err(task_failed(&handle.id, envelope)),
                }
            }
            Some(None) => {
                state.tasks.insert(handle.id.clone(), None);
                Err(ApiError::Internal("task still pending".to_string()))
            }
            None => Err(ApiError::Internal("unknown task".to_string())),
        }
    }

    async fn wait(&self, handle: &TaskHandle) -> Result<Value, ApiError> {
        self.until(|state| match state.tasks.get(&handle.id) {
            Some(Some(_)) | None => Some(()),
            Some(None) => None,
        })
        .await;
        self.take_result(handle).await
    }

    async fn revoke(&self, handle: &TaskHandle) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.revoke_calls += 1;
        state.revoked.insert(handle.id.clone());
        state.tasks.remove(&handle.id);
        Ok(())
    }

    async fn next_job(&self, timeout: Duration) -> Result<Option<Job>, ApiError> {
        let popped = tokio::time::timeout(timeout, self.until(|state| state.jobs.pop_front()));
        Ok(popped.await.ok())
    }

    async fn is_revoked(&self, id: &str) -> Result<bool, ApiError> {
        Ok(self.lock().revoked.contains(id))
    }

    async fn complete(&self, id: &str, outcome: TaskOutcome) -> Result<(), ApiError> {
        self.lock().tasks.insert(id.to_string(), Some(outcome));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn heartbeat(&self, worker: &str) -> Result<(), ApiError> {
        self.lock().heartbeats.insert(worker.to_string(), unix_now());
        Ok(())
    }
}

/// In-memory cache store that can be made to fail.
#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// The stored bytes of `key`, as written by the cache.
    pub(crate) fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().unwrap().insert(key.to_string(), value);
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Disk("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.check()?;
        self.insert(key, value);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }
}
