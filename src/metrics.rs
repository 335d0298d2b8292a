//! Prometheus metrics

use crate::error::ApiError;
use crate::timers::RepeatingTimers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{body::Body, http::Request, response::Response};
use byte_unit::{Byte, UnitType};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).expect("valid metric");
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).expect("valid metric");
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).expect("valid metric");
    // Response cache lookups by result (hit, miss, bypass)
    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups", "The number of response cache lookups"),
        &["result"]
    ).expect("valid metric");
    // Operations dispatched by strategy
    pub static ref TASKS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("tasks_dispatched", "The number of operations dispatched"),
        &["strategy"]
    ).expect("valid metric");
    // Queued tasks revoked after the task timeout
    pub static ref TASK_TIMEOUTS: IntCounter = IntCounter::new(
        "task_timeouts", "The number of queued tasks revoked after timing out"
    ).expect("valid metric");
    // Jobs executed by a worker, by outcome
    pub static ref WORKER_JOBS: IntCounterVec = IntCounterVec::new(
        Opts::new("worker_jobs", "The number of jobs executed by this worker"),
        &["outcome"]
    ).expect("valid metric");
    // Size of the shared storage directory
    pub static ref SHARED_STORAGE_BYTES: IntGauge = IntGauge::new(
        "shared_storage_bytes", "Disk usage of the shared storage directory in bytes"
    ).expect("valid metric");
}

/// Register every collector with [REGISTRY].
///
/// Must be called once per process.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(INCOMING_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))?;
    REGISTRY.register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))?;
    REGISTRY.register(Box::new(CACHE_LOOKUPS.clone()))?;
    REGISTRY.register(Box::new(TASKS_DISPATCHED.clone()))?;
    REGISTRY.register(Box::new(TASK_TIMEOUTS.clone()))?;
    REGISTRY.register(Box::new(WORKER_JOBS.clone()))?;
    REGISTRY.register(Box::new(SHARED_STORAGE_BYTES.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text format.
pub async fn metrics_handler() -> Result<String, ApiError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|err| ApiError::Internal(format!("failed to encode metrics: {}", err)))?;
    String::from_utf8(buffer)
        .map_err(|err| ApiError::Internal(format!("metrics are not valid UTF-8: {}", err)))
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

/// Total size in bytes of the regular files below `path`.
///
/// Entries that disappear or cannot be read while walking are skipped.
pub fn directory_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => pending.push(entry.path()),
                Ok(metadata) => total += metadata.len(),
                Err(_) => {}
            }
        }
    }
    total
}

/// Measure the shared storage directory every `period` and publish its size.
pub fn start_disk_usage_poller(timers: &mut RepeatingTimers, path: PathBuf, period: Duration) {
    timers.spawn("disk_usage", period, move || {
        let path = path.clone();
        async move {
            match tokio::task::spawn_blocking(move || directory_size(&path)).await {
                Ok(bytes) => {
                    SHARED_STORAGE_BYTES.set(i64::try_from(bytes).unwrap_or(i64::MAX));
                    let size = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
                    tracing::debug!("shared storage uses {:.2}", size);
                }
                Err(err) => tracing::warn!("failed to measure shared storage: {}", err),
            }
        }
    });
}
