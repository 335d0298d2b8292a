use crate::cache::ResponseCache;
use crate::cli::{redact, CommandLineArgs};
use crate::data_handlers;
use crate::dispatch::{DispatchOptions, DispatchRegistry, Dispatched};
use crate::engine::{AtlasEngine, CatalogEngine};
use crate::error::{ApiError, ConfigError};
use crate::metrics;
use crate::resource_manager::ResourceManager;
use crate::role::Role;
use crate::task_queue::{RedisTaskQueue, TaskQueue};
use crate::timers::RepeatingTimers;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use expanduser::expanduser;
use serde_json::Value;

/// Name of the engine catalog within the shared storage directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// Shared application state passed to each request handler and to the worker.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Every operation of the process.
    pub registry: DispatchRegistry,

    /// Response cache.
    pub cache: ResponseCache,

    /// Resource manager.
    pub resources: Arc<ResourceManager>,

    timers: Mutex<RepeatingTimers>,
}

impl AppState {
    /// Create and return an [AppState], connecting to the task queue and the response cache as
    /// the role requires and starting the background timers.
    pub async fn new(args: &CommandLineArgs) -> Result<Self, ConfigError> {
        let queue = connect_queue(args).await?;
        let engine = Arc::new(CatalogEngine::open(&shared_storage(args).join(CATALOG_FILE)));
        let cache = if args.role.serves_http() {
            ResponseCache::connect(args).await
        } else {
            ResponseCache::disabled()
        };
        let state = Self::with_parts(args, queue, engine, cache)?;
        state.start_timers();
        Ok(state)
    }

    /// Assemble an [AppState] from already connected parts.
    pub fn with_parts(
        args: &CommandLineArgs,
        queue: Option<Arc<dyn TaskQueue>>,
        engine: Arc<dyn AtlasEngine>,
        cache: ResponseCache,
    ) -> Result<Self, ConfigError> {
        let task_limit = match args.role {
            Role::Worker => Some(
                args.worker_concurrency
                    .unwrap_or_else(num_cpus::get)
                    .max(1),
            ),
            _ => None,
        };
        let resources = Arc::new(ResourceManager::new(args.blocking_dispatch_limit, task_limit));
        let options = DispatchOptions {
            task_timeout: args.task_timeout(),
            use_rayon: args.use_rayon,
            resources: resources.clone(),
        };
        let mut registry = DispatchRegistry::new(args.role, queue, options)?;
        data_handlers::register_all(&mut registry, engine)?;
        Ok(Self {
            args: args.clone(),
            registry,
            cache,
            resources,
            timers: Mutex::new(RepeatingTimers::new()),
        })
    }

    fn start_timers(&self) {
        let mut timers = self.timers();
        self.cache.start_heartbeat(
            &mut timers,
            Duration::from_secs(self.args.cache_heartbeat_interval),
        );
        metrics::start_disk_usage_poller(
            &mut timers,
            shared_storage(&self.args),
            Duration::from_secs(self.args.disk_usage_interval),
        );
    }

    /// The background timers of the process.
    pub fn timers(&self) -> MutexGuard<'_, RepeatingTimers> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Call the operation `name`.
    pub async fn call(&self, name: &str, args: Value) -> Result<Dispatched, ApiError> {
        self.registry.call(name, args).await
    }

    /// Stop every background timer.
    pub fn shutdown(&self) {
        self.timers().shutdown();
    }

    /// Stop the timers and release the task queue and cache connections.
    ///
    /// Connections close only when this is the last reference to the state. Returns whether they
    /// were closed.
    pub fn close(self: Arc<Self>) -> bool {
        self.shutdown();
        match Arc::try_unwrap(self) {
            Ok(state) => {
                drop(state);
                tracing::info!("closed task queue and cache connections");
                true
            }
            Err(state) => {
                tracing::warn!(
                    references = Arc::strong_count(&state),
                    "state still in use, connections left open"
                );
                false
            }
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;

/// The shared storage directory with `~` expanded.
pub fn shared_storage(args: &CommandLineArgs) -> PathBuf {
    expanduser(&args.shared_storage).unwrap_or_else(|_| PathBuf::from(&args.shared_storage))
}

/// Connect to the task queue if the role uses one.
async fn connect_queue(args: &CommandLineArgs) -> Result<Option<Arc<dyn TaskQueue>>, ConfigError> {
    match (args.role.uses_queue(), &args.broker_url) {
        (false, None) => Ok(None),
        (false, Some(_)) => Err(ConfigError::UnexpectedTaskQueue(args.role)),
        (true, None) => Err(ConfigError::MissingTaskQueue(args.role)),
        (true, Some(url)) => {
            tracing::info!("connecting to task queue at {}", redact(url));
            let queue = RedisTaskQueue::connect(url, &args.queue_prefix, args.result_ttl)
                .await
                .map_err(|err| ConfigError::QueueUnavailable {
                    url: redact(url),
                    reason: err.to_string(),
                })?;
            Ok(Some(Arc::new(queue)))
        }
    }
}
