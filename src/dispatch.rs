//! Operation dispatch.
//!
//! Every business operation is registered once at startup as a [DispatchTarget] in a
//! [DispatchRegistry]. The registry picks a [Dispatcher] for each target from the process
//! [Role]:
//!
//! * [Direct] runs the target in-process (role `all`).
//! * [QueueBlocking] submits the target to the task queue and waits for its result without a
//!   deadline (role `server`).
//! * [QueueCooperative] submits the target and polls its status with exponential backoff,
//!   revoking it when the task timeout expires (role `server`, cooperative targets).
//!
//! Targets registered as queued return their task handle immediately instead of a result.
//! In role `worker` targets have no dispatcher; the [worker](crate::worker) runs them by name.

use crate::error::{ApiError, ConfigError};
use crate::metrics::{TASKS_DISPATCHED, TASK_TIMEOUTS};
use crate::resource_manager::ResourceManager;
use crate::role::Role;
use crate::task_queue::{TaskHandle, TaskQueue, TaskStatus};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Initial delay between two status checks of a queued task.
pub const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Ceiling of the delay between two status checks.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default time after which a polled task is revoked.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, ApiError>> + Send>>;
pub type BlockingFn = Arc<dyn Fn(Value) -> Result<Value, ApiError> + Send + Sync>;
pub type CooperativeFn = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// The code of an operation.
#[derive(Clone)]
pub enum TaskBody {
    /// Runs to completion on a blocking thread.
    Blocking(BlockingFn),
    /// Suspends cooperatively on the async runtime.
    Cooperative(CooperativeFn),
}

impl TaskBody {
    pub fn is_cooperative(&self) -> bool {
        matches!(self, Self::Cooperative(_))
    }
}

/// Run a task body in this process.
///
/// Blocking bodies run on the Tokio blocking pool, or on the Rayon pool when `use_rayon` is set,
/// so that they never stall the runtime.
pub async fn run_body(body: &TaskBody, args: Value, use_rayon: bool) -> Result<Value, ApiError> {
    match body {
        TaskBody::Blocking(f) => {
            let f = f.clone();
            if use_rayon {
                tokio_rayon::spawn(move || f(args)).await
            } else {
                tokio::task::spawn_blocking(move || f(args)).await?
            }
        }
        TaskBody::Cooperative(f) => f(args).await,
    }
}

/// A named operation plus arguments bound at registration.
#[derive(Clone)]
pub struct DispatchTarget {
    name: &'static str,
    body: TaskBody,
    bound: Map<String, Value>,
    source: Option<&'static str>,
}

impl DispatchTarget {
    /// A target running `f` on a blocking thread.
    pub fn blocking<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        Self::new(name, TaskBody::Blocking(Arc::new(f)))
    }

    /// A target running the future returned by `f` on the async runtime.
    pub fn cooperative<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        Self::new(
            name,
            TaskBody::Cooperative(Arc::new(move |args| Box::pin(f(args)) as TaskFuture)),
        )
    }

    fn new(name: &'static str, body: TaskBody) -> Self {
        Self {
            name,
            body,
            bound: Map::new(),
            source: None,
        }
    }

    /// Bind an argument. Call-site arguments of the same name take precedence.
    pub fn bind(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.bound.insert(key.to_string(), value.into());
        self
    }

    /// Attach the source file defining the operation, for code introspection.
    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    pub fn source(&self) -> Option<&'static str> {
        self.source
    }

    /// Merge the bound arguments with call-site `args`.
    ///
    /// `args` is expected to be an object or null; any other value is passed as `args`.
    pub fn arguments(&self, args: Value) -> Value {
        let mut merged = self.bound.clone();
        match args {
            Value::Object(call_site) => merged.extend(call_site),
            Value::Null => {}
            other => {
                merged.insert("args".to_string(), other);
            }
        }
        Value::Object(merged)
    }
}

impl std::fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTarget")
            .field("name", &self.name)
            .field("cooperative", &self.body.is_cooperative())
            .field("bound", &self.bound)
            .finish()
    }
}

/// Execution strategy for a target.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Execute `target` with call-site `args` and return its result.
    async fn call(&self, target: &DispatchTarget, args: Value) -> Result<Value, ApiError>;

    /// Name of the strategy, used as a metric label.
    fn strategy(&self) -> &'static str;
}

/// Run the target in-process.
#[derive(Debug)]
pub struct Direct {
    use_rayon: bool,
}

impl Direct {
    pub fn new(use_rayon: bool) -> Self {
        Self { use_rayon }
    }
}

#[async_trait]
impl Dispatcher for Direct {
    async fn call(&self, target: &DispatchTarget, args: Value) -> Result<Value, ApiError> {
        run_body(target.body(), target.arguments(args), self.use_rayon).await
    }

    fn strategy(&self) -> &'static str {
        "direct"
    }
}

/// Submit the target to the task queue and wait for its result.
///
/// The wait has no deadline and occupies a blocking slot of the [ResourceManager] for its whole
/// duration.
pub struct QueueBlocking {
    queue: Arc<dyn TaskQueue>,
    resources: Arc<ResourceManager>,
}

impl QueueBlocking {
    pub fn new(queue: Arc<dyn TaskQueue>, resources: Arc<ResourceManager>) -> Self {
        Self { queue, resources }
    }
}

#[async_trait]
impl Dispatcher for QueueBlocking {
    async fn call(&self, target: &DispatchTarget, args: Value) -> Result<Value, ApiError> {
        let _slot = self.resources.blocking_slot().await?;
        let handle = self.queue.submit(target.name(), target.arguments(args)).await?;
        self.queue.wait(&handle).await
    }

    fn strategy(&self) -> &'static str {
        "queue_blocking"
    }
}

/// Delays between status checks: doubling from an initial value up to a ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            next: initial.min(ceiling),
            ceiling,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        self.next = (self.next * 2).min(self.ceiling);
        Some(delay)
    }
}

/// Submit the target to the task queue and poll it without blocking the runtime.
///
/// A task still pending when `timeout` expires is revoked and reported as
/// [ApiError::TaskTimeout].
pub struct QueueCooperative {
    queue: Arc<dyn TaskQueue>,
    timeout: Duration,
}

impl QueueCooperative {
    pub fn new(queue: Arc<dyn TaskQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<Value, ApiError> {
        let mut backoff = Backoff::default();
        loop {
            match self.queue.status(handle).await? {
                TaskStatus::Success | TaskStatus::Failure => {
                    return self.queue.take_result(handle).await
                }
                TaskStatus::Pending => {
                    let delay = backoff.next().unwrap_or(MAX_POLL_INTERVAL);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Dispatcher for QueueCooperative {
    async fn call(&self, target: &DispatchTarget, args: Value) -> Result<Value, ApiError> {
        let handle = self.queue.submit(target.name(), target.arguments(args)).await?;
        match tokio::time::timeout(self.timeout, self.poll(&handle)).await {
            Ok(result) => result,
            Err(_) => {
                TASK_TIMEOUTS.inc();
                if let Err(err) = self.queue.revoke(&handle).await {
                    tracing::warn!(task_id = %handle.id, "failed to revoke timed out task: {}", err);
                }
                Err(ApiError::TaskTimeout {
                    task_id: handle.id,
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }

    fn strategy(&self) -> &'static str {
        "queue_cooperative"
    }
}

/// Result of calling a registered operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatched {
    /// The operation finished with this value.
    Ready(Value),
    /// The operation was queued; poll the handle for its result.
    Queued(TaskHandle),
}

/// How a target is meant to be called.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Blocking,
    Cooperative,
    QueueAsAsync,
}

struct Entry {
    target: DispatchTarget,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    queue_as_async: bool,
}

/// Options shared by the dispatchers of a registry.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Ceiling of cooperative waits
    pub task_timeout: Duration,
    /// Run blocking bodies on Rayon
    pub use_rayon: bool,
    pub resources: Arc<ResourceManager>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            task_timeout: DEFAULT_TASK_TIMEOUT,
            use_rayon: false,
            resources: Arc::new(ResourceManager::new(None, None)),
        }
    }
}

/// Registry of every operation of the process, keyed by name.
///
/// Built once at startup and shared read-only afterwards.
pub struct DispatchRegistry {
    role: Role,
    queue: Option<Arc<dyn TaskQueue>>,
    direct: Arc<dyn Dispatcher>,
    blocking: Option<Arc<dyn Dispatcher>>,
    cooperative: Option<Arc<dyn Dispatcher>>,
    entries: HashMap<&'static str, Entry>,
}

impl DispatchRegistry {
    /// Create an empty registry for `role`.
    ///
    /// Roles `server` and `worker` require a task queue; role `all` must not be given one.
    pub fn new(
        role: Role,
        queue: Option<Arc<dyn TaskQueue>>,
        options: DispatchOptions,
    ) -> Result<Self, ConfigError> {
        match (role.uses_queue(), &queue) {
            (true, None) => return Err(ConfigError::MissingTaskQueue(role)),
            (false, Some(_)) => return Err(ConfigError::UnexpectedTaskQueue(role)),
            _ => {}
        }
        let (blocking, cooperative) = match (role, &queue) {
            (Role::Server, Some(queue)) => (
                Some(Arc::new(QueueBlocking::new(queue.clone(), options.resources.clone()))
                    as Arc<dyn Dispatcher>),
                Some(Arc::new(QueueCooperative::new(queue.clone(), options.task_timeout))
                    as Arc<dyn Dispatcher>),
            ),
            _ => (None, None),
        };
        Ok(Self {
            role,
            queue,
            direct: Arc::new(Direct::new(options.use_rayon)),
            blocking,
            cooperative,
            entries: HashMap::new(),
        })
    }

    /// Register a target whose callers wait for its result.
    ///
    /// In role `server` the wait blocks a dispatch slot until the worker is done.
    pub fn register(&mut self, target: DispatchTarget) -> Result<(), ConfigError> {
        self.insert(target, Mode::Blocking)
    }

    /// Register a cooperative target whose callers poll for its result.
    pub fn register_async(&mut self, target: DispatchTarget) -> Result<(), ConfigError> {
        if !target.body().is_cooperative() {
            return Err(ConfigError::NotCooperative(target.name().to_string()));
        }
        self.insert(target, Mode::Cooperative)
    }

    /// Register a target whose callers receive a task handle instead of a result.
    pub fn register_queued(&mut self, target: DispatchTarget) -> Result<(), ConfigError> {
        self.insert(target, Mode::QueueAsAsync)
    }

    fn insert(&mut self, target: DispatchTarget, mode: Mode) -> Result<(), ConfigError> {
        let name = target.name();
        if self.entries.contains_key(name) {
            return Err(ConfigError::DuplicateRegistration(name.to_string()));
        }
        let dispatcher = match (self.role, mode) {
            (Role::All, Mode::QueueAsAsync) => {
                return Err(ConfigError::QueueAsAsyncInAllRole(name.to_string()))
            }
            (Role::All, _) => Some(self.direct.clone()),
            (Role::Server, Mode::Blocking) => self.blocking.clone(),
            (Role::Server, Mode::Cooperative) => self.cooperative.clone(),
            (Role::Server, Mode::QueueAsAsync) | (Role::Worker, _) => None,
        };
        if self.role == Role::Worker {
            tracing::debug!(operation = name, "registered task");
        }
        self.entries.insert(
            name,
            Entry {
                target,
                dispatcher,
                queue_as_async: mode == Mode::QueueAsAsync,
            },
        );
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn queue(&self) -> Option<&Arc<dyn TaskQueue>> {
        self.queue.as_ref()
    }

    pub fn target(&self, name: &str) -> Option<&DispatchTarget> {
        self.entries.get(name).map(|entry| &entry.target)
    }

    /// Names of every registered operation, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Call the operation `name` with `args`.
    pub async fn call(&self, name: &str, args: Value) -> Result<Dispatched, ApiError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ApiError::UnknownOperation(name.to_string()))?;
        if entry.queue_as_async {
            let queue = self.queue.as_ref().ok_or_else(|| ApiError::NotDispatchable {
                operation: name.to_string(),
                role: self.role,
            })?;
            TASKS_DISPATCHED.with_label_values(&["queue_as_async"]).inc();
            let handle = queue
                .submit(entry.target.name(), entry.target.arguments(args))
                .await?;
            return Ok(Dispatched::Queued(handle));
        }
        let dispatcher = entry
            .dispatcher
            .as_ref()
            .ok_or_else(|| ApiError::NotDispatchable {
                operation: name.to_string(),
                role: self.role,
            })?;
        TASKS_DISPATCHED
            .with_label_values(&[dispatcher.strategy()])
            .inc();
        dispatcher
            .call(&entry.target, args)
            .await
            .map(Dispatched::Ready)
    }
}
