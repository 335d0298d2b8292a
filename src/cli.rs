//! Command Line Interface (CLI) arguments.

use crate::role::Role;

use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{Parser, ValueEnum};
use url::Url;

/// Backing store for the response cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CacheBackend {
    /// Shared redis instance.
    Redis,
    /// Local disk store under the shared storage directory.
    Disk,
    /// No response caching.
    None,
}

/// siibra-api command line interface
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct CommandLineArgs {
    /// The IP address on which the API should listen
    #[arg(long, default_value = "0.0.0.0", env = "SIIBRA_API_HOST")]
    pub host: String,
    /// The port to which the API should bind
    #[arg(long, default_value_t = 5000, env = "SIIBRA_API_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "SIIBRA_API_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/siibra-api/certs/cert.pem",
        env = "SIIBRA_API_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/siibra-api/certs/key.pem",
        env = "SIIBRA_API_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for requests to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "SIIBRA_API_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Role of this process: serve and compute (all), serve and enqueue (server) or consume the
    /// task queue (worker)
    #[arg(long, value_enum, default_value_t = Role::All, env = "SIIBRA_API_ROLE")]
    pub role: Role,
    /// Redis URL of the task queue broker and result backend
    #[arg(long, env = "SIIBRA_API_BROKER_URL")]
    pub broker_url: Option<String>,
    /// Key prefix used for task queue records
    #[arg(long, default_value = "siibra-api", env = "SIIBRA_API_QUEUE_PREFIX")]
    pub queue_prefix: String,
    /// Time in seconds for which finished task results are kept by the result backend
    #[arg(long, default_value_t = 3600, env = "SIIBRA_API_RESULT_TTL")]
    pub result_ttl: u64,
    /// Maximum time in seconds to wait for a queued task before revoking it
    #[arg(long, default_value_t = 600, env = "SIIBRA_API_TASK_TIMEOUT")]
    pub task_timeout: u64,
    /// Backing store of the response cache
    #[arg(long, value_enum, default_value_t = CacheBackend::Redis, env = "SIIBRA_API_CACHE_BACKEND")]
    pub cache_backend: CacheBackend,
    /// Host of the redis response cache
    #[arg(long, default_value = "localhost", env = "SIIBRA_API_CACHE_HOST")]
    pub cache_host: String,
    /// Port of the redis response cache
    #[arg(long, default_value_t = 6379, env = "SIIBRA_API_CACHE_PORT")]
    pub cache_port: u16,
    /// Password of the redis response cache
    #[arg(long, env = "SIIBRA_API_CACHE_PASSWORD")]
    pub cache_password: Option<String>,
    /// Interval in seconds between cache connectivity checks
    #[arg(long, default_value_t = 5, env = "SIIBRA_API_CACHE_HEARTBEAT_INTERVAL")]
    pub cache_heartbeat_interval: u64,
    /// Lifespan in seconds of disk cache entries
    #[arg(long, default_value_t = 86400, env = "SIIBRA_API_DISK_CACHE_AGE")]
    pub disk_cache_age: u64,
    /// Directory holding the atlas catalog and the disk cache
    #[arg(long, default_value = "~/.cache/siibra-api", env = "SIIBRA_API_SHARED_STORAGE")]
    pub shared_storage: String,
    /// Interval in seconds between shared storage disk usage measurements
    #[arg(long, default_value_t = 300, env = "SIIBRA_API_DISK_USAGE_INTERVAL")]
    pub disk_usage_interval: u64,
    /// Directory to which the access log is written in addition to stdout
    #[arg(long, env = "SIIBRA_API_LOG_DIR")]
    pub log_dir: Option<String>,
    /// Time in seconds after which a request is answered with 504
    #[arg(long, default_value_t = 610, env = "SIIBRA_API_REQUEST_TIMEOUT")]
    pub request_timeout: u64,
    /// Maximum number of tasks a worker executes concurrently.
    /// Defaults to the number of CPUs.
    #[arg(long, env = "SIIBRA_API_WORKER_CONCURRENCY")]
    pub worker_concurrency: Option<usize>,
    /// Name under which a worker publishes its heartbeat
    #[arg(long, default_value = "worker", env = "HOSTNAME")]
    pub worker_name: String,
    /// Maximum number of requests allowed to block waiting for a queued task
    #[arg(long, env = "SIIBRA_API_BLOCKING_DISPATCH_LIMIT")]
    pub blocking_dispatch_limit: Option<usize>,
    /// Whether to use Rayon for execution of blocking operations.
    #[arg(long, default_value_t = false, env = "SIIBRA_API_USE_RAYON")]
    pub use_rayon: bool,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "SIIBRA_API_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Running under continuous integration. Disables the response cache.
    #[arg(long, default_value_t = false, env = "CI", value_parser = BoolishValueParser::new())]
    pub ci: bool,
}

impl CommandLineArgs {
    /// URL of the redis response cache, including the password if one is set.
    pub fn cache_url(&self) -> Option<Url> {
        let mut url = Url::parse(&format!("redis://{}:{}", self.cache_host, self.cache_port)).ok()?;
        if let Some(password) = &self.cache_password {
            url.set_password(Some(password)).ok()?;
        }
        Some(url)
    }

    /// Cooperative dispatch timeout.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }

    /// Time after which a request is abandoned.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Returns a URL with any password replaced, suitable for logging.
pub fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut url) => {
            if url.password().is_some() {
                // Only fails for URLs that cannot carry a password.
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
