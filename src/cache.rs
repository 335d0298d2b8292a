//! Response cache.
//!
//! Serialised JSON response bodies are stored gzip-compressed under a key derived from the API
//! version, the request path and its query. The cache never fails a request: when the backing
//! store cannot be reached every lookup misses and every store is dropped.

use crate::cli::{CacheBackend, CommandLineArgs};
use crate::compression::{compress, decompress, looks_like_json};
use crate::timers::RepeatingTimers;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, Method};
use bytes::Bytes;
use cached::stores::{DiskCache, DiskCacheBuilder};
use cached::IOCached;
use expanduser::expanduser;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Media type requesting the source code of an endpoint instead of its data.
pub const SOURCE_CODE_MEDIA_TYPE: &str = "text/x-sapi-python";

/// Request header forcing a cache miss.
pub static BYPASS_HEADER: HeaderName = HeaderName::from_static("x-bypass-fast-api-cache");

/// Response header marking a cache hit.
pub static HIT_HEADER: HeaderName = HeaderName::from_static("x-fastapi-cache");

/// Paths containing any of these are never cached.
pub const PATH_DENY_LIST: [&str; 4] = ["metrics", "openapi.json", "atlas_download", "ready"];

/// Queries containing any of these are never cached.
pub const QUERY_DENY_LIST: [&str; 2] = ["bbox=", "find="];

/// Failure of a cache store. Logged, never returned to clients.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("disk cache error: {0}")]
    Disk(String),

    #[error("cache task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Key-value store holding cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Cache store in a shared redis instance.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Cache store on local disk, with entries expiring after a fixed lifespan.
pub struct DiskStore {
    cache: Arc<DiskCache<String, Vec<u8>>>,
    directory: PathBuf,
}

impl DiskStore {
    /// Open the disk store in `directory`.
    ///
    /// # Arguments
    ///
    /// * `directory`: Directory holding the store, created if missing
    /// * `lifespan`: Time in seconds after which an entry expires
    pub fn open(directory: &Path, lifespan: u64) -> Result<Self, CacheError> {
        let cache = DiskCacheBuilder::new("response_cache")
            .set_disk_directory(directory)
            .set_lifespan(lifespan)
            .build()
            .map_err(|err| CacheError::Disk(err.to_string()))?;
        Ok(Self {
            cache: Arc::new(cache),
            directory: directory.to_path_buf(),
        })
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let cache = self.cache.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.cache_get(&key))
            .await?
            .map_err(|err| CacheError::Disk(err.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let cache = self.cache.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.cache_set(key, value))
            .await?
            .map(|_| ())
            .map_err(|err| CacheError::Disk(err.to_string()))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        if self.directory.is_dir() {
            Ok(())
        } else {
            Err(CacheError::Disk(format!(
                "{} is not a directory",
                self.directory.display()
            )))
        }
    }
}

/// Build the cache key of a request.
///
/// Query parameters are sorted so that their order does not split entries.
pub fn cache_key(version: &str, path: &str, query: Option<&str>) -> String {
    let mut params: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|param| !param.is_empty())
        .collect();
    params.sort_unstable();
    if params.is_empty() {
        format!("[{}] {}", version, path)
    } else {
        format!("[{}] {}?{}", version, path, params.join("&"))
    }
}

/// Whether a request may be served from and stored into the cache.
///
/// Recomputed for every request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheDecision {
    pub bypass_read: bool,
    pub bypass_write: bool,
}

impl CacheDecision {
    pub fn for_request(method: &Method, headers: &HeaderMap, path: &str, query: Option<&str>) -> Self {
        let query = query.unwrap_or_default();
        let uncacheable = method != Method::GET
            || headers.contains_key(header::AUTHORIZATION)
            || headers
                .get(header::ACCEPT)
                .map_or(false, |accept| accept == SOURCE_CODE_MEDIA_TYPE)
            || PATH_DENY_LIST.iter().any(|word| path.contains(word))
            || QUERY_DENY_LIST.iter().any(|word| query.contains(word));
        Self {
            // The bypass header asks for a fresh response, which may still be stored.
            bypass_read: uncacheable || headers.contains_key(&BYPASS_HEADER),
            bypass_write: uncacheable,
        }
    }
}

/// The process-wide response cache.
///
/// `get` and `set` become no-ops when running under CI, when no store is configured, or while
/// the last heartbeat failed.
#[derive(Clone)]
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    connected: Arc<AtomicBool>,
    bypass: bool,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("configured", &self.store.is_some())
            .field("connected", &self.is_connected())
            .field("bypass", &self.bypass)
            .finish()
    }
}

impl ResponseCache {
    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            store: None,
            connected: Arc::new(AtomicBool::new(false)),
            bypass: false,
        }
    }

    /// A cache backed by `store`, assumed reachable until the first heartbeat.
    pub fn with_store(store: Arc<dyn CacheStore>, ci: bool) -> Self {
        Self {
            store: Some(store),
            connected: Arc::new(AtomicBool::new(true)),
            bypass: ci,
        }
    }

    /// Connect to the configured store.
    ///
    /// An unreachable store is logged and leaves the cache disabled.
    pub async fn connect(args: &CommandLineArgs) -> Self {
        let store: Result<Arc<dyn CacheStore>, CacheError> = match args.cache_backend {
            CacheBackend::None => return Self::disabled(),
            CacheBackend::Redis => {
                let Some(url) = args.cache_url() else {
                    tracing::warn!("invalid cache host {}, caching disabled", args.cache_host);
                    return Self::disabled();
                };
                tracing::info!("connecting to response cache at {}", crate::cli::redact(url.as_str()));
                RedisStore::connect(url.as_str())
                    .await
                    .map(|store| Arc::new(store) as Arc<dyn CacheStore>)
            }
            CacheBackend::Disk => {
                let directory = expanduser(&args.shared_storage)
                    .map(|dir| dir.join("response_cache"))
                    .map_err(|err| CacheError::Disk(err.to_string()));
                match directory {
                    Ok(directory) => {
                        tracing::info!("opening disk response cache in {}", directory.display());
                        DiskStore::open(&directory, args.disk_cache_age)
                            .map(|store| Arc::new(store) as Arc<dyn CacheStore>)
                    }
                    Err(err) => Err(err),
                }
            }
        };
        match store {
            Ok(store) => Self::with_store(store, args.ci),
            Err(err) => {
                tracing::warn!("response cache unavailable, caching disabled: {}", err);
                Self::disabled()
            }
        }
    }

    /// Outcome of the last heartbeat.
    pub fn is_connected(&self) -> bool {
        self.store.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn active_store(&self) -> Option<&Arc<dyn CacheStore>> {
        if self.bypass || !self.is_connected() {
            None
        } else {
            self.store.as_ref()
        }
    }

    /// Check the store every `interval` and record whether it answered.
    pub fn start_heartbeat(&self, timers: &mut RepeatingTimers, interval: Duration) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let connected = self.connected.clone();
        timers.spawn("cache_heartbeat", interval, move || {
            let store = store.clone();
            let connected = connected.clone();
            async move {
                let alive = match store.ping().await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::debug!("cache heartbeat failed: {}", err);
                        false
                    }
                };
                if connected.swap(alive, Ordering::Relaxed) != alive {
                    if alive {
                        tracing::info!("response cache reconnected");
                    } else {
                        tracing::warn!("response cache disconnected, caching disabled");
                    }
                }
            }
        });
    }

    /// Look up `key`, returning the uncompressed body.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let store = self.active_store()?;
        let stored = match store.get(key).await {
            Ok(stored) => stored?,
            Err(err) => {
                tracing::warn!("cache lookup failed: {}", err);
                return None;
            }
        };
        match decompress(&stored) {
            Ok(body) => Some(body),
            Err(_) if looks_like_json(&stored) => {
                let body = Bytes::from(stored);
                self.set(key, &body).await;
                Some(body)
            }
            Err(err) => {
                tracing::warn!(key, "discarding unreadable cache entry: {}", err);
                None
            }
        }
    }

    /// Store `value` under `key`.
    pub async fn set(&self, key: &str, value: &[u8]) {
        let Some(store) = self.active_store() else {
            return;
        };
        let compressed = match compress(value) {
            Ok(compressed) => compressed,
            Err(err) => {
                tracing::warn!("failed to compress cache entry: {}", err);
                return;
            }
        };
        if let Err(err) = store.set(key, compressed.to_vec()).await {
            tracing::warn!("cache store failed: {}", err);
        }
    }
}
