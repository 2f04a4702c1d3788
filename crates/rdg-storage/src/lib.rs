//! Snapshot cache, endpoint config persistence and retry/limit utilities.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdg_core::env::{env_opt, env_or, env_parse};
use rdg_core::{CacheError, CachePolicy, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod config_store;
pub mod file;
pub mod memory;
pub mod redis_backend;
pub mod retry;

pub use config_store::ConfigStore;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use retry::{retry_transient, BackoffPolicy, ConnectionLimiter, LimiterError};

pub const CRATE_NAME: &str = "rdg-storage";

/// Scope segment of every snapshot key; snapshots always hold the full dataset.
pub const FULL_SCOPE: &str = "all";
const META_SUFFIX: &str = "meta";

/// Whole-value key/value storage underneath the snapshot store.
///
/// Values are only ever replaced wholesale, so readers see either the old or
/// the new value for a key.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Logical key of one report's full snapshot for one info type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey<'a> {
    pub report: &'a str,
    pub info_type: &'a str,
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.report, FULL_SCOPE, self.info_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoTypeMeta {
    pub rows: usize,
    pub columns: Vec<String>,
    pub cache_key: String,
}

/// Outcome of the most recent refresh that wrote at least one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub report: String,
    pub refreshed_at: DateTime<Utc>,
    pub info_types: BTreeMap<String, InfoTypeMeta>,
    pub cache_policy: CachePolicy,
    pub partial: bool,
    /// Source-side refresh time seen in the data, used to detect changes.
    #[serde(default)]
    pub data_refresh_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    File,
    Redis,
}

impl CacheBackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "file" | "fs" | "filesystem" => Some(Self::File),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub cache_dir: PathBuf,
    pub redis_url: String,
    pub key_prefix: String,
    /// Applied to snapshot entries; `None` keeps them until the next refresh.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            cache_dir: PathBuf::from("./cache"),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: String::new(),
            ttl: None,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw_backend = env_or("RDG_CACHE_BACKEND", "memory");
        let backend = CacheBackendKind::parse(&raw_backend)
            .with_context(|| format!("unknown RDG_CACHE_BACKEND '{raw_backend}'"))?;
        let ttl_secs: u64 = env_parse("RDG_CACHE_TTL_SECS", 0);
        Ok(Self {
            backend,
            cache_dir: PathBuf::from(env_or("RDG_CACHE_DIR", "./cache")),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379/0"),
            key_prefix: env_opt("RDG_CACHE_KEY_PREFIX").unwrap_or_default(),
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        })
    }
}

/// Typed access to snapshots and refresh metadata on top of a [`CacheBackend`].
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    backend: Arc<dyn CacheBackend>,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn CacheBackend>, key_prefix: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), "", None)
    }

    pub async fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryBackend::new()),
            CacheBackendKind::File => Arc::new(FileBackend::new(&config.cache_dir)),
            CacheBackendKind::Redis => Arc::new(
                RedisBackend::connect(&config.redis_url)
                    .await
                    .with_context(|| format!("connecting to redis at {}", config.redis_url))?,
            ),
        };
        info!(backend = backend.name(), "snapshot cache ready");
        Ok(Self::new(backend, config.key_prefix.clone(), config.ttl))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn snapshot_key(&self, report: &str, info_type: &str) -> String {
        format!("{}{}", self.key_prefix, CacheKey { report, info_type })
    }

    pub fn meta_key(&self, report: &str) -> String {
        format!("{}{report}:{META_SUFFIX}", self.key_prefix)
    }

    pub async fn get_snapshot(&self, report: &str, info_type: &str) -> Result<Option<Snapshot>, CacheError> {
        let key = self.snapshot_key(report, info_type);
        match self.backend.get(&key).await? {
            Some(raw) => {
                let snapshot: Snapshot = serde_json::from_str(&raw)?;
                debug!(cache_key = %key, rows = snapshot.table.len(), "snapshot read");
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Replaces the snapshot wholesale and returns the key it was written under.
    pub async fn put_snapshot(&self, report: &str, info_type: &str, snapshot: &Snapshot) -> Result<String, CacheError> {
        let key = self.snapshot_key(report, info_type);
        let raw = serde_json::to_string(snapshot)?;
        self.backend.set(&key, raw, self.ttl).await?;
        Ok(key)
    }

    pub async fn get_meta(&self, report: &str) -> Result<Option<CacheMeta>, CacheError> {
        let key = self.meta_key(report);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                warn!(cache_key = %key, error = %err, "discarding unreadable cache metadata");
                Ok(None)
            }
        }
    }

    pub async fn put_meta(&self, meta: &CacheMeta) -> Result<(), CacheError> {
        let raw = serde_json::to_string(meta)?;
        self.backend.set(&self.meta_key(&meta.report), raw, None).await
    }

    /// Drops every snapshot and the metadata of a report. Returns how many keys went away.
    pub async fn purge(&self, report: &str) -> Result<usize, CacheError> {
        let prefix = format!("{}{report}:", self.key_prefix);
        let mut removed = 0;
        for key in self.backend.keys_with_prefix(&prefix).await? {
            if self.backend.delete(&key).await? {
                removed += 1;
            }
        }
        info!(report, removed, "purged report cache");
        Ok(removed)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
