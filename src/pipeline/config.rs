//! Pipeline configuration from environment variables

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the click pipeline
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the .sql schema files
    pub schema_dir: String,

    /// Redis URL for the cache store (None = in-process store)
    pub redis_url: Option<String>,

    /// Pending events the ingestion queue holds before dropping
    pub queue_capacity: usize,

    /// TTL attached to a counter when it is first created
    pub counter_ttl: Duration,

    /// Sync tick period
    pub sync_interval: Duration,

    /// Cleanup sweep period
    pub cleanup_interval: Duration,

    /// Max concurrent durable upserts per tick
    pub flush_concurrency: usize,

    pub live_namespace: String,
    pub processed_namespace: String,

    /// Run one last sync tick inside `stop()`
    pub final_sync_on_stop: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "clickflow.db".to_string(),
            schema_dir: "sql".to_string(),
            redis_url: None,
            queue_capacity: 1_000,
            counter_ttl: Duration::from_secs(30 * 60),
            sync_interval: Duration::from_secs(2 * 60),
            cleanup_interval: Duration::from_secs(30 * 60),
            flush_concurrency: 16,
            live_namespace: "banner".to_string(),
            processed_namespace: "processed".to_string(),
            final_sync_on_stop: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CLICKFLOW_DB_PATH` (default: clickflow.db)
    /// - `CLICKFLOW_SCHEMA_DIR` (default: sql)
    /// - `CLICKFLOW_REDIS_URL` (default: unset, in-process cache)
    /// - `CLICK_QUEUE_CAPACITY` (default: 1000)
    /// - `COUNTER_TTL_SECS` (default: 1800)
    /// - `SYNC_INTERVAL_MS` (default: 120000)
    /// - `CLEANUP_INTERVAL_MS` (default: 1800000)
    /// - `FLUSH_CONCURRENCY` (default: 16)
    /// - `LIVE_NAMESPACE` (default: banner)
    /// - `PROCESSED_NAMESPACE` (default: processed)
    /// - `FINAL_SYNC_ON_STOP` (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            db_path: lookup("CLICKFLOW_DB_PATH").unwrap_or(defaults.db_path),
            schema_dir: lookup("CLICKFLOW_SCHEMA_DIR").unwrap_or(defaults.schema_dir),
            redis_url: lookup("CLICKFLOW_REDIS_URL").filter(|s| !s.trim().is_empty()),
            queue_capacity: parsed("CLICK_QUEUE_CAPACITY")
                .map(|v| v as usize)
                .unwrap_or(defaults.queue_capacity),
            counter_ttl: parsed("COUNTER_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.counter_ttl),
            sync_interval: parsed("SYNC_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_interval),
            cleanup_interval: parsed("CLEANUP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.cleanup_interval),
            flush_concurrency: parsed("FLUSH_CONCURRENCY")
                .map(|v| v as usize)
                .unwrap_or(defaults.flush_concurrency),
            live_namespace: lookup("LIVE_NAMESPACE").unwrap_or(defaults.live_namespace),
            processed_namespace: lookup("PROCESSED_NAMESPACE").unwrap_or(defaults.processed_namespace),
            final_sync_on_stop: lookup("FINAL_SYNC_ON_STOP")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.final_sync_on_stop),
        }
    }

    /// Reject settings the pipeline cannot run with
    ///
    /// A counter TTL that does not exceed the sync interval is allowed but
    /// logged: hot counters can then expire before they are ever claimed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError("CLICK_QUEUE_CAPACITY must be > 0".to_string()));
        }
        if self.flush_concurrency == 0 {
            return Err(ConfigError("FLUSH_CONCURRENCY must be > 0".to_string()));
        }
        if self.sync_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(ConfigError("sync and cleanup intervals must be > 0".to_string()));
        }
        if self.counter_ttl.is_zero() {
            return Err(ConfigError("COUNTER_TTL_SECS must be > 0".to_string()));
        }
        for ns in [&self.live_namespace, &self.processed_namespace] {
            if ns.is_empty() || ns.contains(':') {
                return Err(ConfigError(format!("namespace '{}' must be non-empty and contain no ':'", ns)));
            }
        }
        if self.live_namespace == self.processed_namespace {
            return Err(ConfigError("live and processed namespaces must differ".to_string()));
        }

        if self.counter_ttl <= self.sync_interval {
            log::warn!(
                "⚠️  Counter TTL ({}s) does not exceed sync interval ({}s): counters may expire before they are claimed",
                self.counter_ttl.as_secs(),
                self.sync_interval.as_secs()
            );
        }

        Ok(())
    }
}
