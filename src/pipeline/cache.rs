//! Cache store contract shared by the worker, scheduler and sweeper
//!
//! The pipeline only needs a handful of key/value primitives with per-key
//! TTL. Atomicity of `increment` and `rename` is what the claim protocol
//! relies on; implementations must provide both atomically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Backend unreachable or returned an error
    Unavailable(String),
    /// Stored value is not an integer counter
    InvalidValue { key: String, value: String },
    /// Rename source does not exist
    NoSuchKey(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Unavailable(e) => write!(f, "Cache unavailable: {}", e),
            CacheError::InvalidValue { key, value } => {
                write!(f, "Cache value for '{}' is not a counter: {}", key, value)
            }
            CacheError::NoSuchKey(k) => write!(f, "No such cache key: {}", k),
        }
    }
}

impl std::error::Error for CacheError {}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a counter, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError>;

    /// Overwrite a counter and attach a TTL
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError>;

    /// Atomically add one, creating the key at 1 (without TTL) if absent
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// List every key starting with `prefix` in a single pass
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Atomically move `from` to `to`, overwriting `to` and keeping the TTL
    async fn rename(&self, from: &str, to: &str) -> Result<(), CacheError>;

    /// Remaining TTL; `None` when the key has no TTL or does not exist
    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process cache store
///
/// Deadlines use the tokio clock so paused-time tests can advance them.
/// Expiry is passive: an expired entry reads as absent (and is dropped by
/// that read) but stays listed by `scan` until something deletes it, which
/// is exactly the gap the cleanup sweeper exists to close.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored keys, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        match entries.get(key).map(|e| (e.value, e.is_expired(now))) {
            Some((_, true)) => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, false)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }

        let current = entry.value;
        entry.value = current.checked_add(1).ok_or_else(|| CacheError::InvalidValue {
            key: key.to_string(),
            value: current.to_string(),
        })?;
        Ok(entry.value)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let entries = self.lock()?;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        match entries.remove(from) {
            Some(entry) if entry.is_expired(now) => Err(CacheError::NoSuchKey(from.to_string())),
            Some(entry) => {
                entries.insert(to.to_string(), entry);
                Ok(())
            }
            None => Err(CacheError::NoSuchKey(from.to_string())),
        }
    }

    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let entries = self.lock()?;
        let now = Instant::now();

        Ok(entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }
}
