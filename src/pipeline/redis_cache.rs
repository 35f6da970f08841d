//! Redis-backed cache store
//!
//! Uses a `ConnectionManager`, which reconnects on its own; every call clones
//! the manager (cheap, shares one multiplexed connection).

use super::cache::{CacheError, CacheStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// SCAN page size hint; the adapter still walks the cursor to completion
const SCAN_COUNT: usize = 500;

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    /// Connect and verify the server answers PING
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        log::info!("✅ Connected to Redis ({})", pong);

        Ok(Self { conn })
    }
}

/// Escape glob metacharacters so the prefix matches literally in SCAN MATCH
fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Map a PTTL reply (-2 missing, -1 persistent) to the adapter contract
fn ttl_from_reply(millis: i64) -> Option<Duration> {
    if millis < 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;

        match raw {
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| CacheError::InvalidValue {
                    key: key.to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // EX 0 is rejected by Redis
        let seconds = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = match_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across pages
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("RENAME")
            .arg(from)
            .arg(to)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().to_lowercase().contains("no such key") => {
                Err(CacheError::NoSuchKey(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn.clone();
        // Millisecond precision so a key with under a second left is not read as expired
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl_from_reply(millis))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
