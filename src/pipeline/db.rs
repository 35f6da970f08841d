//! Durable click store
//!
//! The scheduler is the only writer; the stats passthrough is the only reader.
//! Table written (see `/sql/01_click_stats.sql`):
//! - `click_stats` - UPSERT on (banner_id, window_start), count accumulates

use super::types::{BannerId, ClickStat};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    LockPoisoned,
    InvalidTimestamp(i64),
    Schema(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::LockPoisoned => write!(f, "Database connection lock poisoned"),
            StoreError::InvalidTimestamp(ts) => write!(f, "Stored window_start {} is out of range", ts),
            StoreError::Schema(e) => write!(f, "Schema error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            _ => None,
        }
    }
}

/// Durable store contract
#[async_trait]
pub trait ClickStore: Send + Sync {
    /// Add `delta` clicks to (banner, window)
    ///
    /// Operation: UPSERT (INSERT ... ON CONFLICT DO UPDATE SET count = count + delta)
    /// - If the row exists: count grows by delta, never overwritten
    /// - If it doesn't: row is created with count = delta
    async fn upsert_increment(
        &self,
        banner_id: BannerId,
        window_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<(), StoreError>;

    /// Rows for one banner with `from <= window_start <= to`, ordered by window
    ///
    /// Range validation is the caller's job.
    async fn query_range(
        &self,
        banner_id: BannerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ClickStat>, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in filename order and executes them.
/// Every file must be idempotent ("IF NOT EXISTS").
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Schema(format!("Schema directory not found: {}", schema_dir)));
    }

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)
        .map_err(|e| StoreError::Schema(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path).map_err(|e| StoreError::Schema(e.to_string()))?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// SQLite implementation of ClickStore
pub struct SqliteClickStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClickStore {
    /// Open a click store
    ///
    /// Does NOT create the schema; run [`run_schema_migrations`] first.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn to_stat(banner_id: BannerId, window_secs: i64, count: i64) -> Result<ClickStat, StoreError> {
        let window_start =
            DateTime::from_timestamp(window_secs, 0).ok_or(StoreError::InvalidTimestamp(window_secs))?;
        Ok(ClickStat {
            banner_id,
            window_start,
            count,
        })
    }
}

#[async_trait]
impl ClickStore for SqliteClickStore {
    async fn upsert_increment(
        &self,
        banner_id: BannerId,
        window_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute(
            r#"
            INSERT INTO click_stats (banner_id, window_start, count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(banner_id, window_start) DO UPDATE SET
                count = click_stats.count + excluded.count,
                updated_at = excluded.updated_at
            "#,
            params![banner_id, window_start.timestamp(), delta, Utc::now().timestamp()],
        )?;

        Ok(())
    }

    async fn query_range(
        &self,
        banner_id: BannerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ClickStat>, StoreError> {
        let rows: Vec<(i64, i64)> = {
            let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            let mut stmt = conn.prepare(
                "SELECT window_start, count FROM click_stats
                 WHERE banner_id = ?1 AND window_start BETWEEN ?2 AND ?3
                 ORDER BY window_start ASC",
            )?;
            let iter = stmt.query_map(params![banner_id, from.timestamp(), to.timestamp()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let rows = iter.collect::<Result<Vec<_>, rusqlite::Error>>()?;
            rows
        };

        rows.into_iter()
            .map(|(window, count)| Self::to_stat(banner_id, window, count))
            .collect()
    }
}
