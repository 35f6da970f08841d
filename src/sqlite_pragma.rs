//! Shared SQLite PRAGMA setup for every connection the crate opens

use rusqlite::Connection;

/// Apply the PRAGMAs used for all click store connections
///
/// - WAL journal so readers (click_stats) never block the flush writer
/// - NORMAL synchronous (safe with WAL)
/// - in-memory temp store, 64MB page cache, 256MB mmap
/// - checkpoint every 1000 pages
/// - busy timeout so concurrent flushes wait instead of failing with SQLITE_BUSY
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}
