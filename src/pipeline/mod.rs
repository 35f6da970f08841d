//! # Write-behind click aggregation pipeline
//!
//! Clicks are counted per banner per minute without ever blocking the
//! caller, and the counts end up in SQLite eventually.
//!
//! ## Flow
//!
//! 1. `submit_click` pushes into a bounded queue (drops with `QueueFull`)
//! 2. The accumulation worker turns each click into a cache counter
//!    `banner:<id>:<minute>` (created with a TTL, then incremented)
//! 3. Every sync interval the scheduler scans live counters, claims each one
//!    by renaming it to `processed:banner:...`, sums the claimed counts per
//!    (banner, minute) and upserts the totals into `click_stats`
//! 4. Every cleanup interval the sweeper deletes claimed keys whose TTL ran out
//!
//! Delivery is at-most-once: failed flushes and unclaimable keys are logged,
//! never retried out of band. One scheduler per cache is assumed.
//!
//! ## Module Organization
//!
//! - `types` - ClickEvent, ClickStat, minute truncation
//! - `keys` - counter key codec
//! - `cache` - cache store trait + in-process store
//! - `redis_cache` - Redis cache store
//! - `db` - durable store trait + SQLite store
//! - `ingestion` - admission queue + accumulation worker
//! - `scheduler` - sync tick and loop
//! - `cleanup` - processed-key sweeper
//! - `stats` - range-validated stats passthrough
//! - `engine` - lifecycle: start, submit, stop
//! - `config` - environment configuration

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod engine;
pub mod ingestion;
pub mod keys;
pub mod redis_cache;
pub mod scheduler;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheError, CacheStore, MemoryCacheStore};
pub use config::PipelineConfig;
pub use db::{ClickStore, SqliteClickStore, StoreError};
pub use engine::{ClickPipeline, PipelineError};
pub use redis_cache::RedisCacheStore;
pub use scheduler::SyncReport;
pub use stats::StatsError;
pub use types::{BannerId, ClickEvent, ClickStat};
