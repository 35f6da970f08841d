//! Pipeline Runtime - runs the click aggregation pipeline
//!
//! - Initializes the SQLite database with schema
//! - Connects the cache store (Redis if configured, in-process otherwise)
//! - Starts the accumulation worker, sync scheduler and cleanup sweeper
//! - Stops cleanly on CTRL+C, exits non-zero if a loop crashes
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables: see `PipelineConfig::from_env`.

use clickflow::pipeline::{
    db::run_schema_migrations, CacheStore, ClickPipeline, ClickStore, MemoryCacheStore, PipelineConfig,
    RedisCacheStore, SqliteClickStore,
};
use dotenv::dotenv;
use log::{error, info, warn};
use rusqlite::Connection;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 clickflow pipeline runtime");

    let config = PipelineConfig::from_env();
    config.validate()?;

    info!("   ├─ Database: {}", config.db_path);
    info!(
        "   └─ Cache: {}",
        config.redis_url.as_deref().unwrap_or("in-process (counters lost on exit)")
    );

    // Initialize database
    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn); // Close temporary connection

    let store: Arc<dyn ClickStore> = Arc::new(SqliteClickStore::new(&config.db_path)?);
    info!("✅ Database initialized");

    let cache: Arc<dyn CacheStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCacheStore::connect(url).await?),
        None => {
            warn!("⚠️  CLICKFLOW_REDIS_URL not set, using in-process cache store");
            Arc::new(MemoryCacheStore::new())
        }
    };

    let pipeline = ClickPipeline::start(&config, cache, store)?;
    let crashed = pipeline.crashed();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("🛑 Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
        }
        _ = crashed => {
            error!("💥 A pipeline loop crashed, shutting down...");
        }
    }

    pipeline.stop().await?;

    info!("✅ Pipeline runtime stopped");
    Ok(())
}
