//! Click load - drive the pipeline at a fixed rate and report admission
//!
//! Runs the full pipeline in-process against the configured stores and
//! submits clicks for random banners at `LOAD_RATE` clicks/sec for
//! `LOAD_DURATION_SECS` seconds.
//!
//! Environment variables (in addition to `PipelineConfig::from_env`):
//!   LOAD_RATE           - clicks per second (default: 1000)
//!   LOAD_DURATION_SECS  - run time (default: 60)
//!   LOAD_BANNERS        - banner ids drawn from 1..=N (default: 10)

use clickflow::pipeline::{
    db::run_schema_migrations, types::current_window, CacheStore, ClickPipeline, ClickStore, MemoryCacheStore,
    PipelineConfig, PipelineError, RedisCacheStore, SqliteClickStore,
};
use dotenv::dotenv;
use rand::Rng;
use rusqlite::Connection;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Gap between submits; never zero, `interval` rejects that
fn submit_period(rate: u64) -> Duration {
    Duration::from_nanos((1_000_000_000 / rate.max(1)).max(1))
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / count as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let rate = env_u64("LOAD_RATE", 1_000).max(1);
    let duration = Duration::from_secs(env_u64("LOAD_DURATION_SECS", 60));
    let banners = env_u64("LOAD_BANNERS", 10).max(1) as i64;

    let config = PipelineConfig::from_env();
    config.validate()?;

    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store: Arc<dyn ClickStore> = Arc::new(SqliteClickStore::new(&config.db_path)?);
    let cache: Arc<dyn CacheStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCacheStore::connect(url).await?),
        None => Arc::new(MemoryCacheStore::new()),
    };

    let pipeline = ClickPipeline::start(&config, cache, store)?;

    log::info!("🔥 Load: {} clicks/sec for {}s across {} banners", rate, duration.as_secs(), banners);

    let mut ticker = tokio::time::interval(submit_period(rate));
    let started = Instant::now();
    let mut accepted = 0u64;
    let mut dropped = 0u64;
    let mut max_submit = Duration::ZERO;
    let mut total_submit = Duration::ZERO;

    while started.elapsed() < duration {
        ticker.tick().await;

        let banner_id = rand::thread_rng().gen_range(1..=banners);
        let submit_start = Instant::now();
        let result = pipeline.submit_click(banner_id, current_window());
        let took = submit_start.elapsed();

        total_submit += took;
        max_submit = max_submit.max(took);

        match result {
            Ok(()) => accepted += 1,
            Err(PipelineError::QueueFull { .. }) => dropped += 1,
            Err(e) => {
                log::error!("❌ Pipeline rejected clicks: {}", e);
                break;
            }
        }
    }

    let requests = accepted + dropped;
    println!("Requests: {}", requests);
    println!("Accepted: {}", accepted);
    println!("Dropped (queue full): {}", dropped);
    if requests > 0 {
        println!("Success rate: {:.2}%", accepted as f64 * 100.0 / requests as f64);
        println!("Submit latency:");
        println!("  Average: {:?}", average(total_submit, requests));
        println!("  Max: {:?}", max_submit);
    }

    pipeline.stop().await?;
    Ok(())
}
