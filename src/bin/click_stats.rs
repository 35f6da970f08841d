//! Click stats - query per-minute totals for one banner
//!
//! Usage:
//!   click_stats <banner_id> <from> <to>
//!
//! `from` and `to` are RFC 3339 timestamps, both inclusive. Rows are printed
//! as a JSON array on stdout.

use chrono::{DateTime, Utc};
use clickflow::pipeline::{stats::StatsService, PipelineConfig, SqliteClickStore};
use dotenv::dotenv;
use std::env;
use std::sync::Arc;

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("Invalid timestamp '{}': {}", raw, e))?;
    Ok(parsed.with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!("Usage: {} <banner_id> <from> <to>", args[0]);
        std::process::exit(2);
    }

    let banner_id: i64 = args[1]
        .parse()
        .map_err(|_| format!("Invalid banner ID: {}", args[1]))?;
    let from = parse_timestamp(&args[2])?;
    let to = parse_timestamp(&args[3])?;

    let config = PipelineConfig::from_env();
    let store = Arc::new(SqliteClickStore::new(&config.db_path)?);
    let stats = StatsService::new(store).get_stats(banner_id, from, to).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
