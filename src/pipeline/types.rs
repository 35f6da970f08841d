//! Core data types flowing through the click pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Banner identifier as used in cache keys and the click_stats table
pub type BannerId = i64;

/// A single click admitted through the ingestion queue
///
/// `window_start` is always truncated to the minute; use [`ClickEvent::new`]
/// so callers cannot hand in a sub-minute timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickEvent {
    pub banner_id: BannerId,
    pub window_start: DateTime<Utc>,
}

impl ClickEvent {
    pub fn new(banner_id: BannerId, at: DateTime<Utc>) -> Self {
        Self {
            banner_id,
            window_start: truncate_to_minute(at),
        }
    }
}

/// Persisted per-minute total for one banner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickStat {
    pub banner_id: BannerId,
    pub window_start: DateTime<Utc>,
    pub count: i64,
}

/// Truncate a timestamp to the start of its minute (UTC)
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    let floored = secs - secs.rem_euclid(60);
    // floored is always a representable whole-second instant at or before `at`
    Utc.timestamp_opt(floored, 0).single().unwrap_or(at)
}

/// Current minute window
pub fn current_window() -> DateTime<Utc> {
    truncate_to_minute(Utc::now())
}
