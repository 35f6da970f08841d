//! Stats passthrough to the durable store
//!
//! No aggregation happens here; the only logic is rejecting inverted ranges
//! before the store is touched.

use super::db::{ClickStore, StoreError};
use super::types::{BannerId, ClickStat};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug)]
pub enum StatsError {
    InvalidRange { from: DateTime<Utc>, to: DateTime<Utc> },
    Storage(StoreError),
}

impl From<StoreError> for StatsError {
    fn from(err: StoreError) -> Self {
        StatsError::Storage(err)
    }
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::InvalidRange { from, to } => {
                write!(f, "Start time {} must not be after end time {}", from, to)
            }
            StatsError::Storage(e) => write!(f, "Failed to fetch click stats: {}", e),
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Storage(e) => Some(e),
            StatsError::InvalidRange { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct StatsService {
    store: Arc<dyn ClickStore>,
}

impl StatsService {
    pub fn new(store: Arc<dyn ClickStore>) -> Self {
        Self { store }
    }

    /// Per-minute rows for `banner_id` with `from <= window_start <= to`
    pub async fn get_stats(
        &self,
        banner_id: BannerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ClickStat>, StatsError> {
        if from > to {
            return Err(StatsError::InvalidRange { from, to });
        }

        let stats = self.store.query_range(banner_id, from, to).await?;
        log::debug!("Fetched {} stat rows for banner {} in [{}, {}]", stats.len(), banner_id, from, to);
        Ok(stats)
    }
}
