//! Cleanup sweeper for claimed counters
//!
//! Claimed keys are kept around until their TTL runs out so they can be
//! inspected. Whether a rename keeps the TTL depends on the backend, and a
//! counter re-created by a bare increment after a claim has none, so the
//! sweeper deletes keys whose TTL has elapsed as well as keys with no TTL.

use super::cache::CacheStore;
use super::keys::KeyCodec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
}

pub struct CleanupSweeper {
    cache: Arc<dyn CacheStore>,
    codec: KeyCodec,
}

impl CleanupSweeper {
    pub fn new(cache: Arc<dyn CacheStore>, codec: KeyCodec) -> Self {
        Self { cache, codec }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let keys = match self.cache.scan(&self.codec.claimed_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("❌ Error fetching processed keys from cache: {}", e);
                return report;
            }
        };
        report.scanned = keys.len();

        for key in keys {
            let expired = match self.cache.ttl_of(&key).await {
                Ok(Some(remaining)) => remaining.is_zero(),
                Ok(None) => true,
                Err(e) => {
                    report.failed += 1;
                    log::warn!("⚠️  Could not read TTL of '{}': {}", key, e);
                    continue;
                }
            };

            if !expired {
                report.retained += 1;
                continue;
            }

            match self.cache.delete(&key).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    report.failed += 1;
                    log::warn!("⚠️  Failed to delete processed key '{}': {}", key, e);
                }
            }
        }

        report
    }
}

/// Cleanup sweeper loop, first sweep one interval after start
pub async fn run_cleanup_sweeper(sweeper: CleanupSweeper, period: Duration, cancel: CancellationToken) {
    log::info!("🧹 Starting cleanup sweeper (interval: {}ms)", period.as_millis());

    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = timer.tick() => {
                let report = sweeper.sweep().await;
                log::info!(
                    "🧹 Sweep complete: {} processed keys | {} deleted | {} retained | {} failed",
                    report.scanned,
                    report.deleted,
                    report.retained,
                    report.failed
                );
            }
        }
    }

    log::info!("✅ Cleanup sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::MemoryCacheStore;

    const TTL: Duration = Duration::from_secs(30 * 60);
    const CLAIMED: &str = "processed:banner:1:2024-01-01T00:00:00";

    fn sweeper(cache: Arc<MemoryCacheStore>) -> CleanupSweeper {
        CleanupSweeper::new(cache, KeyCodec::new("banner", "processed"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_key_survives_until_ttl_elapses() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache.set(CLAIMED, 5, TTL).await.unwrap();
        let sweeper = sweeper(cache.clone());

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        let early = sweeper.sweep().await;
        assert_eq!(early.retained, 1);
        assert_eq!(early.deleted, 0);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let late = sweeper.sweep().await;
        assert_eq!(late.deleted, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_key_without_ttl_is_deleted() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache.increment(CLAIMED).await.unwrap();

        let report = sweeper(cache.clone()).sweep().await;

        assert_eq!(report.deleted, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_keys_are_ignored() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache.set("banner:1:2024-01-01T00:00:00", 5, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let report = sweeper(cache.clone()).sweep().await;

        assert_eq!(report.scanned, 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sweeps_on_interval() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache.set(CLAIMED, 5, Duration::from_secs(60)).await.unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_cleanup_sweeper(
            sweeper(cache.clone()),
            Duration::from_secs(300),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
