//! Sync scheduler - moves accumulated counters into the durable store
//!
//! One tick:
//! 1. scan the live namespace
//! 2. decode each key and read its count
//! 3. claim it by renaming into the processed namespace, then re-read the
//!    claimed value (it can only have grown since step 2)
//! 4. sum claimed counts per (banner, window) and upsert the totals with
//!    bounded fan-out, joined before the tick returns
//!
//! The rename is the only coordination primitive. Keys that fail to decode,
//! read or rename are left alone and retried on the next tick; only claimed
//! keys contribute to a flush, so a counter is never summed twice. A single
//! scheduler per cache is assumed.

use super::cache::CacheStore;
use super::db::ClickStore;
use super::keys::{CounterKey, KeyCodec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Counts collected for one (banner, window) during a tick
pub type AggregateGroups = BTreeMap<CounterKey, Vec<i64>>;

/// Outcome of one sync tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub scanned: usize,
    pub claimed: usize,
    pub parse_errors: usize,
    pub read_failures: usize,
    pub claim_failures: usize,
    pub groups_flushed: usize,
    pub groups_failed: usize,
    pub clicks_flushed: i64,
}

pub struct SyncScheduler {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ClickStore>,
    codec: KeyCodec,
    flush_permits: Arc<Semaphore>,
    /// Serialises ticks from the timer loop and `sync_now` callers
    tick_lock: Mutex<()>,
}

impl SyncScheduler {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ClickStore>,
        codec: KeyCodec,
        flush_concurrency: usize,
    ) -> Self {
        Self {
            cache,
            store,
            codec,
            flush_permits: Arc::new(Semaphore::new(flush_concurrency.max(1))),
            tick_lock: Mutex::new(()),
        }
    }

    /// Run one full tick; waits for an in-progress tick to finish first
    pub async fn run_tick(&self) -> SyncReport {
        let _guard = self.tick_lock.lock().await;
        let mut report = SyncReport::default();

        let keys = match self.cache.scan(self.codec.live_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("❌ Error fetching counter keys from cache: {}", e);
                return report;
            }
        };
        report.scanned = keys.len();

        let groups = self.claim_and_group(&keys, &mut report).await;
        self.flush(groups, &mut report).await;

        report
    }

    /// Decode, read and claim every live key; group the claimed counts
    pub async fn claim_and_group(&self, keys: &[String], report: &mut SyncReport) -> AggregateGroups {
        let mut groups = AggregateGroups::new();

        for key in keys {
            if self.codec.is_claimed(key) {
                continue;
            }

            let counter = match self.codec.decode(key) {
                Ok(counter) => counter,
                Err(e) => {
                    report.parse_errors += 1;
                    log::warn!("⚠️  Skipping key: {}", e);
                    continue;
                }
            };

            let observed = match self.cache.get(key).await {
                Ok(Some(count)) => count,
                Ok(None) => {
                    report.read_failures += 1;
                    log::debug!("Key '{}' vanished before it could be read", key);
                    continue;
                }
                Err(e) => {
                    report.read_failures += 1;
                    log::warn!("⚠️  Error fetching count for key '{}': {}", key, e);
                    continue;
                }
            };

            let claimed_key = self.codec.claimed(key);
            if let Err(e) = self.cache.rename(key, &claimed_key).await {
                report.claim_failures += 1;
                log::warn!("⚠️  Failed to rename key '{}' to '{}': {}", key, claimed_key, e);
                continue;
            }
            report.claimed += 1;

            // Increments that landed between the read and the rename live on
            // the claimed key; nothing writes to it any more.
            let count = match self.cache.get(&claimed_key).await {
                Ok(Some(settled)) => settled.max(observed),
                Ok(None) => observed,
                Err(e) => {
                    log::debug!("Re-read of '{}' failed, using observed count: {}", claimed_key, e);
                    observed
                }
            };

            groups.entry(counter).or_default().push(count);
        }

        groups
    }

    /// Upsert every group's total concurrently, bounded by the flush permits
    async fn flush(&self, groups: AggregateGroups, report: &mut SyncReport) {
        let mut tasks = JoinSet::new();

        for (counter, counts) in groups {
            let total: i64 = counts.iter().sum();
            if total == 0 {
                continue;
            }

            let store = self.store.clone();
            let permits = self.flush_permits.clone();

            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let result = store
                    .upsert_increment(counter.banner_id, counter.window_start, total)
                    .await;
                (counter, counts.len(), total, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((counter, parts, total, Ok(()))) => {
                    report.groups_flushed += 1;
                    report.clicks_flushed += total;
                    log::debug!(
                        "Synced {} clicks ({} counters) for banner {} at {}",
                        total,
                        parts,
                        counter.banner_id,
                        counter.window_start
                    );
                }
                Ok((counter, _, total, Err(e))) => {
                    report.groups_failed += 1;
                    log::error!(
                        "❌ Failed to sync {} clicks for banner {} at {}: {}",
                        total,
                        counter.banner_id,
                        counter.window_start,
                        e
                    );
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    report.groups_failed += 1;
                    log::error!("❌ Flush task aborted: {}", e);
                }
            }
        }
    }
}

/// Sync scheduler loop
///
/// First tick fires one full interval after start. A tick in progress is
/// always allowed to finish; cancellation is only observed between ticks.
pub async fn run_sync_scheduler(scheduler: Arc<SyncScheduler>, period: Duration, cancel: CancellationToken) {
    log::info!("⏰ Starting sync scheduler (interval: {}ms)", period.as_millis());

    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = timer.tick() => {
                let tick_start = std::time::Instant::now();
                let report = scheduler.run_tick().await;

                if report.scanned > 0 {
                    log::info!(
                        "📊 Sync complete: {} keys | {} claimed | {} groups ({} clicks) | {} failed | {}ms",
                        report.scanned,
                        report.claimed,
                        report.groups_flushed,
                        report.clicks_flushed,
                        report.groups_failed,
                        tick_start.elapsed().as_millis()
                    );
                }
            }
        }
    }

    log::info!("✅ Sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::{CacheError, MemoryCacheStore};
    use crate::pipeline::db::StoreError;
    use crate::pipeline::types::{BannerId, ClickStat};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    type EventLog = Arc<StdMutex<Vec<&'static str>>>;

    /// Durable store double recording every upsert
    #[derive(Default)]
    struct RecordingStore {
        upserts: StdMutex<Vec<(BannerId, DateTime<Utc>, i64)>>,
        fail_banner: Option<BannerId>,
    }

    impl RecordingStore {
        fn totals(&self) -> Vec<(BannerId, DateTime<Utc>, i64)> {
            let mut upserts = self.upserts.lock().unwrap().clone();
            upserts.sort();
            upserts
        }
    }

    #[async_trait]
    impl ClickStore for RecordingStore {
        async fn upsert_increment(
            &self,
            banner_id: BannerId,
            window_start: DateTime<Utc>,
            delta: i64,
        ) -> Result<(), StoreError> {
            if self.fail_banner == Some(banner_id) {
                return Err(StoreError::LockPoisoned);
            }
            self.upserts.lock().unwrap().push((banner_id, window_start, delta));
            Ok(())
        }

        async fn query_range(
            &self,
            _banner_id: BannerId,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<ClickStat>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Cache wrapper whose renames always fail
    struct NoRenameCache(MemoryCacheStore);

    #[async_trait]
    impl CacheStore for NoRenameCache {
        async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
            self.0.set(key, value, ttl).await
        }
        async fn increment(&self, key: &str) -> Result<i64, CacheError> {
            self.0.increment(key).await
        }
        async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
            self.0.scan(prefix).await
        }
        async fn rename(&self, _from: &str, _to: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("rename disabled".to_string()))
        }
        async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, CacheError> {
            self.0.ttl_of(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.0.delete(key).await
        }
    }

    /// Durable store double whose upserts take `delay` and track overlap
    #[derive(Default)]
    struct SlowStore {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        flushed: AtomicUsize,
        events: Option<EventLog>,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ClickStore for SlowStore {
        async fn upsert_increment(
            &self,
            _banner_id: BannerId,
            _window_start: DateTime<Utc>,
            _delta: i64,
        ) -> Result<(), StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.flushed.fetch_add(1, Ordering::SeqCst);
            if let Some(events) = &self.events {
                events.lock().unwrap().push("flush");
            }
            Ok(())
        }

        async fn query_range(
            &self,
            _banner_id: BannerId,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<ClickStat>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Cache wrapper logging every scan into a shared event log
    struct ScanLoggingCache {
        inner: MemoryCacheStore,
        events: EventLog,
    }

    #[async_trait]
    impl CacheStore for ScanLoggingCache {
        async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn increment(&self, key: &str) -> Result<i64, CacheError> {
            self.inner.increment(key).await
        }
        async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
            self.events.lock().unwrap().push("scan");
            self.inner.scan(prefix).await
        }
        async fn rename(&self, from: &str, to: &str) -> Result<(), CacheError> {
            self.inner.rename(from, to).await
        }
        async fn ttl_of(&self, key: &str) -> Result<Option<Duration>, CacheError> {
            self.inner.ttl_of(key).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
    }

    const TTL: Duration = Duration::from_secs(1800);

    fn window() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn codec() -> KeyCodec {
        KeyCodec::new("banner", "processed")
    }

    fn scheduler(cache: Arc<dyn CacheStore>, store: Arc<dyn ClickStore>) -> SyncScheduler {
        SyncScheduler::new(cache, store, codec(), 4)
    }

    #[tokio::test]
    async fn test_tick_flushes_and_claims() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let key = codec().encode(1, window());
        cache.set(&key, 5, TTL).await.unwrap();

        let report = scheduler(cache.clone(), store.clone()).run_tick().await;

        assert_eq!(report.claimed, 1);
        assert_eq!(report.groups_flushed, 1);
        assert_eq!(report.clicks_flushed, 5);
        assert_eq!(store.totals(), vec![(1, window(), 5)]);
        assert!(cache.scan("banner:").await.unwrap().is_empty());
        assert_eq!(cache.get(&codec().claimed(&key)).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_claimed_counter_is_never_summed_again() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let sched = scheduler(cache.clone(), store.clone());
        cache.set(&codec().encode(1, window()), 5, TTL).await.unwrap();

        sched.run_tick().await;
        let second = sched.run_tick().await;

        assert_eq!(second.scanned, 0);
        assert_eq!(store.totals(), vec![(1, window(), 5)]);
    }

    #[tokio::test]
    async fn test_counts_mapping_to_same_window_are_summed() {
        // Two raw keys that decode to the same (banner 7, T) window, as a
        // racing writer with a non-canonical encoding could leave behind.
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let sched = scheduler(cache.clone(), store.clone());

        let keys = vec![
            "banner:7:2024-01-01T00:00:00".to_string(),
            "banner:07:2024-01-01T00:00:00".to_string(),
        ];
        cache.set(&keys[0], 3, TTL).await.unwrap();
        cache.set(&keys[1], 4, TTL).await.unwrap();

        let mut report = SyncReport::default();
        let groups = sched.claim_and_group(&keys, &mut report).await;
        let counter = CounterKey { banner_id: 7, window_start: window() };
        assert_eq!(groups.get(&counter).map(|c| c.len()), Some(2));

        sched.flush(groups, &mut report).await;
        assert_eq!(store.totals(), vec![(7, window(), 7)]);
    }

    #[tokio::test]
    async fn test_malformed_key_is_skipped_and_left_in_place() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        cache.set("banner:oops:2024-01-01T00:00:00", 2, TTL).await.unwrap();
        cache.set(&codec().encode(2, window()), 1, TTL).await.unwrap();

        let report = scheduler(cache.clone(), store.clone()).run_tick().await;

        assert_eq!(report.parse_errors, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(store.totals(), vec![(2, window(), 1)]);
        assert_eq!(
            cache.scan("banner:").await.unwrap(),
            vec!["banner:oops:2024-01-01T00:00:00".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rename_failure_excludes_key_from_flush() {
        let cache: Arc<dyn CacheStore> = Arc::new(NoRenameCache(MemoryCacheStore::new()));
        let store = Arc::new(RecordingStore::default());
        let key = codec().encode(1, window());
        cache.set(&key, 5, TTL).await.unwrap();

        let report = scheduler(cache.clone(), store.clone()).run_tick().await;

        assert_eq!(report.claim_failures, 1);
        assert_eq!(report.groups_flushed, 0);
        assert!(store.totals().is_empty());
        // still live, a later tick can pick it up
        assert_eq!(cache.get(&key).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_failed_group_does_not_block_others() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore {
            fail_banner: Some(1),
            ..Default::default()
        });
        cache.set(&codec().encode(1, window()), 5, TTL).await.unwrap();
        cache.set(&codec().encode(2, window()), 6, TTL).await.unwrap();
        cache.set(&codec().encode(3, window()), 7, TTL).await.unwrap();

        let report = scheduler(cache.clone(), store.clone()).run_tick().await;

        assert_eq!(report.groups_failed, 1);
        assert_eq!(report.groups_flushed, 2);
        assert_eq!(store.totals(), vec![(2, window(), 6), (3, window(), 7)]);
    }

    #[tokio::test]
    async fn test_fresh_counter_after_claim_is_flushed_next_tick() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let sched = scheduler(cache.clone(), store.clone());
        let key = codec().encode(1, window());

        cache.set(&key, 5, TTL).await.unwrap();
        sched.run_tick().await;
        cache.set(&key, 2, TTL).await.unwrap();
        sched.run_tick().await;

        assert_eq!(store.totals(), vec![(1, window(), 2), (1, window(), 5)]);
    }

    #[tokio::test]
    async fn test_vanished_key_is_counted_as_read_failure() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let sched = scheduler(cache.clone(), store.clone());

        let mut report = SyncReport::default();
        let groups = sched
            .claim_and_group(&[codec().encode(9, window())], &mut report)
            .await;

        assert!(groups.is_empty());
        assert_eq!(report.read_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_on_interval_and_stops_on_cancel() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(RecordingStore::default());
        let sched = Arc::new(scheduler(cache.clone(), store.clone()));
        let cancel = CancellationToken::new();
        cache.set(&codec().encode(1, window()), 3, TTL).await.unwrap();

        let handle = tokio::spawn(run_sync_scheduler(sched, Duration::from_secs(120), cancel.clone()));

        // No tick before the first interval elapses
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.totals().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.totals(), vec![(1, window(), 3)]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_fan_out_is_bounded() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(SlowStore::new(Duration::from_millis(20)));
        for banner_id in 0..40 {
            cache.set(&codec().encode(banner_id, window()), 1, TTL).await.unwrap();
        }

        let sched = SyncScheduler::new(cache, store.clone(), codec(), 3);
        let report = sched.run_tick().await;

        assert_eq!(report.groups_flushed, 40);
        assert_eq!(store.flushed.load(Ordering::SeqCst), 40);
        assert_eq!(store.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ticks_do_not_overlap() {
        let events: EventLog = Arc::default();
        let cache = Arc::new(ScanLoggingCache {
            inner: MemoryCacheStore::new(),
            events: events.clone(),
        });
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(50),
            events: Some(events.clone()),
            ..Default::default()
        });
        cache.set(&codec().encode(1, window()), 2, TTL).await.unwrap();
        cache.set(&codec().encode(2, window()), 3, TTL).await.unwrap();

        let sched = scheduler(cache, store);
        let (first, second) = tokio::join!(sched.run_tick(), sched.run_tick());

        // The second tick only scans once the first tick's flushes are done
        assert_eq!(*events.lock().unwrap(), vec!["scan", "flush", "flush", "scan"]);
        assert_eq!(first.clicks_flushed, 5);
        assert_eq!(second.scanned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_tick_lets_flushes_finish() {
        let cache = Arc::new(MemoryCacheStore::new());
        let store = Arc::new(SlowStore::new(Duration::from_secs(1)));
        for banner_id in 0..12 {
            cache.set(&codec().encode(banner_id, window()), 1, TTL).await.unwrap();
        }

        let sched = Arc::new(SyncScheduler::new(cache, store.clone(), codec(), 2));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sync_scheduler(sched, Duration::from_secs(10), cancel.clone()));

        // Tick fired at 10s; every upsert is still sleeping
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(store.flushed.load(Ordering::SeqCst), 0);
        assert!(store.in_flight.load(Ordering::SeqCst) > 0);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.flushed.load(Ordering::SeqCst), 12);
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
    }
}
