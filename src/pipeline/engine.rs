//! Pipeline lifecycle - owns the queue and the three background loops
//!
//! ```text
//! submit_click ──try_send──▶ queue ──▶ accumulation worker ──▶ cache
//!                                                              │
//!                         sync scheduler ◀── scan/claim ───────┤
//!                               │                              │
//!                               ▼                              │
//!                          click store ◀── get_stats    cleanup sweeper
//! ```
//!
//! The loops share one cancellation token. Each runs under a supervisor
//! task: a panic in any loop marks the pipeline crashed, cancels the other
//! loops and makes further submissions fail.

use super::cache::CacheStore;
use super::cleanup::{run_cleanup_sweeper, CleanupSweeper};
use super::config::{ConfigError, PipelineConfig};
use super::db::ClickStore;
use super::ingestion::{run_accumulation_worker, Accumulator, AdmissionError, IngestionQueue};
use super::keys::KeyCodec;
use super::scheduler::{run_sync_scheduler, SyncReport, SyncScheduler};
use super::stats::{StatsError, StatsService};
use super::types::{BannerId, ClickStat};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Ingestion queue at capacity; the click was dropped
    QueueFull { banner_id: BannerId },
    /// Pipeline is shutting down or already stopped
    Stopped,
    /// A background loop panicked
    LoopCrashed { name: &'static str, reason: String },
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::QueueFull { banner_id } => {
                write!(f, "Click queue is full, dropping click for banner {}", banner_id)
            }
            PipelineError::Stopped => write!(f, "Click pipeline is stopped"),
            PipelineError::LoopCrashed { name, reason } => {
                write!(f, "Pipeline loop '{}' crashed: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// Shared crash state written by the supervisors
#[derive(Default)]
struct CrashState {
    signal: CancellationToken,
    first: Mutex<Option<PipelineError>>,
}

impl CrashState {
    fn record(&self, err: PipelineError) {
        if let Ok(mut first) = self.first.lock() {
            first.get_or_insert(err);
        }
        self.signal.cancel();
    }

    fn error(&self) -> Option<PipelineError> {
        self.first.lock().ok().and_then(|first| first.clone())
    }
}

struct SupervisedLoop {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Running click pipeline
pub struct ClickPipeline {
    queue: IngestionQueue,
    scheduler: Arc<SyncScheduler>,
    stats: StatsService,
    cancel: CancellationToken,
    crash: Arc<CrashState>,
    loops: Vec<SupervisedLoop>,
    final_sync_on_stop: bool,
}

impl ClickPipeline {
    /// Start the worker, scheduler and sweeper
    ///
    /// Must be called inside a tokio runtime. The config is validated first;
    /// nothing is spawned when it is rejected.
    pub fn start(
        config: &PipelineConfig,
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ClickStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let codec = KeyCodec::new(&config.live_namespace, &config.processed_namespace);
        let cancel = CancellationToken::new();
        let crash = Arc::new(CrashState::default());

        let (queue, rx) = IngestionQueue::bounded(config.queue_capacity);
        let accumulator = Accumulator::new(cache.clone(), codec.clone(), config.counter_ttl);
        let scheduler = Arc::new(SyncScheduler::new(
            cache.clone(),
            store.clone(),
            codec.clone(),
            config.flush_concurrency,
        ));
        let sweeper = CleanupSweeper::new(cache, codec);

        log::info!("🚀 Starting click pipeline");
        log::info!("   ├─ Queue capacity: {} clicks", config.queue_capacity);
        log::info!("   ├─ Counter TTL: {}s", config.counter_ttl.as_secs());
        log::info!("   ├─ Sync interval: {}ms", config.sync_interval.as_millis());
        log::info!("   ├─ Cleanup interval: {}ms", config.cleanup_interval.as_millis());
        log::info!("   └─ Flush concurrency: {}", config.flush_concurrency);

        let loops = vec![
            supervise(
                "accumulation_worker",
                run_accumulation_worker(rx, accumulator, cancel.clone()),
                &cancel,
                &crash,
            ),
            supervise(
                "sync_scheduler",
                run_sync_scheduler(scheduler.clone(), config.sync_interval, cancel.clone()),
                &cancel,
                &crash,
            ),
            supervise(
                "cleanup_sweeper",
                run_cleanup_sweeper(sweeper, config.cleanup_interval, cancel.clone()),
                &cancel,
                &crash,
            ),
        ];

        Ok(Self {
            queue,
            scheduler,
            stats: StatsService::new(store),
            cancel,
            crash,
            loops,
            final_sync_on_stop: config.final_sync_on_stop,
        })
    }

    /// Admit one click without blocking
    pub fn submit_click(&self, banner_id: BannerId, at: DateTime<Utc>) -> Result<(), PipelineError> {
        if let Some(err) = self.crash.error() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Stopped);
        }

        match self.queue.submit(banner_id, at) {
            Ok(()) => Ok(()),
            Err(AdmissionError::Full(banner_id)) => {
                log::debug!("Click queue full, dropped click for banner {}", banner_id);
                Err(PipelineError::QueueFull { banner_id })
            }
            Err(AdmissionError::Closed) => Err(self.crash.error().unwrap_or(PipelineError::Stopped)),
        }
    }

    /// Stored per-minute stats, passed straight through to the click store
    pub async fn get_stats(
        &self,
        banner_id: BannerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ClickStat>, StatsError> {
        self.stats.get_stats(banner_id, from, to).await
    }

    /// Run a sync tick now; never overlaps with the timer-driven tick
    pub async fn sync_now(&self) -> SyncReport {
        self.scheduler.run_tick().await
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn is_crashed(&self) -> bool {
        self.crash.signal.is_cancelled()
    }

    /// Resolves once a background loop has crashed
    pub fn crashed(&self) -> impl Future<Output = ()> + Send + 'static {
        let signal = self.crash.signal.clone();
        async move { signal.cancelled().await }
    }

    /// Cancel all loops, wait for them to exit, then close the queue
    ///
    /// Returns the first loop crash, if any.
    pub async fn stop(self) -> Result<(), PipelineError> {
        log::info!("🛑 Stopping click pipeline...");
        self.cancel.cancel();

        for supervised in self.loops {
            if let Err(e) = supervised.handle.await {
                log::error!("❌ Supervisor for '{}' failed: {}", supervised.name, e);
            }
        }

        let crashed = self.crash.error();
        if crashed.is_none() && self.final_sync_on_stop {
            log::info!("🔄 Performing final sync...");
            let report = self.scheduler.run_tick().await;
            log::info!("✅ Final sync complete: {} clicks flushed", report.clicks_flushed);
        }

        drop(self.queue);
        log::info!("✅ Click pipeline stopped");

        match crashed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Spawn `fut` and watch it; a panic is recorded as a fatal crash
fn supervise<F>(
    name: &'static str,
    fut: F,
    cancel: &CancellationToken,
    crash: &Arc<CrashState>,
) -> SupervisedLoop
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    let cancel = cancel.clone();
    let crash = crash.clone();

    let handle = tokio::spawn(async move {
        match inner.await {
            Ok(()) => log::debug!("Loop '{}' exited", name),
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                log::error!("💥 Loop '{}' crashed: {}", name, reason);
                crash.record(PipelineError::LoopCrashed { name, reason });
                cancel.cancel();
            }
        }
    });

    SupervisedLoop { name, handle }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
