//! Click ingestion - bounded admission queue and the accumulation worker
//!
//! Admission never blocks: when the queue is full the click is dropped and
//! the caller gets `QueueFull` back immediately. A single worker drains the
//! queue and turns every click into one cache mutation on its minute counter.

use super::cache::{CacheError, CacheStore};
use super::keys::KeyCodec;
use super::types::{BannerId, ClickEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why a click was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// Queue at capacity, click dropped
    Full(BannerId),
    /// Worker gone, queue no longer drained
    Closed,
}

/// Producer side of the ingestion queue
#[derive(Debug, Clone)]
pub struct IngestionQueue {
    tx: mpsc::Sender<ClickEvent>,
    capacity: usize,
}

impl IngestionQueue {
    /// Create a queue holding at most `capacity` pending clicks
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ClickEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }

    /// Non-blocking submit
    pub fn submit(&self, banner_id: BannerId, at: DateTime<Utc>) -> Result<(), AdmissionError> {
        match self.tx.try_send(ClickEvent::new(banner_id, at)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AdmissionError::Full(banner_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AdmissionError::Closed),
        }
    }

    /// Clicks admitted but not yet taken by the worker
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What the accumulator did with one click
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulated {
    /// First click of the window, counter created with TTL
    Created,
    /// Existing counter incremented to this value
    Incremented(i64),
}

/// Applies clicks to per-minute cache counters
pub struct Accumulator {
    cache: Arc<dyn CacheStore>,
    codec: KeyCodec,
    counter_ttl: Duration,
}

impl Accumulator {
    pub fn new(cache: Arc<dyn CacheStore>, codec: KeyCodec, counter_ttl: Duration) -> Self {
        Self {
            cache,
            codec,
            counter_ttl,
        }
    }

    /// Create the counter at 1 with a TTL, or increment it (TTL untouched)
    pub async fn apply(&self, event: &ClickEvent) -> Result<Accumulated, CacheError> {
        let key = self.codec.encode(event.banner_id, event.window_start);

        match self.cache.get(&key).await? {
            None => {
                self.cache.set(&key, 1, self.counter_ttl).await?;
                Ok(Accumulated::Created)
            }
            Some(_) => {
                let value = self.cache.increment(&key).await?;
                Ok(Accumulated::Incremented(value))
            }
        }
    }
}

/// Accumulation worker loop
///
/// Runs until cancelled or until every queue sender is gone. Cache failures
/// are logged and the click is discarded; there is no local retry.
pub async fn run_accumulation_worker(
    mut rx: mpsc::Receiver<ClickEvent>,
    accumulator: Accumulator,
    cancel: CancellationToken,
) {
    log::info!("🚀 Accumulation worker started");

    let mut applied = 0u64;
    let mut failed = 0u64;
    let mut last_log_time = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("🛑 Accumulation worker cancelled ({} pending clicks discarded)", rx.len());
                break;
            }

            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    log::warn!("⚠️  Click queue closed, stopping accumulation worker");
                    break;
                };

                match accumulator.apply(&event).await {
                    Ok(outcome) => {
                        applied += 1;
                        log::trace!(
                            "banner {} @ {}: {:?}",
                            event.banner_id,
                            event.window_start,
                            outcome
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        log::warn!(
                            "⚠️  Dropping click for banner {} at {}: {}",
                            event.banner_id,
                            event.window_start,
                            e
                        );
                    }
                }

                // Log throughput every 10 seconds
                if last_log_time.elapsed().as_secs() >= 10 {
                    let per_sec = applied as f64 / last_log_time.elapsed().as_secs_f64();
                    log::info!(
                        "📊 Accumulation rate: {:.1} clicks/sec (failed: {}, queued: {})",
                        per_sec,
                        failed,
                        rx.len()
                    );
                    last_log_time = Instant::now();
                    applied = 0;
                    failed = 0;
                }
            }
        }
    }

    log::info!("✅ Accumulation worker stopped");
}
