use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::StatsConfig;
use crate::error::CrawlResult;
use crate::storage::{ErrorLogRow, ExecutionRepository, PhaseStats, StatsUpdate};

/// Lock-free per-execution counter deltas. Hot-path recording is atomic
/// increments only; the flush loop drains buckets with `swap(0)` so a
/// recorded delta lands in exactly one flush.
#[derive(Default)]
struct DeltaBucket {
    urls_processed: AtomicI64,
    urls_discovered: AtomicI64,
    items_extracted: AtomicI64,
    errors: AtomicI64,
    phases: DashMap<String, PhaseBucket>,
}

#[derive(Default)]
struct PhaseBucket {
    processed: AtomicI64,
    errors: AtomicI64,
    duration_ms: AtomicI64,
}

impl DeltaBucket {
    fn drain(&self, execution_id: &str) -> Option<StatsUpdate> {
        let mut update = StatsUpdate {
            execution_id: execution_id.to_string(),
            urls_processed: self.urls_processed.swap(0, Ordering::AcqRel),
            urls_discovered: self.urls_discovered.swap(0, Ordering::AcqRel),
            items_extracted: self.items_extracted.swap(0, Ordering::AcqRel),
            errors: self.errors.swap(0, Ordering::AcqRel),
            ..StatsUpdate::default()
        };

        for entry in self.phases.iter() {
            let delta = PhaseStats {
                processed: entry.processed.swap(0, Ordering::AcqRel),
                errors: entry.errors.swap(0, Ordering::AcqRel),
                duration_ms: entry.duration_ms.swap(0, Ordering::AcqRel),
            };
            if delta != PhaseStats::default() {
                update.phases.insert(entry.key().clone(), delta);
            }
        }

        let empty = update.urls_processed == 0
            && update.urls_discovered == 0
            && update.items_extracted == 0
            && update.errors == 0
            && update.phases.is_empty();
        (!empty).then_some(update)
    }
}

/// Batches counter updates and error rows, writing them to storage on a
/// timer instead of per event. One flush is one transaction regardless of
/// how many executions accumulated deltas.
pub struct StatsAggregator {
    repo: ExecutionRepository,
    buckets: DashMap<String, DeltaBucket>,
    error_buffer: Mutex<Vec<ErrorLogRow>>,
    flush_interval: Duration,
    max_buffered_errors: usize,
}

impl StatsAggregator {
    pub fn new(repo: ExecutionRepository, config: &StatsConfig) -> Arc<Self> {
        Arc::new(Self {
            repo,
            buckets: DashMap::new(),
            error_buffer: Mutex::new(Vec::new()),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_buffered_errors: config.max_buffered_errors,
        })
    }

    pub fn record_url_processed(&self, execution_id: &str) {
        self.bucket(execution_id).urls_processed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_urls_discovered(&self, execution_id: &str, count: i64) {
        self.bucket(execution_id).urls_discovered.fetch_add(count, Ordering::AcqRel);
    }

    pub fn record_items_extracted(&self, execution_id: &str, count: i64) {
        self.bucket(execution_id).items_extracted.fetch_add(count, Ordering::AcqRel);
    }

    pub fn record_task_error(&self, execution_id: &str) {
        self.bucket(execution_id).errors.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_phase(&self, execution_id: &str, phase_id: &str, delta: PhaseStats) {
        let bucket = self.bucket(execution_id);
        let phase = bucket.phases.entry(phase_id.to_string()).or_default();
        phase.processed.fetch_add(delta.processed, Ordering::AcqRel);
        phase.errors.fetch_add(delta.errors, Ordering::AcqRel);
        phase.duration_ms.fetch_add(delta.duration_ms, Ordering::AcqRel);
    }

    pub async fn record_error_log(&self, row: ErrorLogRow) {
        let mut buffer = self.error_buffer.lock().await;
        if buffer.len() >= self.max_buffered_errors {
            warn!("Error-log buffer full, dropping oldest row");
            buffer.remove(0);
        }
        buffer.push(row);
    }

    fn bucket(&self, execution_id: &str) -> dashmap::mapref::one::Ref<'_, String, DeltaBucket> {
        self.buckets.entry(execution_id.to_string()).or_default().downgrade()
    }

    /// Drain everything accumulated since the last flush and write it in
    /// one storage round trip.
    pub async fn flush_now(&self) -> CrawlResult<()> {
        let updates: Vec<StatsUpdate> = self
            .buckets
            .iter()
            .filter_map(|entry| entry.value().drain(entry.key()))
            .collect();

        let errors: Vec<ErrorLogRow> = {
            let mut buffer = self.error_buffer.lock().await;
            std::mem::take(&mut *buffer)
        };

        if updates.is_empty() && errors.is_empty() {
            return Ok(());
        }
        debug!("Flushing {} stats update(s), {} error row(s)", updates.len(), errors.len());
        self.repo.batch_update_stats(&updates).await?;
        self.repo.batch_insert_errors(&errors).await?;
        Ok(())
    }

    /// Background flush loop; performs a final flush when `shutdown`
    /// flips so no recorded delta is lost at execution end.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = aggregator.flush_now().await {
                            error!("Stats flush failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            if let Err(e) = aggregator.flush_now().await {
                                error!("Final stats flush failed: {}", e);
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Forget an execution's bucket once it reaches a terminal state.
    pub fn retire(&self, execution_id: &str) {
        self.buckets.remove(execution_id);
    }
}
