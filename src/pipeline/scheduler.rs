//! Ingestion scheduler - periodic and on-demand runs, single-flight
//!
//! A run is: fetch from the source, ingest the batch, invalidate the query
//! cache, broadcast a fresh snapshot.
//!
//! Only one run executes at a time. A trigger that arrives while a run is
//! in flight (periodic or manual) is queued; any number of queued triggers
//! coalesce into exactly one follow-up run, executed by the task that owns
//! the current run as soon as it finishes.
//!
//! Dropping a run mid-flight releases the single-flight slot, unless a
//! follow-up was queued behind it: that one is handed to a fresh task.
//! Shutdown through `run_periodic` is the only path that discards it.
//! Items already applied stay applied; the ledger makes the next run skip
//! them.

use super::broadcast::TrendBroadcaster;
use super::error::SchedulerError;
use super::ingestion::IngestionPipeline;
use super::query::QueryEngine;
use super::source::QuestionSource;
use super::types::IngestResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Summary of one completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub result: IngestResult,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This call executed the run (plus any follow-up queued meanwhile);
    /// carries the report of the last one
    Ran(RunReport),
    /// A run was already in flight; one follow-up run is guaranteed
    Queued,
}

#[derive(Debug, Default)]
struct FlightState {
    running: bool,
    pending: bool,
    /// Set on shutdown; queued follow-ups are discarded from then on
    closed: bool,
}

#[derive(Debug, Default)]
struct Flight {
    state: Mutex<FlightState>,
    runs_completed: AtomicU64,
}

/// Everything a run needs, cloneable so a follow-up can outlive its caller
#[derive(Clone)]
struct RunContext {
    source: Arc<dyn QuestionSource>,
    pipeline: Arc<IngestionPipeline>,
    query: Arc<QueryEngine>,
    broadcaster: Option<Arc<TrendBroadcaster>>,
    flight: Arc<Flight>,
}

/// Owns the single-flight slot while a run future is alive
///
/// If the future is dropped mid-run, a queued follow-up is handed to a new
/// task so `Queued` callers still get their run; otherwise the slot is freed.
struct FlightGuard<'a> {
    ctx: &'a RunContext,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.ctx.flight.state.lock();
        if state.pending && !state.closed {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                // Slot stays taken; the spawned task releases it
                state.pending = false;
                drop(state);

                log::info!("🔁 Run abandoned by its caller, handing queued refresh to a new task");
                let ctx = self.ctx.clone();
                handle.spawn(async move {
                    if let Err(e) = ctx.drive().await {
                        log::error!("❌ Queued refresh failed: {}", e);
                    }
                });
                return;
            }
        }

        // Without a runtime the flag survives and the next trigger covers it
        state.running = false;
        if state.closed {
            state.pending = false;
        }
    }
}

impl RunContext {
    /// Run until no follow-up is queued; the caller must hold the slot
    async fn drive(self) -> Result<RunReport, SchedulerError> {
        let mut guard = FlightGuard {
            ctx: &self,
            armed: true,
        };

        loop {
            let outcome = self.run_cycle().await;

            let rerun = {
                let mut state = self.flight.state.lock();
                if state.pending && !state.closed {
                    state.pending = false;
                    true
                } else {
                    state.running = false;
                    state.pending = false;
                    false
                }
            };

            if !rerun {
                guard.armed = false;
                return outcome;
            }

            if let Err(e) = outcome {
                log::warn!("⚠️  Run failed, executing queued refresh anyway: {}", e);
            }
            log::info!("🔁 Executing queued refresh");
        }
    }

    async fn run_cycle(&self) -> Result<RunReport, SchedulerError> {
        let started = Instant::now();
        log::info!("🔄 Fetching new questions");

        let items = self.source.fetch_recent().await.map_err(|e| {
            log::error!("❌ Fetch failed, retrying next cycle: {}", e);
            SchedulerError::IngestRunFailed(e.to_string())
        })?;

        let result = self.pipeline.ingest(&items);
        self.query.invalidate_cache();
        self.flight.runs_completed.fetch_add(1, Ordering::SeqCst);

        if let Some(broadcaster) = &self.broadcaster {
            if let Err(e) = broadcaster.broadcast() {
                log::warn!("⚠️  Trend snapshot not computed: {}", e);
            }
        }

        let report = RunReport {
            fetched: items.len(),
            result,
            elapsed: started.elapsed(),
        };

        log::info!(
            "✅ Run complete: {} fetched, {} accepted, {} duplicates, {} failed | {}ms",
            report.fetched,
            result.accepted,
            result.duplicates,
            result.failed,
            report.elapsed.as_millis()
        );

        Ok(report)
    }
}

pub struct IngestionScheduler {
    ctx: RunContext,
    interval: Duration,
}

impl IngestionScheduler {
    pub fn new(
        source: Arc<dyn QuestionSource>,
        pipeline: Arc<IngestionPipeline>,
        query: Arc<QueryEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx: RunContext {
                source,
                pipeline,
                query,
                broadcaster: None,
                flight: Arc::new(Flight::default()),
            },
            interval,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<TrendBroadcaster>) -> Self {
        self.ctx.broadcaster = Some(broadcaster);
        self
    }

    /// Runs that reached ingestion completion
    pub fn runs_completed(&self) -> u64 {
        self.ctx.flight.runs_completed.load(Ordering::SeqCst)
    }

    /// True while a run or its queued follow-up holds the slot
    pub fn is_running(&self) -> bool {
        self.ctx.flight.state.lock().running
    }

    /// Run now, or queue a follow-up if a run is in flight
    ///
    /// Dropping the returned future before it completes does not cancel a
    /// follow-up other callers were promised.
    pub async fn trigger(&self) -> Result<TriggerOutcome, SchedulerError> {
        {
            let mut state = self.ctx.flight.state.lock();
            if state.running {
                state.pending = true;
                log::info!("⏳ Ingestion run in flight, refresh queued");
                return Ok(TriggerOutcome::Queued);
            }
            state.running = true;
            // This run covers anything left queued by an abandoned one
            state.pending = false;
        }

        self.ctx.clone().drive().await.map(TriggerOutcome::Ran)
    }

    /// Fire a manual refresh without waiting for it
    pub fn request_refresh(self: &Arc<Self>) -> JoinHandle<Result<TriggerOutcome, SchedulerError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.trigger().await })
    }

    /// Stop honoring queued follow-ups
    fn close(&self) {
        let mut state = self.ctx.flight.state.lock();
        state.closed = true;
        state.pending = false;
    }

    /// Periodic loop; returns when `shutdown` flips to true or its sender is dropped
    ///
    /// The first tick fires immediately. A run in progress when shutdown
    /// arrives is dropped at its next await point and any refresh queued
    /// behind it is discarded.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!("⏰ Starting ingestion scheduler (interval: {}ms)", self.interval.as_millis());

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = timer.tick() => {
                    let run = self.trigger();
                    tokio::pin!(run);

                    tokio::select! {
                        outcome = &mut run => match outcome {
                            Ok(TriggerOutcome::Ran(_)) => {}
                            Ok(TriggerOutcome::Queued) => log::debug!("Periodic tick coalesced into running refresh"),
                            Err(e) => log::error!("❌ {}", e),
                        },
                        _ = shutdown.changed() => {
                            log::warn!("⚠️  Shutdown during ingestion run, abandoning it");
                            // Must precede dropping `run`
                            self.close();
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.close();
        log::info!("✅ Ingestion scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::SourceError;
    use crate::pipeline::source::StaticSource;
    use crate::pipeline::store::{MemoryTrendStore, TrendStore};
    use crate::pipeline::types::Item;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, Semaphore};

    /// Blocks every fetch until the test releases it
    struct GatedSource {
        calls: AtomicUsize,
        entered: Notify,
        release: Semaphore,
    }

    impl GatedSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl QuestionSource for GatedSource {
        async fn fetch_recent(&self) -> Result<Vec<Item>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
            Ok(vec![Item::new(format!("q{}", n), 3600, ["rust"])])
        }
    }

    struct DownSource;

    #[async_trait]
    impl QuestionSource for DownSource {
        async fn fetch_recent(&self) -> Result<Vec<Item>, SourceError> {
            Err(SourceError::Status(503))
        }
    }

    fn scheduler_with(source: Arc<dyn QuestionSource>) -> (Arc<MemoryTrendStore>, Arc<IngestionScheduler>) {
        let store = Arc::new(MemoryTrendStore::new());
        let pipeline = Arc::new(IngestionPipeline::new(store.clone()));
        let query = Arc::new(QueryEngine::new(store.clone(), Duration::from_secs(60)));
        let scheduler = IngestionScheduler::new(source, pipeline, query, Duration::from_millis(50));
        (store, Arc::new(scheduler))
    }

    #[tokio::test]
    async fn test_trigger_runs_when_idle() {
        let source = Arc::new(StaticSource::new(vec![
            Item::new("1", 100, ["rust"]),
            Item::new("2", 100, ["rust"]),
        ]));
        let (store, scheduler) = scheduler_with(source);

        match scheduler.trigger().await.unwrap() {
            TriggerOutcome::Ran(report) => {
                assert_eq!(report.fetched, 2);
                assert_eq!(report.result.accepted, 2);
            }
            TriggerOutcome::Queued => panic!("idle scheduler should run"),
        }

        // Same batch again is a no-op for the counters
        scheduler.trigger().await.unwrap();
        assert_eq!(store.cumulative_count("rust").unwrap(), 2);
        assert_eq!(scheduler.runs_completed(), 2);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_manual_trigger_during_run_is_queued_once() {
        let source = Arc::new(GatedSource::new());
        let (store, scheduler) = scheduler_with(source.clone());

        let first = scheduler.request_refresh();
        source.entered.notified().await;
        assert!(scheduler.is_running());

        // Two triggers while in flight coalesce into one follow-up run
        assert_eq!(scheduler.trigger().await.unwrap(), TriggerOutcome::Queued);
        assert_eq!(scheduler.trigger().await.unwrap(), TriggerOutcome::Queued);

        source.release.add_permits(2);
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, TriggerOutcome::Ran(_)));

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.runs_completed(), 2);
        assert_eq!(store.cumulative_count("rust").unwrap(), 2);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_dropped_run_releases_slot() {
        let source = Arc::new(GatedSource::new());
        let (_store, scheduler) = scheduler_with(source.clone());

        let timed_out = tokio::time::timeout(Duration::from_millis(20), scheduler.trigger()).await;
        assert!(timed_out.is_err());
        assert!(!scheduler.is_running());

        source.release.add_permits(1);
        assert!(matches!(scheduler.trigger().await.unwrap(), TriggerOutcome::Ran(_)));
    }

    async fn wait_until_idle(scheduler: &IngestionScheduler) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_queued_refresh_survives_abandoned_owner() {
        let source = Arc::new(GatedSource::new());
        let (store, scheduler) = scheduler_with(source.clone());

        let owner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { tokio::time::timeout(Duration::from_millis(50), scheduler.trigger()).await })
        };
        source.entered.notified().await;
        assert_eq!(scheduler.trigger().await.unwrap(), TriggerOutcome::Queued);

        // Owner gives up while its fetch is still blocked
        assert!(owner.await.unwrap().is_err());
        assert!(scheduler.is_running());

        source.release.add_permits(1);
        wait_until_idle(&scheduler).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.runs_completed(), 1);
        assert_eq!(store.cumulative_count("rust").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_discards_queued_refresh() {
        let source = Arc::new(GatedSource::new());
        let (store, scheduler) = scheduler_with(source.clone());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run_periodic(rx));
        source.entered.notified().await;
        assert_eq!(scheduler.trigger().await.unwrap(), TriggerOutcome::Queued);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!scheduler.is_running());
        source.release.add_permits(1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.runs_completed(), 0);
        assert_eq!(store.cumulative_count("rust").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_run_failed() {
        let (_store, scheduler) = scheduler_with(Arc::new(DownSource));

        let result = scheduler.trigger().await;
        assert!(matches!(result, Err(SchedulerError::IngestRunFailed(_))));
        assert_eq!(scheduler.runs_completed(), 0);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_shutdown() {
        let source = Arc::new(StaticSource::new(vec![Item::new("1", 100, ["go"])]));
        let (store, scheduler) = scheduler_with(source);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run_periodic(rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(scheduler.runs_completed() >= 2);
        assert_eq!(store.cumulative_count("go").unwrap(), 1);
    }
}
