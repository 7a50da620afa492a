//! Tagflow Runtime - periodic ingestion and trend broadcast
//!
//! This binary wires the trend pipeline together:
//! - Opens the configured store (SQLite with schema migrations, or memory)
//! - Builds the ingestion pipeline, query engine and broadcaster
//! - Spawns the single-flight ingestion scheduler
//! - Logs every published trend snapshot
//! - Optionally retires old ledger entries
//!
//! Usage:
//!   cargo run --release --bin tagflow_runtime
//!
//! Environment variables:
//!   TAGFLOW_STORE - memory | sqlite (default: sqlite)
//!   TAGFLOW_DB_PATH - SQLite database path (default: data/tagflow.db)
//!   FETCH_INTERVAL_MS - Ingestion interval (default: 60000)
//!   STACKEXCHANGE_SITE - Site to poll (default: stackoverflow)
//!   BROADCAST_TOP_N / BROADCAST_HOURS - Snapshot shape (default: 10 / 24)
//!   LEDGER_RETENTION_HOURS - Ledger retention, 0 = forever (default: 0)

use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tagflow::pipeline::{
    bucket::BUCKET_SECONDS,
    config::{StoreKind, TagflowConfig},
    BroadcastPublisher, IngestionLedger, IngestionPipeline, IngestionScheduler, MemoryTrendStore, QueryEngine,
    SqliteTrendStore, StackExchangeSource, TrendBroadcaster, TrendStore,
};
use tokio::sync::{broadcast, watch};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::init();

    info!("🚀 Tagflow Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TagflowConfig::from_env();

    info!("✅ Configuration loaded");
    info!("   ├─ Store: {:?}", config.store);
    info!("   ├─ Site: {}", config.site);
    info!("   ├─ Fetch interval: {}ms", config.fetch_interval_ms);
    info!("   ├─ Broadcast: top {} tags over {}h on {}", config.broadcast_top_n, config.broadcast_hours, config.broadcast_channel);
    info!("   └─ Trend cache TTL: {}ms", config.trend_cache_ttl_ms);

    // Initialize store
    info!("🔧 Initializing store...");
    let store: Arc<dyn TrendStore> = match config.store {
        StoreKind::Sqlite => {
            info!("   └─ Database: {}", config.db_path);
            Arc::new(SqliteTrendStore::open(&config.db_path)?)
        }
        StoreKind::Memory => {
            warn!("⚠️  In-memory store: counts are lost on restart");
            Arc::new(MemoryTrendStore::new())
        }
    };
    info!("✅ Store ready ({} ledger entries)", store.ledger_len()?);

    let pipeline = Arc::new(IngestionPipeline::new(store.clone()));
    let query = Arc::new(QueryEngine::new(store.clone(), config.trend_cache_ttl()));

    let publisher = Arc::new(BroadcastPublisher::new(16));
    let broadcaster = Arc::new(TrendBroadcaster::new(
        query.clone(),
        publisher.clone(),
        config.broadcast_settings(),
    ));

    let source = Arc::new(StackExchangeSource::new(config.source_settings())?);
    let scheduler = Arc::new(
        IngestionScheduler::new(source, pipeline, query, config.fetch_interval())
            .with_broadcaster(broadcaster),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn background tasks
    info!("🚀 Spawning background tasks...");

    // Task 1: Periodic ingestion (first run fires immediately)
    let scheduler_handle = tokio::spawn(scheduler.clone().run_periodic(shutdown_rx.clone()));
    info!("   ├─ ✅ Ingestion scheduler spawned");

    // Task 2: Snapshot subscriber
    let mut updates = publisher.subscribe();
    let mut subscriber_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(update) => {
                        let summary: Vec<String> = update
                            .trends
                            .iter()
                            .map(|(tag, series)| format!("{}={}", tag, series.total()))
                            .collect();
                        info!("📊 {} @ {}: {}", update.channel, update.published_at, summary.join(", "));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("⚠️  Snapshot subscriber lagged, skipped {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = subscriber_shutdown.changed() => break,
            }
        }
    });
    info!("   ├─ ✅ Snapshot subscriber spawned");

    // Task 3: Ledger retention
    if let Some(retention_secs) = config.ledger_retention_secs() {
        let retention_store = store.clone();
        let mut retention_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(BUCKET_SECONDS as u64));
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let cutoff = chrono::Utc::now().timestamp().saturating_sub(retention_secs);
                        match retention_store.retire_applied_before(cutoff) {
                            Ok(0) => {}
                            Ok(n) => info!("🧹 Retired {} ledger entries older than {}h", n, retention_secs / BUCKET_SECONDS),
                            Err(e) => error!("❌ Ledger retention failed: {}", e),
                        }
                    }
                    _ = retention_shutdown.changed() => break,
                }
            }
        });
        info!("   └─ ✅ Ledger retention spawned ({}h)", config.ledger_retention_hours);
    } else {
        info!("   └─ Ledger retention disabled");
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    shutdown_tx.send(true).ok();

    if tokio::time::timeout(Duration::from_secs(5), scheduler_handle).await.is_err() {
        warn!("⚠️  Scheduler did not stop within 5s");
    }

    info!("✅ Tagflow runtime stopped ({} runs completed)", scheduler.runs_completed());
    Ok(())
}
