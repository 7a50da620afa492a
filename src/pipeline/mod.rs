//! # Tag trend pipeline
//!
//! Turns a stream of tagged questions into per-tag time series:
//! 1. A `QuestionSource` fetches the newest items
//! 2. `IngestionPipeline` applies each item exactly once (ledger-guarded)
//! 3. The `TrendStore` keeps a cumulative count and hourly buckets per tag
//! 4. `QueryEngine` answers top-tag and trend queries over the store
//! 5. `TrendBroadcaster` pushes a snapshot after every ingestion run
//!
//! `IngestionScheduler` drives steps 1-5, one run at a time.
//!
//! ## Invariants
//!
//! - For every tag, cumulative count == sum of its bucket counts
//! - An identifier present in the ledger never changes any count again
//! - Bucket keys are multiples of 3600 (UTC hour starts)
//!
//! ## Schema Reference
//!
//! SQLite tables live in `/sql/` and are applied by `db::run_schema_migrations`:
//! - `tag_counts`, `tag_buckets` → `TrendStore`
//! - `ingested_items` → `IngestionLedger`
//! - `questions`, `question_tags` → `questions_by_tag`
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (Item, TimePoint, TrendSeries, IngestResult)
//! - `bucket` - Hour bucket arithmetic
//! - `error` - Error enums per layer
//! - `store` - Store and ledger traits, in-memory implementation
//! - `db` - SQLite implementation and migrations
//! - `ingestion` - Idempotent batch ingestion
//! - `query` - Query engine and trend cache
//! - `broadcast` - Publisher trait and trend broadcaster
//! - `source` - Question sources (Stack Exchange, static)
//! - `scheduler` - Single-flight periodic/on-demand runs
//! - `config` - Environment configuration

pub mod types;
pub mod bucket;
pub mod error;
pub mod store;
pub mod db;
pub mod ingestion;
pub mod query;
pub mod broadcast;
pub mod source;
pub mod scheduler;
pub mod config;

// Re-export commonly used types
pub use types::{ApplyOutcome, IngestResult, Item, ItemMetrics, TimePoint, TrendSeries};
pub use error::{ItemError, PublishError, SchedulerError, SourceError, StoreError};
pub use store::{IngestionLedger, MemoryTrendStore, TrendStore};
pub use db::SqliteTrendStore;
pub use ingestion::IngestionPipeline;
pub use query::{QueryEngine, TrendCache, TrendMap};
pub use broadcast::{BroadcastPublisher, BroadcastSettings, TrendBroadcaster, TrendPublisher, TrendUpdate};
pub use source::{QuestionSource, SourceSettings, StackExchangeSource, StaticSource};
pub use scheduler::{IngestionScheduler, RunReport, TriggerOutcome};
pub use config::{StoreKind, TagflowConfig};
