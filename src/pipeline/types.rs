//! Core data types shared across the trend pipeline
//!
//! `Item` is what the fetch collaborator hands us; `TrendSeries` is what
//! the query side hands back to presentation and push channels.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Opaque per-question metrics carried through to storage
///
/// Not used by any aggregation logic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub view_count: i64,
    pub answer_count: i64,
    pub score: i64,
}

/// A tagged item (question) from the external source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier from the source (idempotence key)
    pub id: String,

    pub title: String,

    /// Creation timestamp (Unix seconds)
    pub creation_date: i64,

    /// Tag names, case-sensitive, order irrelevant
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub metrics: ItemMetrics,
}

impl Item {
    /// Build an item with empty title and zeroed metrics
    pub fn new<I, S>(id: impl Into<String>, creation_date: i64, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            title: String::new(),
            creation_date,
            tags: tags.into_iter().map(Into::into).collect(),
            metrics: ItemMetrics::default(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_metrics(mut self, metrics: ItemMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// One hour bucket in a trend series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePoint {
    /// Bucket key (multiple of 3600)
    pub timestamp: i64,
    pub count: u64,
}

/// Ordered (bucket, count) points for one tag over a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSeries {
    pub tag: String,
    pub points: Vec<TimePoint>,
}

impl TrendSeries {
    pub fn empty(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            points: Vec::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.points.iter().map(|p| p.count).sum()
    }
}

/// Outcome counters for one `ingest` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub accepted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl IngestResult {
    pub fn total(&self) -> usize {
        self.accepted + self.duplicates + self.failed
    }
}

/// What the store did with one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// All tag increments applied and the identifier recorded in the ledger
    Applied,
    /// Identifier already in the ledger (or in flight); nothing touched
    Duplicate,
}
